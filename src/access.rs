//! Region-access declarations.
//!
//! For every lifecycle phase an operator declares which regions its shards
//! touch and how. The scheduler derives ordering between launches from these
//! declarations alone: a write serializes against every later read or write
//! of the same region, and read-write gradient declarations are accumulation
//! targets that are never overwritten.
//!
//! Declarations are minimal. A region shared by two roles (an in-place
//! output, or operands living in one region) is declared once. Operands
//! share a region when they are the same tensor, and also when one is a
//! cast view of the other.
//!
//! | phase | in-place | same region | declarations |
//! |---|---|---|---|
//! | forward | yes | yes | in1 (rw) |
//! | forward | yes | no | in1 (rw), in2 (ro) |
//! | forward | no | yes | in1 (ro), out (wo) |
//! | forward | no | no | in1 (ro), in2 (ro), out (wo) |
//!
//! Backward always starts with the output gradient, then operand-1, then
//! operand-1's gradient (omitted when in-place, where it is the output
//! gradient), then operand-2 and its gradient (omitted when both operands
//! share a region).

use crate::error::{OpError, Result};
use crate::operator::ElementBinary;
use crate::tensors::{MachineView, ParallelTensor, RegionId};

/// Lifecycle phase of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Forward,
    Backward,
}

/// How a phase touches a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

impl AccessMode {
    /// True for modes that modify the region.
    pub const fn writes(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteOnly)
    }

    /// True for modes that observe the region's previous contents.
    pub const fn reads(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }
}

/// Which field of a tensor a declaration refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Data,
    Grad,
}

/// Which operator tensor owns the declared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Input1,
    Input2,
    Output,
}

/// One access declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequirement {
    pub role: Role,
    pub field: Field,
    pub mode: AccessMode,
    pub region: RegionId,
    /// Partition degrees of the owning tensor.
    pub degrees: Vec<usize>,
    /// Placement of the owning tensor's shards.
    pub view: MachineView,
}

/// Ordered declarations for one phase of one operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPlan {
    pub phase: Phase,
    pub requirements: Vec<RegionRequirement>,
}

impl AccessPlan {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            requirements: Vec::with_capacity(5),
        }
    }

    fn data(&mut self, role: Role, tensor: &ParallelTensor, mode: AccessMode) {
        self.requirements.push(RegionRequirement {
            role,
            field: Field::Data,
            mode,
            region: tensor.region,
            degrees: tensor.degrees(),
            view: tensor.machine_view.clone(),
        });
    }

    fn grad(&mut self, role: Role, tensor: &ParallelTensor, mode: AccessMode) -> Result<()> {
        let region = tensor
            .region_grad
            .ok_or(OpError::MissingGradient(tensor.id.0))?;
        self.requirements.push(RegionRequirement {
            role,
            field: Field::Grad,
            mode,
            region,
            degrees: tensor.degrees(),
            view: tensor.machine_view.clone(),
        });
        Ok(())
    }

    /// Number of declarations.
    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    /// True if nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Access modes in declaration order.
    pub fn modes(&self) -> Vec<AccessMode> {
        self.requirements.iter().map(|r| r.mode).collect()
    }
}

/// Checks that an in-place output really is operand-1.
fn ensure_aliased(op: &ElementBinary) -> Result<()> {
    let (in1, out) = (op.input(0), op.output());
    if out.region != in1.region {
        return Err(OpError::AliasViolation("region"));
    }
    if !out.same_partitioning(in1) {
        return Err(OpError::AliasViolation("partition"));
    }
    Ok(())
}

/// Declarations for the init phase.
///
/// # Errors
/// `AliasViolation` if the operator is in-place but its output is not operand-1.
pub fn init_plan(op: &ElementBinary) -> Result<AccessPlan> {
    let mut plan = AccessPlan::new(Phase::Init);
    let in1_mode = if op.inplace_a() {
        AccessMode::ReadWrite
    } else {
        AccessMode::ReadOnly
    };
    plan.data(Role::Input1, op.input(0), in1_mode);
    if !op.same_operand_regions() {
        plan.data(Role::Input2, op.input(1), AccessMode::ReadOnly);
    }
    if op.inplace_a() {
        ensure_aliased(op)?;
    } else {
        plan.data(Role::Output, op.output(), AccessMode::WriteOnly);
    }
    Ok(plan)
}

/// Declarations for the forward phase.
///
/// # Errors
/// `AliasViolation` if the operator is in-place but its output is not operand-1.
pub fn forward_plan(op: &ElementBinary) -> Result<AccessPlan> {
    let mut plan = AccessPlan::new(Phase::Forward);
    if op.inplace_a() {
        ensure_aliased(op)?;
        plan.data(Role::Input1, op.input(0), AccessMode::ReadWrite);
        if !op.same_operand_regions() {
            plan.data(Role::Input2, op.input(1), AccessMode::ReadOnly);
        }
    } else {
        plan.data(Role::Input1, op.input(0), AccessMode::ReadOnly);
        if !op.same_operand_regions() {
            plan.data(Role::Input2, op.input(1), AccessMode::ReadOnly);
        }
        plan.data(Role::Output, op.output(), AccessMode::WriteOnly);
    }
    Ok(plan)
}

/// Declarations for the backward phase.
///
/// # Errors
/// `MissingGradient` if a declared tensor has no gradient region, or
/// `AliasViolation` for a broken in-place output.
pub fn backward_plan(op: &ElementBinary) -> Result<AccessPlan> {
    let mut plan = AccessPlan::new(Phase::Backward);
    let (in1, in2, out) = (op.input(0), op.input(1), op.output());
    if op.inplace_a() {
        ensure_aliased(op)?;
        // doubles as operand-1's gradient
        plan.grad(Role::Output, out, AccessMode::ReadWrite)?;
        plan.data(Role::Input1, in1, AccessMode::ReadOnly);
    } else {
        plan.grad(Role::Output, out, AccessMode::ReadOnly)?;
        plan.data(Role::Input1, in1, AccessMode::ReadOnly);
        plan.grad(Role::Input1, in1, AccessMode::ReadWrite)?;
    }
    if !op.same_operand_regions() {
        plan.data(Role::Input2, in2, AccessMode::ReadOnly);
        plan.grad(Role::Input2, in2, AccessMode::ReadWrite)?;
    }
    Ok(plan)
}

//! Named-role resolution of the regions delivered to a phase.
//!
//! A shard receives its regions as an ordered list laid out by the access
//! plan (see [`crate::access`]). The resolvers here turn that list into a
//! structure with one field per role, cloning a handle into every role it
//! plays, and report which roles alias so kernels never have to infer it
//! from handle identity.
//!
//! The resolvers are generic over the handle type: execution resolves shard
//! buffers and domains, the cost estimator resolves arena buffers.

use crate::access::Phase;
use crate::error::{OpError, Result};

/// The two flags that decide an operator's region layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperatorFlags {
    /// Output aliases operand-1.
    pub inplace_a: bool,
    /// Both operands live in one data region: the same partitioned tensor,
    /// or two views of one region such as a cast and its source.
    pub same_operand_regions: bool,
}

/// Aliasing among the init/forward roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aliasing {
    pub out_is_in1: bool,
    pub in2_is_in1: bool,
}

/// Init/forward roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandRegions<H> {
    pub in1: H,
    pub in2: H,
    pub out: H,
    pub aliasing: Aliasing,
}

/// Aliasing among the backward roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradAliasing {
    /// Operand-1's gradient is the output gradient (in-place).
    pub in1_grad_is_out_grad: bool,
    /// Operand-2 and its gradient are operand-1's.
    pub in2_is_in1: bool,
}

/// Backward roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardRegions<H> {
    pub out_grad: H,
    pub in1: H,
    pub in1_grad: H,
    pub in2: H,
    pub in2_grad: H,
    pub aliasing: GradAliasing,
}

/// Regions an init or forward shard receives.
pub const fn operand_region_count(flags: OperatorFlags) -> usize {
    1 + !flags.same_operand_regions as usize + !flags.inplace_a as usize
}

/// Regions a backward shard receives.
pub const fn backward_region_count(inplace_a: bool, same_region: bool) -> usize {
    match (inplace_a, same_region) {
        (true, true) => 2,
        (true, false) => 4,
        (false, true) => 3,
        (false, false) => 5,
    }
}

fn ensure_count(phase: Phase, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(OpError::AccessPlanMismatch {
            phase,
            expected,
            got,
        });
    }
    Ok(())
}

/// Resolves init/forward handles.
///
/// | inplace_a | same region | handles | mapping |
/// |---|---|---|---|
/// | yes | yes | 1 | out = in1 = in2 = h0 |
/// | yes | no | 2 | out = in1 = h0, in2 = h1 |
/// | no | yes | 2 | in1 = in2 = h0, out = h1 |
/// | no | no | 3 | in1 = h0, in2 = h1, out = h2 |
///
/// # Errors
/// `AccessPlanMismatch` if the handle count disagrees with the table.
pub fn resolve_operands<H: Clone>(
    phase: Phase,
    flags: OperatorFlags,
    handles: &[H],
) -> Result<OperandRegions<H>> {
    ensure_count(phase, operand_region_count(flags), handles.len())?;
    let in1 = handles[0].clone();
    let (in2, next) = if flags.same_operand_regions {
        (in1.clone(), 1)
    } else {
        (handles[1].clone(), 2)
    };
    let out = if flags.inplace_a {
        in1.clone()
    } else {
        handles[next].clone()
    };
    Ok(OperandRegions {
        in1,
        in2,
        out,
        aliasing: Aliasing {
            out_is_in1: flags.inplace_a,
            in2_is_in1: flags.same_operand_regions,
        },
    })
}

/// Resolves init handles; see [`resolve_operands`].
///
/// # Errors
/// `AccessPlanMismatch`.
pub fn resolve_init<H: Clone>(flags: OperatorFlags, handles: &[H]) -> Result<OperandRegions<H>> {
    resolve_operands(Phase::Init, flags, handles)
}

/// Resolves forward handles; see [`resolve_operands`].
///
/// # Errors
/// `AccessPlanMismatch`.
pub fn resolve_forward<H: Clone>(flags: OperatorFlags, handles: &[H]) -> Result<OperandRegions<H>> {
    resolve_operands(Phase::Forward, flags, handles)
}

/// Resolves backward handles.
///
/// `same_region` is whether the two operands share a data region, which may
/// hold even when they are distinct partitioned tensors.
///
/// | inplace_a | same region | handles | layout |
/// |---|---|---|---|
/// | yes | yes | 2 | out_grad (= in1_grad = in2_grad), in1 (= in2) |
/// | yes | no | 4 | out_grad (= in1_grad), in1, in2, in2_grad |
/// | no | yes | 3 | out_grad, in1 (= in2), in1_grad (= in2_grad) |
/// | no | no | 5 | out_grad, in1, in1_grad, in2, in2_grad |
///
/// # Errors
/// `AccessPlanMismatch` if the handle count disagrees with the table.
pub fn resolve_backward<H: Clone>(
    inplace_a: bool,
    same_region: bool,
    handles: &[H],
) -> Result<BackwardRegions<H>> {
    ensure_count(
        Phase::Backward,
        backward_region_count(inplace_a, same_region),
        handles.len(),
    )?;
    let out_grad = handles[0].clone();
    let in1 = handles[1].clone();
    let (in1_grad, next) = if inplace_a {
        (out_grad.clone(), 2)
    } else {
        (handles[2].clone(), 3)
    };
    let (in2, in2_grad) = if same_region {
        (in1.clone(), in1_grad.clone())
    } else {
        (handles[next].clone(), handles[next + 1].clone())
    };
    Ok(BackwardRegions {
        out_grad,
        in1,
        in1_grad,
        in2,
        in2_grad,
        aliasing: GradAliasing {
            in1_grad_is_out_grad: inplace_a,
            in2_is_in1: same_region,
        },
    })
}

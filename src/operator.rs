//! The partitioned elementwise-binary operator.
//!
//! # Two-Phase Construction
//!
//! An operator is first built as a [`ProposedBinary`] while the graph is
//! assembled. The proposal is owned by whoever finalizes the graph, and that
//! is the only place the aliasing decision can change (through
//! [`InplaceOutput`]). [`ProposedBinary::finalize`] then produces an immutable
//! [`ElementBinary`], shared as `Arc`, whose output either *is* operand-1's
//! partitioned tensor (in-place) or a freshly created one. No shared operator
//! is ever mutated.
//!
//! # Lifecycle
//!
//! 1. `init` — blocking index launch; every shard validates its domains and
//!    produces an [`ElementBinaryMeta`], stored by the runtime
//! 2. `forward` / `backward` — enqueued launches that return immediately;
//!    ordering against other operators comes from the access plans
//!
//! # Example
//!
//! ```rust
//! use briny_dist::graph::Model;
//! use briny_dist::operator::InplaceOutput;
//! use briny_dist::{BinaryKind, DataType, config::Config};
//!
//! let mut model = Model::new(Config::default());
//! let a = model.create_parallel_input(&[4, 4], DataType::Float);
//! let b = model.create_parallel_input(&[4, 4], DataType::Float);
//! let mut proposal = model.propose_binary(BinaryKind::Add, &a, &b, false, None).unwrap();
//! assert!(proposal.can_inplace_output());
//! proposal.do_inplace_output();
//! let op = proposal.finalize(&mut model);
//! assert_eq!(op.output().region, a.region);
//! ```

use crate::access::{self, AccessPlan};
use crate::broadcast::{binary_output_shape, check_broadcast, ensure_broadcast_allowed};
use crate::cache::params_hash;
use crate::dtype::DataType;
use crate::error::{OpError, Result};
use crate::exec::{IndexLaunch, LaunchId, PhysicalRegion, Runtime};
use crate::graph::ParallelTensorBuilder;
use crate::kind::BinaryKind;
use crate::ops::dispatch::{backward_kernel_wrapper, forward_kernel_wrapper};
use crate::ops::Buffer;
use crate::resolve::{resolve_backward, resolve_forward, resolve_init, OperatorFlags};
use crate::tensors::{validate_partitioning, Domain, MachineView, ParallelDim, ParallelTensor};
use std::sync::Arc;

/// Identifier of an operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

/// The in-place aliasing policy of an operator under construction.
pub trait InplaceOutput {
    /// True if the output may alias operand-1: the kind supports aliasing
    /// and the output has operand-1's exact rank and extents.
    fn can_inplace_output(&self) -> bool;

    /// The currently active aliasing decision.
    fn has_inplace_output(&self) -> bool;

    /// Commits to aliasing. Idempotent; never disables aliasing.
    fn do_inplace_output(&mut self);
}

/// Output may alias operand-1: the kind supports aliasing and the output
/// has operand-1's exact rank and extents.
fn inplace_eligible(kind: BinaryKind, in1: &[ParallelDim], out: &[ParallelDim]) -> bool {
    kind.capabilities().supports_inplace
        && in1.len() == out.len()
        && in1.iter().zip(out).all(|(a, o)| a.size == o.size)
}

/// An operator during graph assembly.
#[derive(Debug, Clone)]
pub struct ProposedBinary {
    guid: OpId,
    kind: BinaryKind,
    name: Option<String>,
    inputs: [Arc<ParallelTensor>; 2],
    output_dims: Vec<ParallelDim>,
    output_view: MachineView,
    inplace_a: bool,
    profiling: bool,
}

impl ProposedBinary {
    /// Validates operands and derives the output's partitioned shape.
    ///
    /// A requested in-place output that the policy does not allow is
    /// dropped with a warning.
    ///
    /// # Errors
    /// - `InvalidPartition` if an operand is not split into equal parts
    /// - `DtypeMismatch` if the operands' dtypes differ (casts are inserted
    ///   earlier, at the logical level)
    /// - `UnsupportedBroadcast` / `ShapeMismatch` for incompatible shapes
    pub fn new(
        guid: OpId,
        kind: BinaryKind,
        in1: Arc<ParallelTensor>,
        in2: Arc<ParallelTensor>,
        inplace_a: bool,
        name: Option<String>,
    ) -> Result<Self> {
        validate_partitioning(&in1.dims)?;
        validate_partitioning(&in2.dims)?;
        if in1.dtype != in2.dtype {
            return Err(OpError::DtypeMismatch {
                lhs: in1.dtype,
                rhs: in2.dtype,
            });
        }
        let (s1, s2) = (in1.shape(), in2.shape());
        let out_shape = binary_output_shape(kind, &s1, &s2)?;

        let output_dims = out_shape
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let degree = match (in1.dims.get(i), in2.dims.get(i)) {
                    (Some(d), _) if d.size == size => d.degree,
                    (_, Some(d)) if d.size == size => d.degree,
                    _ => 1,
                };
                ParallelDim::new(size, degree)
            })
            .collect();
        let output_view = if s1 == out_shape {
            in1.machine_view.clone()
        } else {
            in2.machine_view.clone()
        };

        let mut proposal = Self {
            guid,
            kind,
            name,
            inputs: [in1, in2],
            output_dims,
            output_view,
            inplace_a: false,
            profiling: false,
        };
        if inplace_a {
            proposal.do_inplace_output();
        }
        Ok(proposal)
    }

    /// Enables per-kernel profiling in the operator's runtime state.
    #[must_use]
    pub const fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    /// Operator kind.
    pub const fn kind(&self) -> BinaryKind {
        self.kind
    }

    /// Operator id.
    pub const fn guid(&self) -> OpId {
        self.guid
    }

    /// Operand `i` (0 or 1).
    pub fn input(&self, i: usize) -> &Arc<ParallelTensor> {
        &self.inputs[i]
    }

    /// Extents of the output the operator will produce.
    pub fn output_shape(&self) -> Vec<usize> {
        self.output_dims.iter().map(|d| d.size).collect()
    }

    /// Same as [`ElementBinary::compute_params_hash`].
    pub fn compute_params_hash(&self) -> u64 {
        params_hash(&self.inputs[0], &self.inputs[1], self.kind)
    }

    /// Produces the immutable operator.
    ///
    /// In-place: the output is operand-1 itself. Otherwise a new partitioned
    /// tensor with a gradient region is created through `builder`.
    pub fn finalize<B: ParallelTensorBuilder + ?Sized>(self, builder: &mut B) -> Arc<ElementBinary> {
        let [in1, in2] = self.inputs;
        let output = if self.inplace_a {
            Arc::clone(&in1)
        } else {
            builder.create_parallel_tensor(&self.output_dims, in1.dtype, self.output_view, true)
        };
        let has_same_operands = Arc::ptr_eq(&in1, &in2) || in1.id == in2.id;
        log::trace!(
            "finalize {} op {:?} inplace_a={} same_operands={}",
            self.kind,
            self.guid,
            self.inplace_a,
            has_same_operands
        );
        Arc::new(ElementBinary {
            guid: self.guid,
            kind: self.kind,
            name: self.name,
            inputs: [in1, in2],
            output,
            inplace_a: self.inplace_a,
            has_same_operands,
            profiling: self.profiling,
        })
    }
}

impl InplaceOutput for ProposedBinary {
    fn can_inplace_output(&self) -> bool {
        inplace_eligible(self.kind, &self.inputs[0].dims, &self.output_dims)
    }

    fn has_inplace_output(&self) -> bool {
        self.inplace_a
    }

    fn do_inplace_output(&mut self) {
        if self.inplace_a {
            return;
        }
        if self.can_inplace_output() {
            self.inplace_a = true;
        } else {
            log::warn!(
                "{} op {:?}: in-place output refused for operand shape {:?} -> {:?}",
                self.kind,
                self.guid,
                self.inputs[0].shape(),
                self.output_shape()
            );
        }
    }
}

/// Per-shard runtime state, produced by init and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementBinaryMeta {
    pub kind: BinaryKind,
    pub profiling: bool,
    pub inplace_a: bool,
    pub has_same_operands: bool,
    /// Operands share a data region (implied by `has_same_operands`).
    pub same_operand_regions: bool,
    pub input1_domain: Domain,
    pub input2_domain: Domain,
    pub output_domain: Domain,
}

impl ElementBinaryMeta {
    /// Region-layout flags of the operator this state belongs to.
    pub const fn flags(&self) -> OperatorFlags {
        OperatorFlags {
            inplace_a: self.inplace_a,
            same_operand_regions: self.same_operand_regions,
        }
    }
}

/// A finalized, immutable elementwise-binary operator.
#[derive(Debug)]
pub struct ElementBinary {
    guid: OpId,
    kind: BinaryKind,
    name: Option<String>,
    inputs: [Arc<ParallelTensor>; 2],
    output: Arc<ParallelTensor>,
    inplace_a: bool,
    has_same_operands: bool,
    profiling: bool,
}

impl ElementBinary {
    /// Operator id.
    pub const fn guid(&self) -> OpId {
        self.guid
    }

    /// Operator kind.
    pub const fn kind(&self) -> BinaryKind {
        self.kind
    }

    /// Name given at construction, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Operand `i` (0 or 1).
    pub fn input(&self, i: usize) -> &Arc<ParallelTensor> {
        &self.inputs[i]
    }

    /// The output; operand-1 itself when in-place.
    pub fn output(&self) -> &Arc<ParallelTensor> {
        &self.output
    }

    /// Output aliases operand-1.
    pub const fn inplace_a(&self) -> bool {
        self.inplace_a
    }

    /// Both operands are the same partitioned tensor.
    pub const fn has_same_operands(&self) -> bool {
        self.has_same_operands
    }

    /// Both operands share a data region.
    pub fn same_operand_regions(&self) -> bool {
        self.inputs[0].region == self.inputs[1].region
    }

    /// Output data type.
    pub fn dtype(&self) -> DataType {
        self.output.dtype
    }

    /// Region-layout flags. Operands sharing a region are delivered once,
    /// whether or not they are the same partitioned tensor.
    pub fn flags(&self) -> OperatorFlags {
        OperatorFlags {
            inplace_a: self.inplace_a,
            same_operand_regions: self.same_operand_regions(),
        }
    }

    /// Whether the output may alias operand-1 (see [`InplaceOutput`]).
    pub fn can_inplace_output(&self) -> bool {
        inplace_eligible(self.kind, &self.inputs[0].dims, &self.output.dims)
    }

    /// The committed aliasing decision.
    pub const fn has_inplace_output(&self) -> bool {
        self.inplace_a
    }

    /// Hash over both operands' owner-independent hashes and the kind.
    pub fn compute_params_hash(&self) -> u64 {
        params_hash(&self.inputs[0], &self.inputs[1], self.kind)
    }

    /// Access plan of the init phase.
    ///
    /// # Errors
    /// See [`access::init_plan`].
    pub fn init_plan(&self) -> Result<AccessPlan> {
        access::init_plan(self)
    }

    /// Access plan of the forward phase.
    ///
    /// # Errors
    /// See [`access::forward_plan`].
    pub fn forward_plan(&self) -> Result<AccessPlan> {
        access::forward_plan(self)
    }

    /// Access plan of the backward phase.
    ///
    /// # Errors
    /// See [`access::backward_plan`].
    pub fn backward_plan(&self) -> Result<AccessPlan> {
        access::backward_plan(self)
    }

    fn launch(self: &Arc<Self>, plan: AccessPlan) -> IndexLaunch {
        IndexLaunch {
            op: Arc::clone(self),
            plan,
            launch_domain: self.output.degrees(),
            tag: self.output.machine_view.hash_value(),
        }
    }

    /// Materializes the operator's regions and runs init on every shard,
    /// blocking until all shards finished.
    ///
    /// # Errors
    /// Any shard failure (shape, partition or plan mismatch) is returned.
    pub fn init(self: &Arc<Self>, rt: &Runtime) -> Result<()> {
        for t in self.inputs.iter().chain(core::iter::once(&self.output)) {
            rt.materialize(t)?;
        }
        rt.execute_index_space(&self.launch(self.init_plan()?))
    }

    /// Enqueues the forward launch.
    ///
    /// # Errors
    /// `NotInitialized` if init has not completed.
    pub fn forward(self: &Arc<Self>, rt: &Runtime) -> Result<LaunchId> {
        if !rt.is_initialized(self.guid) {
            return Err(OpError::NotInitialized(self.guid.0));
        }
        rt.submit(self.launch(self.forward_plan()?))
    }

    /// Enqueues the backward launch.
    ///
    /// # Errors
    /// `NotInitialized` if init has not completed, `MissingGradient` if a
    /// tensor has no gradient region.
    pub fn backward(self: &Arc<Self>, rt: &Runtime) -> Result<LaunchId> {
        if !rt.is_initialized(self.guid) {
            return Err(OpError::NotInitialized(self.guid.0));
        }
        rt.submit(self.launch(self.backward_plan()?))
    }

    /// Init body of one shard: validates domains and builds the runtime state.
    ///
    /// # Errors
    /// `AccessPlanMismatch`, `UnsupportedBroadcast` or `ShapeMismatch`.
    pub fn init_task(&self, regions: &[PhysicalRegion]) -> Result<ElementBinaryMeta> {
        let domains: Vec<Domain> = regions.iter().map(|r| r.domain.clone()).collect();
        let resolved = resolve_init(self.flags(), &domains)?;
        if !self.has_same_operands {
            ensure_broadcast_allowed(self.kind, &resolved.in1.extents, &resolved.in2.extents)?;
        }
        if !self.inplace_a {
            check_broadcast(
                &resolved.in1.extents,
                &resolved.in2.extents,
                &resolved.out.extents,
            )?;
        }
        Ok(ElementBinaryMeta {
            kind: self.kind,
            profiling: self.profiling,
            inplace_a: self.inplace_a,
            has_same_operands: self.has_same_operands,
            same_operand_regions: self.same_operand_regions(),
            input1_domain: resolved.in1,
            input2_domain: resolved.in2,
            output_domain: resolved.out,
        })
    }

    /// Forward body of one shard.
    ///
    /// # Errors
    /// `AccessPlanMismatch` if the delivered regions disagree with the plan.
    pub fn forward_task(meta: &ElementBinaryMeta, regions: &[PhysicalRegion]) -> Result<()> {
        let buffers: Vec<Buffer> = regions.iter().map(|r| Arc::clone(&r.buffer)).collect();
        let resolved = resolve_forward(meta.flags(), &buffers)?;
        forward_kernel_wrapper(meta, &resolved);
        Ok(())
    }

    /// Backward body of one shard.
    ///
    /// # Errors
    /// `AccessPlanMismatch` if the delivered regions disagree with the plan.
    pub fn backward_task(meta: &ElementBinaryMeta, regions: &[PhysicalRegion]) -> Result<()> {
        let buffers: Vec<Buffer> = regions.iter().map(|r| Arc::clone(&r.buffer)).collect();
        let resolved = resolve_backward(meta.inplace_a, meta.same_operand_regions, &buffers)?;
        backward_kernel_wrapper(meta, &resolved);
        Ok(())
    }
}

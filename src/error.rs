//! Error taxonomy of the operator core.
//!
//! Every variant is fatal for the graph or runtime that produced it: shape,
//! partition and access-plan errors are programming errors caught while the
//! graph is built or first executed, never transient faults, so nothing is
//! retried. An infeasible placement during cost estimation is not an error;
//! the cost hook reports it by returning `false`.

use crate::access::Phase;
use crate::dtype::DataType;
use crate::kind::BinaryKind;
use crate::tensors::RegionId;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, OpError>;

/// Errors raised while building, planning or executing an operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    /// Rank or extent disagreement between operands, or between an operand and the output.
    #[error("shape mismatch in {context}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        context: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// Operands reached operator construction with different dtypes.
    #[error("operand dtypes differ: {lhs} vs {rhs}")]
    DtypeMismatch { lhs: DataType, rhs: DataType },

    /// A kind without broadcast support received differently shaped operands.
    #[error("{kind} does not support broadcasting {lhs:?} against {rhs:?}")]
    UnsupportedBroadcast {
        kind: BinaryKind,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// The regions delivered to a phase do not match the plan for the operator's flags.
    #[error("{phase:?} expected {expected} regions but received {got}")]
    AccessPlanMismatch {
        phase: Phase,
        expected: usize,
        got: usize,
    },

    /// An in-place output does not share operand-1's region or partitioning.
    #[error("in-place output does not alias operand-1 ({0})")]
    AliasViolation(&'static str),

    /// Operand and output partitions cannot be launched over one index space.
    #[error("partition degrees {operand:?} incompatible with launch degrees {launch:?}")]
    PartitionMismatch {
        operand: Vec<usize>,
        launch: Vec<usize>,
    },

    /// A dimension's degree is zero or does not divide its extent.
    #[error("extent {size} cannot be split {degree} ways")]
    InvalidPartition { size: usize, degree: usize },

    /// Backward was planned for a tensor that has no gradient region.
    #[error("tensor {0} has no gradient region")]
    MissingGradient(u64),

    /// Forward or backward was issued before init completed.
    #[error("operator {0} has no runtime state; init must complete first")]
    NotInitialized(u64),

    /// A plan references a region the runtime never materialized.
    #[error("region {0:?} is not materialized")]
    UnknownRegion(RegionId),

    /// A layer or tensor does not belong to this model.
    #[error("unknown layer or tensor: {0}")]
    UnknownLayer(String),

    /// The execution thread pool could not be created.
    #[error("thread pool: {0}")]
    ThreadPool(String),
}

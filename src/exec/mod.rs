//! # Execution Layer
//!
//! Runs operator phases over partitioned regions.
//!
//! ## Submodules
//!
//! - [`runtime`] — Region store, index-space launches over a rayon pool,
//!   per-operator runtime state
//! - [`scheduler`] — Deferred launch queue with dependencies inferred from
//!   access plans
//!
//! ## Launch Model
//!
//! A launch runs one phase of one operator at every point of its index space
//! (the cartesian product of the output's partition degrees). Each point
//! receives the physical regions its access plan names, in plan order, and
//! the shards of one launch run concurrently.

use crate::access::{AccessMode, AccessPlan};
use crate::ops::Buffer;
use crate::operator::ElementBinary;
use crate::tensors::Domain;
use std::sync::Arc;

pub mod runtime;
pub mod scheduler;

pub use runtime::Runtime;
pub use scheduler::{LaunchId, LaunchRecord};

/// One shard instance of a declared region, as delivered to a task.
#[derive(Debug, Clone)]
pub struct PhysicalRegion {
    pub buffer: Buffer,
    /// Part of the tensor this shard covers.
    pub domain: Domain,
    pub mode: AccessMode,
}

/// A phase of one operator, launched over its output's partitioning.
#[derive(Debug, Clone)]
pub struct IndexLaunch {
    pub op: Arc<ElementBinary>,
    pub plan: AccessPlan,
    /// Partition degrees of the output, innermost first.
    pub launch_domain: Vec<usize>,
    /// Placement tag taken from the output's machine view.
    pub tag: u64,
}

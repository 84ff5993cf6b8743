//! # Kernel Layer
//!
//! This module holds the numeric side of the elementwise-binary operator:
//! the reference CPU kernels and the wrappers that bind them to resolved
//! shard buffers.
//!
//! ## Submodules
//!
//! - [`cpu`] — Multi-threaded f32 kernels on plain slices (forward with
//!   broadcast, backward with broadcast reduction)
//! - [`dispatch`] — Kernel wrappers: lock discipline over shared shard
//!   buffers, aliasing, gradient accumulation and optional profiling
//!
//! ## Notes
//!
//! - Kernels never allocate shard storage; buffers come from the runtime's
//!   region store or the simulator arena
//! - Both real execution and cost estimation call the same wrappers, so a
//!   measured plan is the plan that runs
//! - Elements are `f32` regardless of the declared dtype; the dtype only
//!   sizes simulator allocations

use parking_lot::RwLock;
use std::sync::Arc;

pub mod cpu;
pub mod dispatch;

/// One shard instance of a region, shared between the shards that read it.
pub type Buffer = Arc<RwLock<Vec<f32>>>;

/// Allocates a zero-filled buffer of `len` elements.
pub fn new_buffer(len: usize) -> Buffer {
    Arc::new(RwLock::new(vec![0.0; len]))
}

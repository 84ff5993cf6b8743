//! briny_dist: distributed elementwise-binary tensor operators in Rust.
//!
//! Turns a logical "add/sub/mul/div two tensors" request into a partitioned,
//! broadcast-aware, optionally in-place forward/backward computation that
//! runs shard by shard across a pool of workers.
//!
//! # Features
//!
//! - Dtype unification with explicit cast insertion.
//! - In-place aliasing of the output onto operand-1, decided before the
//!   operator is frozen.
//! - Per-phase region-access plans that drive both scheduling and cost estimation.
//! - Named-role resolution of shard buffers, including aliased roles.
//! - Structural node memoization for graph search.
//! - Cost estimation against a reusable scratch arena.
//!
//! # Goals
//!
//! - Keep every aliasing rule in one place and make it observable.
//! - Prioritize correctness and explicitness over kernel performance.
//! - Let a measured plan be exactly the plan that runs.
//!
//! # Modules
//!
//! - [`graph`] — Logical layers, compilation, and the node cache entry point.
//! - [`operator`] — Proposed and finalized operators, aliasing policy, shard tasks.
//! - [`access`] — Region-access declarations per phase.
//! - [`resolve`] — Named-role resolution of delivered regions.
//! - [`broadcast`] — Broadcast legality.
//! - [`exec`] — Region store, index-space launches and scheduling.
//! - [`ops`] — Reference kernels and their wrappers.
//! - [`sim`] — Simulator arena and the cost hook.
//! - [`cache`] — Operator memoization keyed by structural hash.
//! - [`tensors`], [`dtype`], [`kind`] — Data model.
//! - [`config`], [`error`] — Configuration and error taxonomy.
//!
//! # Example
//!
//! ```rust
//! use briny_dist::graph::Model;
//! use briny_dist::{config::Config, DataType};
//!
//! let mut model = Model::new(Config::default());
//! let a = model.create_input(&[4, 4], DataType::Half);
//! let b = model.create_input(&[4, 4], DataType::Float);
//! let c = model.add(&a, &b, false, Some("sum")).unwrap();
//! assert_eq!(c.dtype, DataType::Float);
//! assert_eq!(model.layers().len(), 2); // cast + add
//! ```

pub mod access;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod dtype;
pub mod error;
pub mod exec;
pub mod graph;
pub mod kind;
pub mod operator;
pub mod ops;
pub mod resolve;
pub mod sim;
pub mod tensors;

pub use dtype::DataType;
pub use error::{OpError, Result};
pub use kind::BinaryKind;

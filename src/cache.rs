//! Node memoization for graph search.
//!
//! Candidate graphs explored by a search reuse operator objects whose
//! operands are structurally identical, so a node is cheap to create and the
//! operator behind it is built once. The key is owner-independent: two
//! partitioned tensors with the same dtype, extents and degrees hash the
//! same regardless of which operator produced them or which regions they
//! occupy.
//!
//! The 64-bit hash only selects a slot; the full key is stored alongside the
//! operator and compared on lookup. A different key landing in an occupied
//! slot gets a fresh, uncached operator instead of someone else's.

use crate::dtype::DataType;
use crate::kind::BinaryKind;
use crate::operator::ElementBinary;
use crate::tensors::{ParallelDim, ParallelTensor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide counter for node identifiers.
static NODE_GLOBAL_GUID: AtomicUsize = AtomicUsize::new(0);

/// Allocates the next node identifier.
pub fn next_node_guid() -> usize {
    NODE_GLOBAL_GUID.fetch_add(1, Ordering::Relaxed)
}

/// `((h(in1) * 31) + h(in2)) * 31 + op_code`, wrapping.
pub fn params_hash(in1: &ParallelTensor, in2: &ParallelTensor, kind: BinaryKind) -> u64 {
    in1.owner_independent_hash()
        .wrapping_mul(31)
        .wrapping_add(in2.owner_independent_hash())
        .wrapping_mul(31)
        .wrapping_add(kind.op_code())
}

/// Owner-independent description of one operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSignature {
    pub dtype: DataType,
    pub dims: Vec<ParallelDim>,
}

impl From<&ParallelTensor> for TensorSignature {
    fn from(t: &ParallelTensor) -> Self {
        Self {
            dtype: t.dtype,
            dims: t.dims.clone(),
        }
    }
}

/// Full identity of a cached operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub in1: TensorSignature,
    pub in2: TensorSignature,
    pub kind: BinaryKind,
}

impl NodeKey {
    pub fn new(in1: &ParallelTensor, in2: &ParallelTensor, kind: BinaryKind) -> Self {
        Self {
            in1: in1.into(),
            in2: in2.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    key: NodeKey,
    op: Arc<ElementBinary>,
}

/// A graph node: a fresh identifier around a possibly shared operator.
#[derive(Debug, Clone)]
pub struct Node {
    pub guid: usize,
    pub op: Arc<ElementBinary>,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// Same key seen before.
    Hit(Arc<ElementBinary>),
    /// Nothing stored under the hash yet.
    Vacant,
    /// The hash is taken by a different key.
    Collision,
}

/// Operators keyed by [`params_hash`].
#[derive(Debug, Default)]
pub struct NodeCache {
    entries: HashMap<u64, CacheEntry>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, hash: u64, key: &NodeKey) -> Lookup {
        match self.entries.get(&hash) {
            Some(entry) if entry.key == *key => Lookup::Hit(Arc::clone(&entry.op)),
            Some(_) => Lookup::Collision,
            None => Lookup::Vacant,
        }
    }

    /// Stores `op` unless the slot is taken; the first writer wins.
    pub fn insert(&mut self, hash: u64, key: NodeKey, op: Arc<ElementBinary>) {
        self.entries.entry(hash).or_insert(CacheEntry { key, op });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

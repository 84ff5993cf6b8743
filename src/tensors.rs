//! Logical and partitioned tensor descriptions.
//!
//! # Tensor Model
//!
//! This module defines the two views of a tensor that the operator core works
//! with. Neither holds element data; data lives in the runtime's region store
//! (see [`crate::exec`]) or in the simulator arena (see [`crate::sim`]).
//!
//! - [`LogicalTensor`]: shape and dtype only, produced by the model builder
//! - [`ParallelTensor`]: the distributed realization, with per-dimension
//!   partition degrees, a data region, an optional gradient region and a
//!   [`MachineView`] naming the workers that host its shards
//!
//! ## Dimension Ordering
//!
//! Dimension index 0 is the innermost (fastest-varying) dimension everywhere
//! in the crate: in shapes, partition degrees, shard points and flat buffer
//! layouts. A logical tensor and its partitioned realization always list
//! their dimensions in the same order.
//!
//! ## Example
//!
//! ```rust
//! use briny_dist::tensors::{ParallelDim, ParallelConfig};
//! let dims = [ParallelDim::new(8, 2), ParallelDim::new(4, 1)];
//! assert_eq!(dims[0].shard_size(), 4);
//! let pc = ParallelConfig::data_parallel(2, 2);
//! assert_eq!(pc.num_parts(), 2);
//! ```

use crate::dtype::DataType;
use crate::error::{OpError, Result};
use briny::prelude::{TrustedData, Validate, ValidationError};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Identifier of a logical tensor within a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub u64);

/// Identifier of a partitioned tensor within a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParallelTensorId(pub u64);

/// Identifier of an addressable memory region (data or gradient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

/// Index of a layer in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub usize);

/// Symbolic tensor before distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalTensor {
    pub id: TensorId,
    /// Extent of each dimension, innermost first.
    pub dims: Vec<usize>,
    pub dtype: DataType,
    /// Producing layer and output slot; `None` for graph inputs.
    pub owner: Option<(LayerId, usize)>,
    /// Whether a gradient region is materialized for this tensor.
    pub create_grad: bool,
}

impl LogicalTensor {
    /// Number of dimensions.
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }
}

/// One dimension of a partitioned tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParallelDim {
    /// Logical extent.
    pub size: usize,
    /// Number of shards the dimension is split into.
    pub degree: usize,
}

impl ParallelDim {
    /// Creates a dimension split `degree` ways.
    pub const fn new(size: usize, degree: usize) -> Self {
        Self { size, degree }
    }

    /// Extent of one shard along this dimension.
    ///
    /// Only meaningful for a validated dimension (see [`validate_partitioning`]).
    pub const fn shard_size(&self) -> usize {
        self.size / self.degree
    }
}

impl Validate for ParallelDim {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.degree == 0 || self.size % self.degree != 0 {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Checks that every dimension is split into equal, non-empty parts, so the
/// shards of a tensor cover exactly its logical extents.
///
/// # Errors
/// `InvalidPartition` for the first offending dimension.
pub fn validate_partitioning(dims: &[ParallelDim]) -> Result<()> {
    for &d in dims {
        TrustedData::new(d).map_err(|_| OpError::InvalidPartition {
            size: d.size,
            degree: d.degree,
        })?;
    }
    Ok(())
}

/// Kind of device a machine view places shards on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    Cpu,
    Gpu,
}

/// Placement descriptor: which workers host which shards.
///
/// Shard `p` (a point in the launch index space) runs on device
/// `start_device_id + sum(p[i] * strides[i])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MachineView {
    pub device_type: DeviceType,
    pub start_device_id: usize,
    pub degrees: Vec<usize>,
    pub strides: Vec<usize>,
}

impl MachineView {
    /// A view laying `degrees` out contiguously from device `start`.
    pub fn contiguous(start: usize, degrees: &[usize]) -> Self {
        let mut strides = Vec::with_capacity(degrees.len());
        let mut acc = 1;
        for &d in degrees {
            strides.push(acc);
            acc *= d;
        }
        Self {
            device_type: DeviceType::Cpu,
            start_device_id: start,
            degrees: degrees.to_vec(),
            strides,
        }
    }

    /// Number of shards the view places.
    pub fn num_parts(&self) -> usize {
        self.degrees.iter().product()
    }

    /// Device hosting the shard at `point`.
    pub fn device_for(&self, point: &[usize]) -> usize {
        self.start_device_id
            + point
                .iter()
                .zip(&self.strides)
                .map(|(p, s)| p * s)
                .sum::<usize>()
    }

    /// Stable hash, used as the launch tag so the scheduler can route shards.
    pub fn hash_value(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.hash(&mut h);
        h.finish()
    }
}

/// Distributed realization of a [`LogicalTensor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelTensor {
    pub id: ParallelTensorId,
    pub dims: Vec<ParallelDim>,
    pub dtype: DataType,
    pub region: RegionId,
    pub region_grad: Option<RegionId>,
    pub machine_view: MachineView,
}

impl ParallelTensor {
    /// Number of dimensions.
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    /// Logical extents, innermost first.
    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.size).collect()
    }

    /// Partition degree of each dimension.
    pub fn degrees(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.degree).collect()
    }

    /// Extents of one shard.
    pub fn shard_shape(&self) -> Vec<usize> {
        self.dims.iter().map(ParallelDim::shard_size).collect()
    }

    /// Number of shards (one region instance each).
    pub fn num_shards(&self) -> usize {
        self.dims.iter().map(|d| d.degree).product()
    }

    /// Total number of elements.
    pub fn volume(&self) -> usize {
        self.dims.iter().map(|d| d.size).product()
    }

    /// True if `other` has the same extents and partitioning.
    pub fn same_partitioning(&self, other: &Self) -> bool {
        self.dims == other.dims
    }

    /// Hash over dtype and per-dimension size/degree; independent of which
    /// operator produced the tensor and of its region ids.
    pub fn owner_independent_hash(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.dtype.hash(&mut h);
        self.dims.len().hash(&mut h);
        for d in &self.dims {
            d.hash(&mut h);
        }
        h.finish()
    }

    /// Index of the region instance holding the shard at launch `point`.
    pub fn shard_index(&self, point: &[usize]) -> usize {
        shard_index_of(&self.dims, point)
    }

    /// Domain of the shard this tensor contributes at launch `point`.
    ///
    /// # Errors
    /// `PartitionMismatch`; see [`shard_domain_of`].
    pub fn shard_domain(&self, point: &[usize], launch: &[usize]) -> Result<Domain> {
        shard_domain_of(&self.dims, point, launch)
    }

    /// Shape of one shard under a candidate parallel configuration.
    ///
    /// Operands (`is_output == false`) may keep a unit dimension unsplit
    /// under any degree, since that dimension is broadcast. Returns `None`
    /// when the configuration cannot be realized for this tensor.
    pub fn get_sub_tensor(&self, pc: &ParallelConfig, is_output: bool) -> Option<SubTensor> {
        if pc.dims.len() != self.dims.len() {
            return None;
        }
        if !pc.device_ids.is_empty() && pc.device_ids.len() != pc.num_parts() {
            return None;
        }
        let mut dims = Vec::with_capacity(self.dims.len());
        for (d, &degree) in self.dims.iter().zip(&pc.dims) {
            if degree == 0 {
                return None;
            }
            if d.size % degree == 0 {
                dims.push(d.size / degree);
            } else if !is_output && d.size == 1 {
                dims.push(1);
            } else {
                return None;
            }
        }
        TrustedData::new(SubTensor {
            dims,
            dtype: self.dtype,
        })
        .ok()
        .map(TrustedData::into_inner)
    }
}

/// A rectangular index range: `lo[i] .. lo[i] + extents[i]` per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Domain {
    pub lo: Vec<usize>,
    pub extents: Vec<usize>,
}

impl Domain {
    /// A domain starting at the origin.
    pub fn from_extents(extents: &[usize]) -> Self {
        Self {
            lo: vec![0; extents.len()],
            extents: extents.to_vec(),
        }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.extents.len()
    }

    /// Number of points.
    pub fn volume(&self) -> usize {
        self.extents.iter().product()
    }
}

/// A candidate partitioning considered by the cost estimator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParallelConfig {
    pub device_type: DeviceType,
    /// Partition degree per dimension, innermost first.
    pub dims: Vec<usize>,
    /// Devices hosting the parts; may be empty when placement is not yet decided.
    pub device_ids: Vec<usize>,
}

impl ParallelConfig {
    /// Splits only the outermost of `rank` dimensions `degree` ways.
    pub fn data_parallel(rank: usize, degree: usize) -> Self {
        let mut dims = vec![1; rank];
        if let Some(last) = dims.last_mut() {
            *last = degree;
        }
        Self {
            device_type: DeviceType::Cpu,
            dims,
            device_ids: (0..degree).collect(),
        }
    }

    /// Number of parts.
    pub fn num_parts(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Shape of one shard, as seen by the cost estimator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTensor {
    pub dims: Vec<usize>,
    pub dtype: DataType,
}

impl SubTensor {
    /// Number of elements.
    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }

    /// The shard as a domain at the origin.
    pub fn domain(&self) -> Domain {
        Domain::from_extents(&self.dims)
    }
}

impl Validate for SubTensor {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.dims.iter().any(|&d| d == 0) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Index of the region instance holding the shard at launch `point`.
///
/// Dimensions the tensor does not split (degree 1) contribute nothing, so
/// broadcast operands share one instance across launch points.
pub fn shard_index_of(dims: &[ParallelDim], point: &[usize]) -> usize {
    let mut index = 0;
    let mut stride = 1;
    for (i, d) in dims.iter().enumerate() {
        if d.degree > 1 {
            index += point.get(i).copied().unwrap_or(0) * stride;
        }
        stride *= d.degree;
    }
    index
}

/// Domain of the shard a tensor with `dims` contributes at launch `point`.
///
/// A unit dimension, or one the launch does not split, spans its full
/// extent at every point; any other dimension must be split exactly as the
/// launch is.
///
/// # Errors
/// `PartitionMismatch` if a dimension is not split the same way as the
/// launch, or the tensor has more dimensions than the launch.
pub fn shard_domain_of(dims: &[ParallelDim], point: &[usize], launch: &[usize]) -> Result<Domain> {
    let mismatch = || OpError::PartitionMismatch {
        operand: dims.iter().map(|d| d.degree).collect(),
        launch: launch.to_vec(),
    };
    if dims.len() > launch.len() || point.len() != launch.len() {
        return Err(mismatch());
    }
    let mut lo = Vec::with_capacity(dims.len());
    let mut extents = Vec::with_capacity(dims.len());
    for (i, d) in dims.iter().enumerate() {
        if d.degree == 1 && (d.size == 1 || launch[i] == 1) {
            lo.push(0);
            extents.push(d.size);
        } else if d.degree == launch[i] {
            let e = d.shard_size();
            lo.push(point[i] * e);
            extents.push(e);
        } else {
            return Err(mismatch());
        }
    }
    Ok(Domain { lo, extents })
}

/// All points of an index space with the given degrees, dimension 0 fastest.
pub fn index_space(degrees: &[usize]) -> Vec<Vec<usize>> {
    let total: usize = degrees.iter().product();
    (0..total)
        .map(|mut k| {
            degrees
                .iter()
                .map(|&d| {
                    let c = k % d;
                    k /= d;
                    c
                })
                .collect()
        })
        .collect()
}

/// Row-major strides with dimension 0 fastest.
pub(crate) fn strides_of(extents: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(extents.len());
    let mut acc = 1;
    for &e in extents {
        strides.push(acc);
        acc *= e;
    }
    strides
}

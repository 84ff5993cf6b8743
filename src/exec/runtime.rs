//! Region store and launch execution.
//!
//! The [`Runtime`] owns every materialized region as a set of shard
//! buffers, one per partition of the owning tensor. Regions are addressed by
//! [`RegionId`]; data and gradient fields of a tensor are separate regions.
//!
//! Shards of a launch run on a dedicated rayon pool. Init is blocking and
//! stores the runtime state each shard produced; forward and backward are
//! queued through the scheduler and run when [`Runtime::wait_all`] drains it.

use super::scheduler::{LaunchId, LaunchRecord, Scheduler};
use super::{IndexLaunch, PhysicalRegion};
use crate::access::Phase;
use crate::config::Config;
use crate::error::{OpError, Result};
use crate::operator::{ElementBinary, ElementBinaryMeta, OpId};
use crate::ops::{new_buffer, Buffer};
use crate::tensors::{
    index_space, shard_domain_of, shard_index_of, strides_of, validate_partitioning, ParallelDim,
    ParallelTensor, RegionId,
};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct RegionInstance {
    dims: Vec<ParallelDim>,
    shards: Vec<Buffer>,
    is_grad: bool,
}

impl RegionInstance {
    fn new(dims: &[ParallelDim], is_grad: bool) -> Self {
        let shard_len: usize = dims.iter().map(ParallelDim::shard_size).product();
        let count: usize = dims.iter().map(|d| d.degree).product();
        Self {
            dims: dims.to_vec(),
            shards: (0..count).map(|_| new_buffer(shard_len)).collect(),
            is_grad,
        }
    }

    fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.size).collect()
    }

    /// For every shard: its instance index and the global flat offset of
    /// each of its local elements.
    fn layout(&self) -> Result<Vec<(usize, Vec<usize>)>> {
        let degrees: Vec<usize> = self.dims.iter().map(|d| d.degree).collect();
        let global = strides_of(&self.shape());
        let mut layout = Vec::with_capacity(self.shards.len());
        for point in index_space(&degrees) {
            let domain = shard_domain_of(&self.dims, &point, &degrees)?;
            let mut offsets = Vec::with_capacity(domain.volume());
            for mut k in 0..domain.volume() {
                let mut flat = 0;
                for (i, &e) in domain.extents.iter().enumerate() {
                    flat += (domain.lo[i] + k % e) * global[i];
                    k /= e;
                }
                offsets.push(flat);
            }
            layout.push((shard_index_of(&self.dims, &point), offsets));
        }
        Ok(layout)
    }
}

/// Executes operator launches over materialized regions.
pub struct Runtime {
    pool: ThreadPool,
    regions: RwLock<HashMap<RegionId, RegionInstance>>,
    metas: RwLock<HashMap<OpId, Vec<Arc<ElementBinaryMeta>>>>,
    scheduler: Mutex<Scheduler>,
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.pool.current_num_threads())
            .field("regions", &self.regions.read().len())
            .field("pending", &self.scheduler.lock().pending())
            .finish()
    }
}

impl Runtime {
    /// Creates a runtime with `config.workers` pool threads (0 = rayon default).
    ///
    /// # Errors
    /// `ThreadPool` if the pool cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("briny-dist-{i}"))
            .build()
            .map_err(|e| OpError::ThreadPool(e.to_string()))?;
        Ok(Self {
            pool,
            regions: RwLock::new(HashMap::new()),
            metas: RwLock::new(HashMap::new()),
            scheduler: Mutex::new(Scheduler::new()),
        })
    }

    /// Allocates zeroed shard buffers for a tensor's data and gradient
    /// regions. Regions that already exist are left untouched.
    ///
    /// # Errors
    /// `InvalidPartition` if the tensor is not split into equal parts.
    pub fn materialize(&self, tensor: &ParallelTensor) -> Result<()> {
        validate_partitioning(&tensor.dims)?;
        let mut regions = self.regions.write();
        regions
            .entry(tensor.region)
            .or_insert_with(|| RegionInstance::new(&tensor.dims, false));
        if let Some(grad) = tensor.region_grad {
            regions
                .entry(grad)
                .or_insert_with(|| RegionInstance::new(&tensor.dims, true));
        }
        Ok(())
    }

    /// True if `region` has been materialized.
    pub fn is_materialized(&self, region: RegionId) -> bool {
        self.regions.read().contains_key(&region)
    }

    fn scatter(&self, region: RegionId, data: &[f32]) -> Result<()> {
        let regions = self.regions.read();
        let instance = regions.get(&region).ok_or(OpError::UnknownRegion(region))?;
        let volume: usize = instance.dims.iter().map(|d| d.size).product();
        if data.len() != volume {
            return Err(OpError::ShapeMismatch {
                context: "region write",
                lhs: vec![data.len()],
                rhs: instance.shape(),
            });
        }
        for (index, offsets) in instance.layout()? {
            let mut shard = instance.shards[index].write();
            for (dst, &src) in shard.iter_mut().zip(&offsets) {
                *dst = data[src];
            }
        }
        Ok(())
    }

    fn gather(&self, region: RegionId) -> Result<Vec<f32>> {
        let regions = self.regions.read();
        let instance = regions.get(&region).ok_or(OpError::UnknownRegion(region))?;
        let mut out = vec![0.0; instance.dims.iter().map(|d| d.size).product()];
        for (index, offsets) in instance.layout()? {
            let shard = instance.shards[index].read();
            for (&src, &dst) in shard.iter().zip(&offsets) {
                out[dst] = src;
            }
        }
        Ok(out)
    }

    /// Writes a whole tensor (innermost dimension fastest) into its shards.
    ///
    /// # Errors
    /// `UnknownRegion` if not materialized, `ShapeMismatch` on a length mismatch.
    pub fn write_region(&self, tensor: &ParallelTensor, data: &[f32]) -> Result<()> {
        self.scatter(tensor.region, data)
    }

    /// Reads a whole tensor back from its shards.
    ///
    /// # Errors
    /// `UnknownRegion` if not materialized.
    pub fn read_region(&self, tensor: &ParallelTensor) -> Result<Vec<f32>> {
        self.gather(tensor.region)
    }

    /// Writes a whole gradient, e.g. to seed backward with the loss gradient.
    ///
    /// # Errors
    /// `MissingGradient`, `UnknownRegion` or `ShapeMismatch`.
    pub fn write_grad(&self, tensor: &ParallelTensor, data: &[f32]) -> Result<()> {
        let grad = tensor
            .region_grad
            .ok_or(OpError::MissingGradient(tensor.id.0))?;
        self.scatter(grad, data)
    }

    /// Reads a whole gradient.
    ///
    /// # Errors
    /// `MissingGradient` or `UnknownRegion`.
    pub fn read_grad(&self, tensor: &ParallelTensor) -> Result<Vec<f32>> {
        let grad = tensor
            .region_grad
            .ok_or(OpError::MissingGradient(tensor.id.0))?;
        self.gather(grad)
    }

    /// Zeroes every gradient region.
    pub fn zero_gradients(&self) {
        for instance in self.regions.read().values().filter(|r| r.is_grad) {
            for shard in &instance.shards {
                shard.write().fill(0.0);
            }
        }
    }

    /// True once init has stored runtime state for `op`.
    pub fn is_initialized(&self, op: OpId) -> bool {
        self.metas.read().contains_key(&op)
    }

    /// Per-shard runtime state of `op`, in launch-point order.
    pub fn runtime_state(&self, op: OpId) -> Option<Vec<Arc<ElementBinaryMeta>>> {
        self.metas.read().get(&op).cloned()
    }

    /// Queues a launch.
    ///
    /// # Errors
    /// `UnknownRegion` if the plan names a region that was never materialized.
    pub fn submit(&self, launch: IndexLaunch) -> Result<LaunchId> {
        {
            let regions = self.regions.read();
            if let Some(req) = launch
                .plan
                .requirements
                .iter()
                .find(|r| !regions.contains_key(&r.region))
            {
                return Err(OpError::UnknownRegion(req.region));
            }
        }
        Ok(self.scheduler.lock().submit(launch))
    }

    /// Runs every queued launch in submission order, then retires their
    /// records.
    ///
    /// # Errors
    /// The first launch failure; the remaining queue is dropped.
    pub fn wait_all(&self) -> Result<()> {
        loop {
            let next = {
                let mut scheduler = self.scheduler.lock();
                let next = scheduler.pop();
                if next.is_none() {
                    scheduler.retire();
                }
                next
            };
            let Some((id, launch)) = next else {
                return Ok(());
            };
            if let Err(e) = self.execute_index_space(&launch) {
                log::trace!("launch {id:?} failed: {e}");
                let mut scheduler = self.scheduler.lock();
                scheduler.clear();
                scheduler.retire();
                return Err(e);
            }
        }
    }

    /// Launches submitted since the queue last drained.
    pub fn history(&self) -> Vec<LaunchRecord> {
        self.scheduler.lock().records().to_vec()
    }

    /// Launches `id` had to wait for, while `id` is still recorded.
    pub fn dependencies(&self, id: LaunchId) -> Option<Vec<LaunchId>> {
        self.scheduler.lock().record(id).map(|r| r.deps.clone())
    }

    /// The regions each launch point receives, in plan order.
    fn physical_regions(&self, launch: &IndexLaunch) -> Result<Vec<Vec<PhysicalRegion>>> {
        let regions = self.regions.read();
        index_space(&launch.launch_domain)
            .into_iter()
            .map(|point| {
                launch
                    .plan
                    .requirements
                    .iter()
                    .map(|req| {
                        let instance = regions
                            .get(&req.region)
                            .ok_or(OpError::UnknownRegion(req.region))?;
                        let degrees: Vec<usize> = instance.dims.iter().map(|d| d.degree).collect();
                        if degrees != req.degrees {
                            return Err(OpError::PartitionMismatch {
                                operand: req.degrees.clone(),
                                launch: degrees,
                            });
                        }
                        let domain = shard_domain_of(&instance.dims, &point, &launch.launch_domain)?;
                        Ok(PhysicalRegion {
                            buffer: Arc::clone(&instance.shards[shard_index_of(&instance.dims, &point)]),
                            domain,
                            mode: req.mode,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }

    fn state_of(&self, op: &ElementBinary, points: usize) -> Result<Vec<Arc<ElementBinaryMeta>>> {
        match self.metas.read().get(&op.guid()) {
            Some(state) if state.len() == points => Ok(state.clone()),
            _ => Err(OpError::NotInitialized(op.guid().0)),
        }
    }

    /// Runs one launch at every point of its index space and blocks until
    /// all shards finished. An init launch stores the produced state.
    ///
    /// # Errors
    /// Region lookup failures, or the first shard failure.
    pub fn execute_index_space(&self, launch: &IndexLaunch) -> Result<()> {
        let shards = self.physical_regions(launch)?;
        let op = &launch.op;
        log::trace!(
            "{:?} {} op {:?}: {} shards, tag {:#x}",
            launch.plan.phase,
            op.kind(),
            op.guid(),
            shards.len(),
            launch.tag
        );

        match launch.plan.phase {
            Phase::Init => {
                let state = self.pool.install(|| {
                    shards
                        .par_iter()
                        .map(|regions| op.init_task(regions).map(Arc::new))
                        .collect::<Result<Vec<_>>>()
                })?;
                self.metas.write().insert(op.guid(), state);
            }
            Phase::Forward => {
                let state = self.state_of(op, shards.len())?;
                self.pool.install(|| {
                    shards
                        .par_iter()
                        .zip(state.par_iter())
                        .try_for_each(|(regions, meta)| ElementBinary::forward_task(meta, regions))
                })?;
            }
            Phase::Backward => {
                let state = self.state_of(op, shards.len())?;
                self.pool.install(|| {
                    shards
                        .par_iter()
                        .zip(state.par_iter())
                        .try_for_each(|(regions, meta)| ElementBinary::backward_task(meta, regions))
                })?;
            }
        }
        Ok(())
    }
}

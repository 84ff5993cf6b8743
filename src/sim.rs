//! Cost estimation against a scratch arena.
//!
//! A [`Simulator`] hands out shard-sized buffers from a reusable arena and
//! times closures. [`ElementBinary::measure_operator_cost`] builds the
//! buffers one shard of a candidate partitioning would see, resolves them
//! through the same role resolvers execution uses, and times the real kernel
//! wrappers. Nothing in the model or runtime is touched.

use crate::broadcast::check_broadcast;
use crate::config::{ComputationMode, Config};
use crate::dtype::DataType;
use crate::operator::{ElementBinary, ElementBinaryMeta};
use crate::ops::dispatch::{backward_kernel_wrapper, forward_kernel_wrapper};
use crate::ops::{new_buffer, Buffer};
use crate::resolve::{resolve_backward, resolve_forward};
use crate::tensors::{ParallelConfig, SubTensor};
use std::time::Instant;

/// Measured cost of one operator under one partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostMetrics {
    /// Milliseconds per forward run.
    pub forward_time: f64,
    /// Milliseconds per backward run; 0 in inference mode.
    pub backward_time: f64,
    /// Bytes of operand shards.
    pub inputs_memory: usize,
    /// Bytes of output shards not shared with an operand.
    pub outputs_memory: usize,
}

/// Averaged timings of one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Timing {
    pub forward_time: f64,
    pub backward_time: f64,
}

/// Buffer source and timer for cost estimation.
pub trait Simulator {
    /// Whether backward is measured.
    fn computation_mode(&self) -> ComputationMode;

    /// Releases every allocation; previously returned buffers must not be
    /// used afterwards.
    fn free_all(&mut self);

    /// A zeroed buffer of `volume` elements, or `None` if the arena is exhausted.
    fn allocate(&mut self, volume: usize, dtype: DataType) -> Option<Buffer>;

    /// Times `forward` and, when given, `backward`.
    fn measure(&mut self, forward: &mut dyn FnMut(), backward: Option<&mut dyn FnMut()>) -> Timing;
}

/// A bump-style simulator arena.
///
/// Allocations are charged against a byte capacity; `free_all` resets the
/// charge and recycles the buffers handed out so far.
#[derive(Debug)]
pub struct ArenaSimulator {
    capacity: usize,
    used: usize,
    buffers: Vec<Buffer>,
    next: usize,
    mode: ComputationMode,
    warmup: usize,
    repeat: usize,
}

impl ArenaSimulator {
    /// An arena sized and timed according to `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            capacity: config.simulator_capacity,
            used: 0,
            buffers: Vec::new(),
            next: 0,
            mode: config.computation_mode,
            warmup: config.warmup_iters,
            repeat: config.repeat_iters.max(1),
        }
    }

    /// Current bytes charged.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining bytes available.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

impl Simulator for ArenaSimulator {
    fn computation_mode(&self) -> ComputationMode {
        self.mode
    }

    fn free_all(&mut self) {
        self.used = 0;
        self.next = 0;
    }

    fn allocate(&mut self, volume: usize, dtype: DataType) -> Option<Buffer> {
        let bytes = volume.checked_mul(dtype.size_bytes())?;
        if bytes > self.remaining() {
            return None;
        }
        self.used += bytes;
        let buffer = match self.buffers.get(self.next) {
            Some(recycled) => {
                let mut data = recycled.write();
                data.clear();
                data.resize(volume, 0.0);
                drop(data);
                recycled.clone()
            }
            None => {
                let fresh = new_buffer(volume);
                self.buffers.push(fresh.clone());
                fresh
            }
        };
        self.next += 1;
        Some(buffer)
    }

    fn measure(&mut self, forward: &mut dyn FnMut(), mut backward: Option<&mut dyn FnMut()>) -> Timing {
        for _ in 0..self.warmup {
            forward();
            if let Some(b) = backward.as_mut() {
                b();
            }
        }

        let start = Instant::now();
        for _ in 0..self.repeat {
            forward();
        }
        let forward_time = start.elapsed().as_secs_f64() * 1000.0 / self.repeat as f64;

        let backward_time = match backward.as_mut() {
            Some(b) => {
                let start = Instant::now();
                for _ in 0..self.repeat {
                    b();
                }
                start.elapsed().as_secs_f64() * 1000.0 / self.repeat as f64
            }
            None => 0.0,
        };

        Timing {
            forward_time,
            backward_time,
        }
    }
}

impl ElementBinary {
    /// Measures one shard of this operator under the partitioning `pc`.
    ///
    /// Returns `false`, leaving `metrics` untouched, when `pc` cannot be
    /// realized for an operand or the output, or the arena runs out.
    pub fn measure_operator_cost(
        &self,
        sim: &mut dyn Simulator,
        pc: &ParallelConfig,
        metrics: &mut CostMetrics,
    ) -> bool {
        let (Some(sub_out), Some(sub_in1), Some(sub_in2)) = (
            self.output().get_sub_tensor(pc, true),
            self.input(0).get_sub_tensor(pc, false),
            self.input(1).get_sub_tensor(pc, false),
        ) else {
            return false;
        };
        if check_broadcast(&sub_in1.dims, &sub_in2.dims, &sub_out.dims).is_err() {
            return false;
        }

        let meta = ElementBinaryMeta {
            kind: self.kind(),
            profiling: false,
            inplace_a: self.inplace_a(),
            has_same_operands: self.has_same_operands(),
            same_operand_regions: self.same_operand_regions(),
            input1_domain: sub_in1.domain(),
            input2_domain: sub_in2.domain(),
            output_domain: sub_out.domain(),
        };
        let training = sim.computation_mode() == ComputationMode::Training;

        sim.free_all();
        let Some(buffers) = allocate_shard(sim, &meta, &sub_in1, &sub_in2, &sub_out, training) else {
            log::debug!(
                "[Measure Elewise Binary] name({}) arena exhausted",
                self.name().unwrap_or_default()
            );
            return false;
        };
        let Ok(forward_regions) = resolve_forward(meta.flags(), &buffers.forward) else {
            return false;
        };
        let backward_regions = match &buffers.backward {
            Some(handles) => {
                match resolve_backward(meta.inplace_a, meta.same_operand_regions, handles) {
                    Ok(regions) => Some(regions),
                    Err(_) => return false,
                }
            }
            None => None,
        };

        let mut forward = || forward_kernel_wrapper(&meta, &forward_regions);
        let timing = match &backward_regions {
            Some(regions) => {
                let mut backward = || backward_kernel_wrapper(&meta, regions);
                sim.measure(&mut forward, Some(&mut backward))
            }
            None => sim.measure(&mut forward, None),
        };

        let dtype_bytes = self.dtype().size_bytes();
        metrics.forward_time = timing.forward_time;
        metrics.backward_time = timing.backward_time;
        metrics.inputs_memory = (sub_in1.volume()
            + if meta.same_operand_regions { 0 } else { sub_in2.volume() })
            * dtype_bytes;
        metrics.outputs_memory = if meta.inplace_a {
            0
        } else {
            sub_out.volume() * dtype_bytes
        };

        if training {
            log::debug!(
                "[Measure Elewise Binary] name({}) num_elements({}) forward_time({:.4}) backward_time({:.4})",
                self.name().unwrap_or_default(),
                sub_out.volume(),
                metrics.forward_time,
                metrics.backward_time
            );
        } else {
            log::debug!(
                "[Measure Elewise Binary] name({}) num_elements({}) forward_time({:.4})",
                self.name().unwrap_or_default(),
                sub_out.volume(),
                metrics.forward_time
            );
        }
        true
    }
}

struct ShardBuffers {
    /// Forward handles in plan order.
    forward: Vec<Buffer>,
    /// Backward handles in plan order, in training mode.
    backward: Option<Vec<Buffer>>,
}

/// Allocates one shard's buffers, skipping every role that aliases another.
fn allocate_shard(
    sim: &mut dyn Simulator,
    meta: &ElementBinaryMeta,
    in1: &SubTensor,
    in2: &SubTensor,
    out: &SubTensor,
    training: bool,
) -> Option<ShardBuffers> {
    let in1_data = sim.allocate(in1.volume(), in1.dtype)?;
    let mut forward = vec![in1_data.clone()];
    let in2_data = if meta.same_operand_regions {
        in1_data.clone()
    } else {
        let b = sim.allocate(in2.volume(), in2.dtype)?;
        forward.push(b.clone());
        b
    };
    if !meta.inplace_a {
        forward.push(sim.allocate(out.volume(), out.dtype)?);
    }

    if !training {
        return Some(ShardBuffers {
            forward,
            backward: None,
        });
    }

    let in1_grad = sim.allocate(in1.volume(), in1.dtype)?;
    let mut backward = Vec::with_capacity(5);
    if meta.inplace_a {
        backward.push(in1_grad);
        backward.push(in1_data);
    } else {
        backward.push(sim.allocate(out.volume(), out.dtype)?);
        backward.push(in1_data);
        backward.push(in1_grad);
    }
    if !meta.same_operand_regions {
        backward.push(in2_data);
        backward.push(sim.allocate(in2.volume(), in2.dtype)?);
    }
    Some(ShardBuffers {
        forward,
        backward: Some(backward),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_exhaustion_and_reset() {
        let config = Config::default().with_simulator_capacity(64);
        let mut sim = ArenaSimulator::new(&config);
        assert!(sim.allocate(8, DataType::Float).is_some());
        assert_eq!(sim.used(), 32);
        assert!(sim.allocate(16, DataType::Float).is_none());
        sim.free_all();
        assert_eq!(sim.used(), 0);
        assert!(sim.allocate(16, DataType::Float).is_some());
    }

    #[test]
    fn test_oversized_allocation_is_refused() {
        let mut sim = ArenaSimulator::new(&Config::default());
        assert!(sim.allocate(usize::MAX, DataType::Double).is_none());
        assert!(sim.allocate(usize::MAX / 2, DataType::Float).is_none());
        assert_eq!(sim.used(), 0);
    }

    #[test]
    fn test_recycled_buffers_are_zeroed() {
        let mut sim = ArenaSimulator::new(&Config::default());
        let first = sim.allocate(4, DataType::Float).unwrap();
        first.write().fill(3.0);
        sim.free_all();
        let again = sim.allocate(6, DataType::Float).unwrap();
        assert_eq!(*again.read(), vec![0.0; 6]);
    }
}

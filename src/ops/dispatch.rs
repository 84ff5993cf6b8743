//! Kernel wrappers over resolved shard buffers.
//!
//! The wrappers take regions already resolved into named roles, so they
//! never look at handle positions. They own the lock discipline:
//!
//! - forward holds read locks on the operands and a write lock on the output
//!   for the duration of the kernel; an aliased role is locked once
//! - backward computes every contribution under read locks, releases them,
//!   then takes one gradient write lock at a time, so concurrent shards
//!   accumulating into a shared (broadcast) gradient are serialized and no
//!   two write locks are ever held together
//!
//! With `profiling` set in the runtime state, each call is timed and logged
//! at debug level.

use super::cpu::{self, Operand};
use super::Buffer;
use crate::operator::ElementBinaryMeta;
use crate::resolve::{BackwardRegions, OperandRegions};
use std::time::Instant;

/// Runs the forward kernel for one shard.
pub fn forward_kernel_wrapper(meta: &ElementBinaryMeta, regions: &OperandRegions<Buffer>) {
    let start = meta.profiling.then(Instant::now);
    let s1 = &meta.input1_domain.extents;
    let s2 = &meta.input2_domain.extents;
    let so = &meta.output_domain.extents;

    if regions.aliasing.out_is_in1 {
        let mut out = regions.out.write();
        if regions.aliasing.in2_is_in1 {
            cpu::forward(meta.kind, Operand::Output, s1, Operand::Output, s2, &mut out, so);
        } else {
            let in2 = regions.in2.read();
            cpu::forward(meta.kind, Operand::Output, s1, Operand::Slice(&in2), s2, &mut out, so);
        }
    } else {
        let in1 = regions.in1.read();
        if regions.aliasing.in2_is_in1 {
            let mut out = regions.out.write();
            cpu::forward(meta.kind, Operand::Slice(&in1), s1, Operand::Slice(&in1), s2, &mut out, so);
        } else {
            let in2 = regions.in2.read();
            let mut out = regions.out.write();
            cpu::forward(meta.kind, Operand::Slice(&in1), s1, Operand::Slice(&in2), s2, &mut out, so);
        }
    }

    if let Some(t) = start {
        log::debug!(
            "[{}] forward {} elements {:.4}ms",
            meta.kind,
            meta.output_domain.volume(),
            t.elapsed().as_secs_f64() * 1000.0
        );
    }
}

/// Runs the backward kernel for one shard, accumulating into the gradients.
///
/// When operand-1's gradient is the output gradient (in-place), the shared
/// region is overwritten with operand-1's gradient instead of accumulated:
/// its previous contents were the output gradient being consumed.
pub fn backward_kernel_wrapper(meta: &ElementBinaryMeta, regions: &BackwardRegions<Buffer>) {
    let start = meta.profiling.then(Instant::now);
    let s1 = &meta.input1_domain.extents;
    let s2 = &meta.input2_domain.extents;
    let so = &meta.output_domain.extents;
    let alias = regions.aliasing;

    let (d1, d2) = {
        let out_grad = regions.out_grad.read();
        let in1 = regions.in1.read();
        if alias.in2_is_in1 {
            cpu::backward(meta.kind, &out_grad, &in1, s1, &in1, s2, so)
        } else {
            let in2 = regions.in2.read();
            cpu::backward(meta.kind, &out_grad, &in1, s1, &in2, s2, so)
        }
    };

    if alias.in1_grad_is_out_grad {
        let mut grad = regions.out_grad.write();
        grad.copy_from_slice(&d1);
        if alias.in2_is_in1 {
            cpu::accumulate(&mut grad, &d2);
        }
    } else {
        let mut grad = regions.in1_grad.write();
        cpu::accumulate(&mut grad, &d1);
        if alias.in2_is_in1 {
            cpu::accumulate(&mut grad, &d2);
        }
    }

    if !alias.in2_is_in1 {
        let mut grad = regions.in2_grad.write();
        cpu::accumulate(&mut grad, &d2);
    }

    if let Some(t) = start {
        log::debug!(
            "[{}] backward {} elements {:.4}ms",
            meta.kind,
            meta.output_domain.volume(),
            t.elapsed().as_secs_f64() * 1000.0
        );
    }
}

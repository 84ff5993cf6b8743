//! Parallel CPU reference kernels
//!
//! # CPU Backend
//!
//! Reference implementations of the elementwise-binary forward and backward
//! passes over flat `f32` shards.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon)
//! - Index-aligned broadcasting: a unit (or missing) operand dimension is
//!   repeated along the output
//! - Backward reduces each contribution onto the operand element it came
//!   from, so broadcast operands receive summed gradients
//!
//! ## Aliasing
//!
//! An operand passed as [`Operand::Output`] is read from the output slice
//! itself. Each output element is read before it is written, which is all an
//! in-place elementwise kernel needs. After an in-place forward, operand-1's
//! region holds the result, so a backward that reads operand-1 sees the
//! result rather than the original values.

use crate::kind::BinaryKind;
use crate::tensors::strides_of;
use rayon::prelude::*;

/// Where a forward operand is read from.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    /// A separate buffer.
    Slice(&'a [f32]),
    /// The output slice (in-place).
    Output,
}

/// Maps flat output indices to flat operand indices under broadcasting.
#[derive(Debug, Clone)]
pub struct BroadcastIndex {
    out_extents: Vec<usize>,
    strides: Vec<usize>,
    identity: bool,
}

impl BroadcastIndex {
    /// Index map from an output of `out_extents` into an operand of `operand_extents`.
    pub fn new(operand_extents: &[usize], out_extents: &[usize]) -> Self {
        let dense = strides_of(operand_extents);
        let strides = out_extents
            .iter()
            .enumerate()
            .map(|(i, &o)| match operand_extents.get(i) {
                Some(&e) if e == o => dense[i],
                _ => 0,
            })
            .collect();
        Self {
            out_extents: out_extents.to_vec(),
            strides,
            identity: operand_extents == out_extents,
        }
    }

    /// Operand offset of output element `k`.
    #[inline]
    pub fn offset(&self, mut k: usize) -> usize {
        if self.identity {
            return k;
        }
        let mut offset = 0;
        for (&e, &s) in self.out_extents.iter().zip(&self.strides) {
            offset += (k % e) * s;
            k /= e;
        }
        offset
    }
}

/// Computes `out = in1 (op) in2` elementwise.
///
/// Shapes are shard extents, innermost first; operands must broadcast to
/// `out_shape` (checked at init).
pub fn forward(
    kind: BinaryKind,
    in1: Operand<'_>,
    in1_shape: &[usize],
    in2: Operand<'_>,
    in2_shape: &[usize],
    out: &mut [f32],
    out_shape: &[usize],
) {
    let map1 = BroadcastIndex::new(in1_shape, out_shape);
    let map2 = BroadcastIndex::new(in2_shape, out_shape);

    match (in1, in2) {
        (Operand::Slice(a), Operand::Slice(b)) => {
            out.par_iter_mut().enumerate().for_each(|(k, y)| {
                *y = kind.apply(a[map1.offset(k)], b[map2.offset(k)]);
            });
        }
        (Operand::Output, Operand::Slice(b)) => {
            out.par_iter_mut().enumerate().for_each(|(k, y)| {
                *y = kind.apply(*y, b[map2.offset(k)]);
            });
        }
        (Operand::Slice(a), Operand::Output) => {
            out.par_iter_mut().enumerate().for_each(|(k, y)| {
                *y = kind.apply(a[map1.offset(k)], *y);
            });
        }
        (Operand::Output, Operand::Output) => {
            out.par_iter_mut().for_each(|y| *y = kind.apply(*y, *y));
        }
    }
}

/// Gradient contributions `(dL/din1, dL/din2)`, reduced to each operand's shape.
///
/// Nothing is written; the caller accumulates the returned vectors into the
/// gradient regions under the aliasing rules of the operator.
pub fn backward(
    kind: BinaryKind,
    out_grad: &[f32],
    in1: &[f32],
    in1_shape: &[usize],
    in2: &[f32],
    in2_shape: &[usize],
    out_shape: &[usize],
) -> (Vec<f32>, Vec<f32>) {
    let map1 = BroadcastIndex::new(in1_shape, out_shape);
    let map2 = BroadcastIndex::new(in2_shape, out_shape);

    let partials: Vec<(usize, f32, usize, f32)> = out_grad
        .par_iter()
        .enumerate()
        .map(|(k, &dy)| {
            let (i, j) = (map1.offset(k), map2.offset(k));
            let (da, db) = kind.partials(in1[i], in2[j]);
            (i, dy * da, j, dy * db)
        })
        .collect();

    let mut d1 = vec![0.0; in1.len()];
    let mut d2 = vec![0.0; in2.len()];
    for (i, g1, j, g2) in partials {
        d1[i] += g1;
        d2[j] += g2;
    }
    (d1, d2)
}

/// Adds `src` into `dst` elementwise.
///
/// Sequential: callers hold a write lock on `dst`, and a rayon join here
/// could steal a sibling shard that waits on the same lock.
pub fn accumulate(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_broadcast_inner_unit() {
        // in1 [2,1] (two rows of one), in2 [2,2]
        let a = [1.0, 10.0];
        let b = [1.0, 2.0, 3.0, 4.0];
        let mut out = [0.0; 4];
        forward(
            BinaryKind::Add,
            Operand::Slice(&a),
            &[1, 2],
            Operand::Slice(&b),
            &[2, 2],
            &mut out,
            &[2, 2],
        );
        assert_eq!(out, [2.0, 3.0, 13.0, 14.0]);
    }

    #[test]
    fn test_forward_in_place() {
        let b = [2.0, 3.0];
        let mut out = [4.0, 5.0];
        forward(
            BinaryKind::Multiply,
            Operand::Output,
            &[2],
            Operand::Slice(&b),
            &[2],
            &mut out,
            &[2],
        );
        assert_eq!(out, [8.0, 15.0]);
    }

    #[test]
    fn test_backward_reduces_broadcast() {
        let dy = [1.0, 1.0, 1.0, 1.0];
        let (d1, d2) = backward(
            BinaryKind::Subtract,
            &dy,
            &[0.0, 0.0],
            &[1, 2],
            &[0.0; 4],
            &[2, 2],
            &[2, 2],
        );
        assert_eq!(d1, vec![2.0, 2.0]);
        assert_eq!(d2, vec![-1.0; 4]);
    }
}

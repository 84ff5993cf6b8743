//! Broadcast legality of elementwise operands.
//!
//! Dimensions are compared index by index (index 0 innermost). An operand
//! whose rank is below the output's simply has no extent at the trailing
//! indices; those are treated as unit dimensions and skipped.

use crate::error::{OpError, Result};
use crate::kind::BinaryKind;

/// True if `operand` can broadcast to `output`: every dimension present in
/// the operand equals the output's extent or is exactly 1.
pub fn can_broadcast_to(operand: &[usize], output: &[usize]) -> bool {
    operand.len() <= output.len()
        && operand
            .iter()
            .zip(output)
            .all(|(&a, &o)| a == o || a == 1)
}

/// Verifies that both operands can broadcast to `output`.
///
/// # Errors
/// `ShapeMismatch` naming the first offending operand.
pub fn check_broadcast(in1: &[usize], in2: &[usize], output: &[usize]) -> Result<()> {
    for operand in [in1, in2] {
        if !can_broadcast_to(operand, output) {
            return Err(OpError::ShapeMismatch {
                context: "broadcast",
                lhs: operand.to_vec(),
                rhs: output.to_vec(),
            });
        }
    }
    Ok(())
}

/// Output shape obtained by broadcasting `in1` against `in2`.
///
/// # Errors
/// `ShapeMismatch` if some dimension differs and neither side is 1.
pub fn broadcast_output_shape(in1: &[usize], in2: &[usize]) -> Result<Vec<usize>> {
    let rank = in1.len().max(in2.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let a = in1.get(i).copied().unwrap_or(1);
        let b = in2.get(i).copied().unwrap_or(1);
        let dim = if a == b || b == 1 {
            a
        } else if a == 1 {
            b
        } else {
            return Err(OpError::ShapeMismatch {
                context: "broadcast",
                lhs: in1.to_vec(),
                rhs: in2.to_vec(),
            });
        };
        out.push(dim);
    }
    Ok(out)
}

/// Rejects differently shaped operands for kinds that cannot broadcast.
///
/// # Errors
/// `UnsupportedBroadcast` if the shapes differ and `kind` lacks broadcast support.
pub fn ensure_broadcast_allowed(kind: BinaryKind, in1: &[usize], in2: &[usize]) -> Result<()> {
    if in1 != in2 && !kind.capabilities().supports_broadcast {
        return Err(OpError::UnsupportedBroadcast {
            kind,
            lhs: in1.to_vec(),
            rhs: in2.to_vec(),
        });
    }
    Ok(())
}

/// Validates a kind/shape combination and returns the output shape.
///
/// # Errors
/// `UnsupportedBroadcast` or `ShapeMismatch`.
pub fn binary_output_shape(kind: BinaryKind, in1: &[usize], in2: &[usize]) -> Result<Vec<usize>> {
    ensure_broadcast_allowed(kind, in1, in2)?;
    let out = broadcast_output_shape(in1, in2)?;
    check_broadcast(in1, in2, &out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_dimension_broadcasts() {
        assert!(can_broadcast_to(&[4, 1], &[4, 4]));
        assert!(can_broadcast_to(&[4], &[4, 3]));
        assert!(!can_broadcast_to(&[3, 4], &[4, 4]));
        assert!(!can_broadcast_to(&[4, 4, 1], &[4, 4]));
    }

    #[test]
    fn test_output_shape() {
        assert_eq!(broadcast_output_shape(&[4, 1], &[4, 4]).unwrap(), vec![4, 4]);
        assert_eq!(broadcast_output_shape(&[1, 3], &[5]).unwrap(), vec![5, 3]);
        assert!(broadcast_output_shape(&[2], &[3]).is_err());
    }
}

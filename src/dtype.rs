//! Scalar element types and promotion.

use core::fmt;

/// Scalar data type of a tensor.
///
/// Variants are declared from lowest to highest rank; the derived ordering is
/// the promotion order used when two operands disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Half,
    #[default]
    Float,
    Double,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Boolean => 1,
            Self::Half => 2,
            Self::Int32 | Self::Float => 4,
            Self::Int64 | Self::Double => 8,
        }
    }

    /// The type both operands are promoted to.
    #[must_use]
    pub fn promote(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "bool",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Half => "half",
            Self::Float => "float",
            Self::Double => "double",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_order() {
        assert_eq!(DataType::Half.promote(DataType::Float), DataType::Float);
        assert_eq!(DataType::Double.promote(DataType::Int32), DataType::Double);
        assert_eq!(DataType::Int64.promote(DataType::Int64), DataType::Int64);
        assert!(DataType::Boolean < DataType::Int32);
    }
}

//! Elementwise-binary operator kinds and their capabilities.
//!
//! Every place that needs to know whether a kind may broadcast or alias its
//! output consults [`BinaryKind::capabilities`] instead of matching on the
//! kind itself.

use core::fmt;

/// The four elementwise-binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// What a kind is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Operands may have different (broadcast-compatible) shapes.
    pub supports_broadcast: bool,
    /// The output may alias operand-1's buffer.
    pub supports_inplace: bool,
}

impl BinaryKind {
    /// All kinds, in operator-code order.
    pub const ALL: [Self; 4] = [Self::Add, Self::Subtract, Self::Multiply, Self::Divide];

    /// Capability table.
    ///
    /// Subtract and divide never alias: the result would overwrite operand-1
    /// while operand-2's dependent reads are still pending. Multiply and
    /// divide require identical operand shapes.
    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Add => Capabilities {
                supports_broadcast: true,
                supports_inplace: true,
            },
            Self::Subtract => Capabilities {
                supports_broadcast: true,
                supports_inplace: false,
            },
            Self::Multiply => Capabilities {
                supports_broadcast: false,
                supports_inplace: true,
            },
            Self::Divide => Capabilities {
                supports_broadcast: false,
                supports_inplace: false,
            },
        }
    }

    /// Stable numeric code, used when hashing operators.
    pub const fn op_code(self) -> u64 {
        match self {
            Self::Add => 0,
            Self::Subtract => 1,
            Self::Multiply => 2,
            Self::Divide => 3,
        }
    }

    /// Applies the operator to two scalars.
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Subtract => a - b,
            Self::Multiply => a * b,
            Self::Divide => a / b,
        }
    }

    /// Partial derivatives `(d/da, d/db)` at `(a, b)`.
    #[inline]
    pub fn partials(self, a: f32, b: f32) -> (f32, f32) {
        match self {
            Self::Add => (1.0, 1.0),
            Self::Subtract => (1.0, -1.0),
            Self::Multiply => (b, a),
            Self::Divide => (1.0 / b, -a / (b * b)),
        }
    }
}

impl fmt::Display for BinaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        };
        f.write_str(name)
    }
}

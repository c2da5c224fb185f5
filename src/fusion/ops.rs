//! Operator tags used by expression trees and generated kernels

use crate::dtype::{DType, Element};

/// Element-wise unary operations and named math functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Negation
    Neg,
    /// Absolute value
    Abs,
    /// Square root
    Sqrt,
    /// Natural exponential
    Exp,
    /// Natural logarithm
    Log,
    /// Sine
    Sin,
    /// Cosine
    Cos,
    /// Tangent
    Tan,
    /// Hyperbolic tangent
    Tanh,
    /// Round towards negative infinity
    Floor,
    /// Round towards positive infinity
    Ceil,
}

impl UnaryOp {
    /// Tag used in shape signatures and kernel names
    pub const fn name(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Tanh => "tanh",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
        }
    }

    /// Check that the operation can be generated for `dtype`
    pub fn supports(self, dtype: DType) -> bool {
        match self {
            Self::Neg => dtype.is_signed(),
            Self::Abs => true,
            _ => dtype.is_float(),
        }
    }
}

/// Element-wise binary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Power
    Pow,
    /// Element-wise minimum
    Min,
    /// Element-wise maximum
    Max,
}

impl BinaryOp {
    /// Tag used in shape signatures and kernel names
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Pow => "pow",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// Infix symbol for arithmetic operators, `None` for function-style ops
    pub const fn symbol(self) -> Option<&'static str> {
        match self {
            Self::Add => Some("+"),
            Self::Sub => Some("-"),
            Self::Mul => Some("*"),
            Self::Div => Some("/"),
            Self::Pow | Self::Min | Self::Max => None,
        }
    }

    /// Check that the operation can be generated for `dtype`
    pub fn supports(self, dtype: DType) -> bool {
        match self {
            Self::Pow => dtype.is_float(),
            _ => true,
        }
    }
}

/// How the result of a fused expression is stored into the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignOp {
    /// `=`: overwrite the target
    Set,
    /// `+=`
    Add,
    /// `-=`
    Sub,
    /// `*=`
    Mul,
    /// `/=`
    Div,
}

impl AssignOp {
    /// Tag used in shape signatures and kernel names
    pub const fn name(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }

    /// The binary operation fused into the store, if any
    pub const fn binary(self) -> Option<BinaryOp> {
        match self {
            Self::Set => None,
            Self::Add => Some(BinaryOp::Add),
            Self::Sub => Some(BinaryOp::Sub),
            Self::Mul => Some(BinaryOp::Mul),
            Self::Div => Some(BinaryOp::Div),
        }
    }
}

/// Associative, commutative reduction operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum of all elements
    Sum,
    /// Product of all elements
    Prod,
    /// Smallest element
    Min,
    /// Largest element
    Max,
}

impl ReduceOp {
    /// Tag used in shape signatures and kernel names
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Prod => "prod",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// Neutral element of the operator
    pub fn identity<T: Element>(self) -> T {
        match self {
            Self::Sum => T::zero(),
            Self::Prod => T::one(),
            Self::Min => T::max_value(),
            Self::Max => T::min_value(),
        }
    }

    /// Combine two partial results
    #[inline]
    pub fn combine<T: Element>(self, a: T, b: T) -> T {
        match self {
            Self::Sum => a + b,
            Self::Prod => a * b,
            Self::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
            Self::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_only_functions() {
        assert!(UnaryOp::Sqrt.supports(DType::F32));
        assert!(!UnaryOp::Sqrt.supports(DType::I32));
        assert!(UnaryOp::Abs.supports(DType::U32));
        assert!(!UnaryOp::Neg.supports(DType::U32));
        assert!(!BinaryOp::Pow.supports(DType::I32));
    }

    #[test]
    fn test_reduce_identity_is_neutral() {
        for op in [ReduceOp::Sum, ReduceOp::Prod, ReduceOp::Min, ReduceOp::Max] {
            let id: f64 = op.identity();
            assert_eq!(op.combine(id, 3.5), 3.5, "{op:?}");
            assert_eq!(op.combine(-2.0, id), -2.0, "{op:?}");
        }
    }
}

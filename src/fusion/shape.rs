//! Structural signatures of expression trees and kernels
//!
//! A signature is the cache key of a generated kernel. It records what the
//! kernel computes and for which dtype, never which vectors or scalar values
//! it is bound to.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::ops::{AssignOp, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;

/// Shape of an expression tree with leaf identities erased
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprShape {
    /// A vector operand, read at the current index
    Vector,
    /// A scalar operand
    Scalar,
    /// A unary operation applied to a subtree
    Unary(UnaryOp, Box<ExprShape>),
    /// A binary operation applied to two subtrees
    Binary(BinaryOp, Box<ExprShape>, Box<ExprShape>),
}

impl ExprShape {
    /// Number of leaves (vector and scalar), i.e. the number of bound arguments
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Vector | Self::Scalar => 1,
            Self::Unary(_, child) => child.leaf_count(),
            Self::Binary(_, lhs, rhs) => lhs.leaf_count() + rhs.leaf_count(),
        }
    }

    /// Leaf kinds in traversal order (`true` for vector leaves)
    pub fn leaf_kinds(&self) -> Vec<bool> {
        let mut kinds = Vec::with_capacity(self.leaf_count());
        self.collect_leaf_kinds(&mut kinds);
        kinds
    }

    fn collect_leaf_kinds(&self, out: &mut Vec<bool>) {
        match self {
            Self::Vector => out.push(true),
            Self::Scalar => out.push(false),
            Self::Unary(_, child) => child.collect_leaf_kinds(out),
            Self::Binary(_, lhs, rhs) => {
                lhs.collect_leaf_kinds(out);
                rhs.collect_leaf_kinds(out);
            }
        }
    }

    /// First operation in the tree that cannot be generated for `dtype`
    pub fn unsupported_op(&self, dtype: DType) -> Option<&'static str> {
        match self {
            Self::Vector | Self::Scalar => None,
            Self::Unary(op, child) => {
                if op.supports(dtype) {
                    child.unsupported_op(dtype)
                } else {
                    Some(op.name())
                }
            }
            Self::Binary(op, lhs, rhs) => {
                if op.supports(dtype) {
                    lhs.unsupported_op(dtype)
                        .or_else(|| rhs.unsupported_op(dtype))
                } else {
                    Some(op.name())
                }
            }
        }
    }
}

impl fmt::Display for ExprShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector => f.write_str("v"),
            Self::Scalar => f.write_str("s"),
            Self::Unary(op, child) => write!(f, "{}({})", op.name(), child),
            Self::Binary(op, lhs, rhs) => write!(f, "{}({},{})", op.name(), lhs, rhs),
        }
    }
}

/// Cache key of a generated kernel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signature {
    /// Fused element-wise expression stored into a target vector
    Elementwise {
        /// Element type
        dtype: DType,
        /// Store mode
        assign: AssignOp,
        /// Expression tree shape
        shape: ExprShape,
    },
    /// Fused element-wise expression reduced to per-group partials
    Reduce {
        /// Element type
        dtype: DType,
        /// Reduction operator
        op: ReduceOp,
        /// Expression tree shape
        shape: ExprShape,
        /// Number of partial results produced
        groups: u32,
    },
    /// CSR row-wise product `y (+)= alpha * A x`
    CsrProduct {
        /// Element type of values and vectors
        dtype: DType,
        /// Accumulate into `y` instead of overwriting it
        accumulate: bool,
    },
    /// `out[k] = src[idx[k]]`, used for the sparse value exchange
    Gather {
        /// Element type
        dtype: DType,
    },
}

impl Signature {
    /// Element type the kernel operates on
    pub fn dtype(&self) -> DType {
        match self {
            Self::Elementwise { dtype, .. }
            | Self::Reduce { dtype, .. }
            | Self::CsrProduct { dtype, .. }
            | Self::Gather { dtype } => *dtype,
        }
    }

    /// Stable hash of the signature
    pub fn hash_u64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Entry point name of the generated kernel
    pub fn kernel_name(&self) -> String {
        let prefix = match self {
            Self::Elementwise { .. } => "ew",
            Self::Reduce { .. } => "reduce",
            Self::CsrProduct { .. } => "csr",
            Self::Gather { .. } => "gather",
        };
        format!(
            "vexr_{}_{}_{:016x}",
            prefix,
            self.dtype().short_name(),
            self.hash_u64()
        )
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elementwise {
                dtype,
                assign,
                shape,
            } => write!(f, "{dtype} {} <- {shape}", assign.name()),
            Self::Reduce {
                dtype,
                op,
                shape,
                groups,
            } => write!(f, "{dtype} {}[{groups}] <- {shape}", op.name()),
            Self::CsrProduct { dtype, accumulate } => {
                write!(f, "{dtype} csr {}", if *accumulate { "acc" } else { "set" })
            }
            Self::Gather { dtype } => write!(f, "{dtype} gather"),
        }
    }
}

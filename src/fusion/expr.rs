//! Expression trees over vectors
//!
//! Arithmetic on `&Vector` values builds an [`Expr`] instead of computing
//! anything. The tree is only lowered and executed when it is assigned to a
//! target vector or handed to a `Reductor`, at which point the whole tree is
//! compiled into a single kernel.
//!
//! ```ignore
//! // one kernel, no temporaries
//! y.assign(2.0f32 * &x + sqrt(&y) - cos(&z))?;
//! ```

use std::ops::{Add, Div, Mul, Neg, Sub};

use super::ops::{BinaryOp, UnaryOp};
use super::shape::ExprShape;
use crate::dtype::Element;
use crate::runtime::Runtime;
use crate::vector::Vector;

/// Expression tree node
pub enum Expr<'a, T: Element, R: Runtime> {
    /// A vector operand
    Vector(&'a Vector<T, R>),
    /// A scalar operand, broadcast to every element
    Scalar(T),
    /// A unary operation
    Unary(UnaryOp, Box<Expr<'a, T, R>>),
    /// A binary operation
    Binary(BinaryOp, Box<Expr<'a, T, R>>, Box<Expr<'a, T, R>>),
}

/// A leaf of a lowered expression, bound to one kernel argument
pub(crate) enum Leaf<'a, T: Element, R: Runtime> {
    Vector(&'a Vector<T, R>),
    Scalar(T),
}

impl<T: Element, R: Runtime> Clone for Expr<'_, T, R> {
    fn clone(&self) -> Self {
        match self {
            Self::Vector(v) => Self::Vector(v),
            Self::Scalar(s) => Self::Scalar(*s),
            Self::Unary(op, e) => Self::Unary(*op, e.clone()),
            Self::Binary(op, l, r) => Self::Binary(*op, l.clone(), r.clone()),
        }
    }
}

impl<T: Element, R: Runtime> std::fmt::Debug for Expr<'_, T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vector(v) => write!(f, "Vector(len={})", v.len()),
            Self::Scalar(s) => write!(f, "{s:?}"),
            Self::Unary(op, e) => write!(f, "{}({e:?})", op.name()),
            Self::Binary(op, l, r) => write!(f, "{}({l:?}, {r:?})", op.name()),
        }
    }
}

impl<'a, T: Element, R: Runtime> Expr<'a, T, R> {
    /// Apply a unary operation
    pub fn unary(op: UnaryOp, operand: impl Into<Self>) -> Self {
        Self::Unary(op, Box::new(operand.into()))
    }

    /// Apply a binary operation
    pub fn binary(op: BinaryOp, lhs: impl Into<Self>, rhs: impl Into<Self>) -> Self {
        Self::Binary(op, Box::new(lhs.into()), Box::new(rhs.into()))
    }

    /// Lower to a shape and the leaves in binding order
    ///
    /// Both come out of the same left-to-right, depth-first walk, so the
    /// k-th leaf is always bound to the k-th leaf parameter of the kernel
    /// generated for the shape.
    pub(crate) fn lower(&self) -> (ExprShape, Vec<Leaf<'a, T, R>>) {
        let mut leaves = Vec::new();
        let shape = self.lower_into(&mut leaves);
        (shape, leaves)
    }

    fn lower_into(&self, leaves: &mut Vec<Leaf<'a, T, R>>) -> ExprShape {
        match self {
            Self::Vector(v) => {
                leaves.push(Leaf::Vector(*v));
                ExprShape::Vector
            }
            Self::Scalar(s) => {
                leaves.push(Leaf::Scalar(*s));
                ExprShape::Scalar
            }
            Self::Unary(op, e) => ExprShape::Unary(*op, Box::new(e.lower_into(leaves))),
            Self::Binary(op, l, r) => {
                let lhs = l.lower_into(leaves);
                let rhs = r.lower_into(leaves);
                ExprShape::Binary(*op, Box::new(lhs), Box::new(rhs))
            }
        }
    }

    /// First vector operand in traversal order
    pub(crate) fn first_vector(&self) -> Option<&'a Vector<T, R>> {
        match self {
            Self::Vector(v) => Some(*v),
            Self::Scalar(_) => None,
            Self::Unary(_, e) => e.first_vector(),
            Self::Binary(_, l, r) => l.first_vector().or_else(|| r.first_vector()),
        }
    }
}

impl<'a, T: Element, R: Runtime> From<&'a Vector<T, R>> for Expr<'a, T, R> {
    fn from(v: &'a Vector<T, R>) -> Self {
        Self::Vector(v)
    }
}

macro_rules! impl_scalar_operand {
    ($($t:ty),*) => {$(
        impl<'a, R: Runtime> From<$t> for Expr<'a, $t, R> {
            fn from(s: $t) -> Self {
                Self::Scalar(s)
            }
        }

        impl<'a, R: Runtime> Add<&'a Vector<$t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn add(self, rhs: &'a Vector<$t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Add, self, rhs)
            }
        }

        impl<'a, R: Runtime> Add<Expr<'a, $t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn add(self, rhs: Expr<'a, $t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Add, self, rhs)
            }
        }

        impl<'a, R: Runtime> Sub<&'a Vector<$t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn sub(self, rhs: &'a Vector<$t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Sub, self, rhs)
            }
        }

        impl<'a, R: Runtime> Sub<Expr<'a, $t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn sub(self, rhs: Expr<'a, $t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Sub, self, rhs)
            }
        }

        impl<'a, R: Runtime> Mul<&'a Vector<$t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn mul(self, rhs: &'a Vector<$t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Mul, self, rhs)
            }
        }

        impl<'a, R: Runtime> Mul<Expr<'a, $t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn mul(self, rhs: Expr<'a, $t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Mul, self, rhs)
            }
        }

        impl<'a, R: Runtime> Div<&'a Vector<$t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn div(self, rhs: &'a Vector<$t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Div, self, rhs)
            }
        }

        impl<'a, R: Runtime> Div<Expr<'a, $t, R>> for $t {
            type Output = Expr<'a, $t, R>;
            fn div(self, rhs: Expr<'a, $t, R>) -> Self::Output {
                Expr::binary(BinaryOp::Div, self, rhs)
            }
        }
    )*};
}

impl_scalar_operand!(f32, f64, i32, u32);

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<'a, T, R, Rhs> $trait<Rhs> for Expr<'a, T, R>
        where
            T: Element,
            R: Runtime,
            Rhs: Into<Expr<'a, T, R>>,
        {
            type Output = Expr<'a, T, R>;
            fn $method(self, rhs: Rhs) -> Self::Output {
                Expr::binary($op, self, rhs)
            }
        }

        impl<'a, T, R, Rhs> $trait<Rhs> for &'a Vector<T, R>
        where
            T: Element,
            R: Runtime,
            Rhs: Into<Expr<'a, T, R>>,
        {
            type Output = Expr<'a, T, R>;
            fn $method(self, rhs: Rhs) -> Self::Output {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

impl_binary_operator!(Add, add, BinaryOp::Add);
impl_binary_operator!(Sub, sub, BinaryOp::Sub);
impl_binary_operator!(Mul, mul, BinaryOp::Mul);
impl_binary_operator!(Div, div, BinaryOp::Div);

impl<'a, T: Element, R: Runtime> Neg for Expr<'a, T, R> {
    type Output = Expr<'a, T, R>;
    fn neg(self) -> Self::Output {
        Expr::unary(UnaryOp::Neg, self)
    }
}

impl<'a, T: Element, R: Runtime> Neg for &'a Vector<T, R> {
    type Output = Expr<'a, T, R>;
    fn neg(self) -> Self::Output {
        Expr::unary(UnaryOp::Neg, self)
    }
}

macro_rules! unary_functions {
    ($($variant:ident),*) => {
        paste::paste! {$(
            #[doc = concat!("Element-wise `", stringify!($variant), "`")]
            pub fn [<$variant:lower>]<'a, T: Element, R: Runtime>(
                x: impl Into<Expr<'a, T, R>>,
            ) -> Expr<'a, T, R> {
                Expr::unary(UnaryOp::$variant, x)
            }
        )*}
    };
}

unary_functions!(Abs, Sqrt, Exp, Log, Sin, Cos, Tan, Tanh, Floor, Ceil);

macro_rules! binary_functions {
    ($($variant:ident),*) => {
        paste::paste! {$(
            #[doc = concat!("Element-wise `", stringify!($variant), "`")]
            pub fn [<$variant:lower>]<'a, T: Element, R: Runtime>(
                a: impl Into<Expr<'a, T, R>>,
                b: impl Into<Expr<'a, T, R>>,
            ) -> Expr<'a, T, R> {
                Expr::binary(BinaryOp::$variant, a, b)
            }
        )*}
    };
}

binary_functions!(Pow, Min, Max);

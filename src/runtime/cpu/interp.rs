//! Host execution of generated kernels
//!
//! The CPU backend does not compile kernel text. Element-wise and reduction
//! shapes are lowered once into a [`Program`] with leaf slots numbered in
//! traversal order. A launch evaluates the program one element at a time and
//! stores each result directly, so no intermediate arrays are built.
//!
//! Chunks are processed in parallel with rayon when the `rayon` feature is
//! enabled. Every element index belongs to exactly one chunk, so writes from
//! different chunks never overlap.

use std::marker::PhantomData;

use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::fusion::ops::{AssignOp, BinaryOp, ReduceOp, UnaryOp};
use crate::fusion::{ExprShape, Signature};

/// Elements evaluated per task
const CHUNK: usize = 4096;

/// A launch argument resolved against the host allocation table
#[derive(Debug, Clone, Copy)]
pub(crate) enum Bound {
    Buffer { ptr: u64, bytes: usize },
    Scalar(f64),
}

// ============================================================================
// Lowered expressions
// ============================================================================

/// Expression shape lowered for per-element evaluation
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Program {
    /// Leaf slot `k`, a vector or a scalar
    Leaf(usize),
    Unary(UnaryOp, Box<Program>),
    Binary(BinaryOp, Box<Program>, Box<Program>),
}

impl Program {
    /// Lower the expression of an element-wise or reduction kernel
    pub(crate) fn lower(signature: &Signature) -> Option<Self> {
        match signature {
            Signature::Elementwise { shape, .. } | Signature::Reduce { shape, .. } => {
                Some(Self::lower_shape(shape, &mut 0))
            }
            Signature::CsrProduct { .. } | Signature::Gather { .. } => None,
        }
    }

    fn lower_shape(shape: &ExprShape, next: &mut usize) -> Self {
        match shape {
            ExprShape::Vector | ExprShape::Scalar => {
                let slot = *next;
                *next += 1;
                Self::Leaf(slot)
            }
            ExprShape::Unary(op, child) => Self::Unary(*op, Box::new(Self::lower_shape(child, next))),
            ExprShape::Binary(op, lhs, rhs) => {
                let lhs = Self::lower_shape(lhs, next);
                let rhs = Self::lower_shape(rhs, next);
                Self::Binary(*op, Box::new(lhs), Box::new(rhs))
            }
        }
    }

    /// Value of element `i`
    ///
    /// # Safety
    /// `i` must be within every vector leaf.
    #[inline]
    unsafe fn eval_at<T: HostMath>(&self, leaves: &[Leaf<T>], i: usize) -> T {
        match self {
            Self::Leaf(k) => match leaves[*k] {
                Leaf::Vector(p) => p.read(i),
                Leaf::Scalar(s) => s,
            },
            Self::Unary(op, child) => T::unary(*op, child.eval_at(leaves, i)),
            Self::Binary(op, lhs, rhs) => T::binary(*op, lhs.eval_at(leaves, i), rhs.eval_at(leaves, i)),
        }
    }
}

/// Run one kernel launch to completion on the calling thread
///
/// `program` is the lowered expression for element-wise and reduction kernels.
pub(crate) fn execute(
    signature: &Signature,
    program: Option<&Program>,
    args: &[Bound],
    n: usize,
    device: &str,
) -> Result<()> {
    let cx = Context { args, device };
    let lowered = || program.ok_or_else(|| Error::Internal(format!("{signature} was not lowered")));
    match signature {
        Signature::Elementwise {
            dtype,
            assign,
            shape,
        } => {
            let program = lowered()?;
            crate::dispatch_dtype!(*dtype, T => { cx.elementwise::<T>(*assign, shape, program, n) })
        }
        Signature::Reduce {
            dtype,
            op,
            shape,
            groups,
        } => {
            let program = lowered()?;
            crate::dispatch_dtype!(*dtype, T => {
                cx.reduce::<T>(*op, shape, program, *groups as usize, n)
            })
        }
        Signature::CsrProduct { dtype, accumulate } => {
            crate::dispatch_dtype!(*dtype, T => { cx.csr_product::<T>(*accumulate, n) })
        }
        Signature::Gather { dtype } => crate::dispatch_dtype!(*dtype, T => { cx.gather::<T>(n) }),
    }
}

// ============================================================================
// Host arithmetic
// ============================================================================

/// Element arithmetic matching the generated device code
pub(crate) trait HostMath: Element {
    fn unary(op: UnaryOp, x: Self) -> Self;
    fn binary(op: BinaryOp, a: Self, b: Self) -> Self;
}

macro_rules! impl_float_math {
    ($t:ty) => {
        impl HostMath for $t {
            #[inline]
            fn unary(op: UnaryOp, x: Self) -> Self {
                match op {
                    UnaryOp::Neg => -x,
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Exp => x.exp(),
                    UnaryOp::Log => x.ln(),
                    UnaryOp::Sin => x.sin(),
                    UnaryOp::Cos => x.cos(),
                    UnaryOp::Tan => x.tan(),
                    UnaryOp::Tanh => x.tanh(),
                    UnaryOp::Floor => x.floor(),
                    UnaryOp::Ceil => x.ceil(),
                }
            }

            #[inline]
            fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Min => a.min(b),
                    BinaryOp::Max => a.max(b),
                }
            }
        }
    };
}

impl_float_math!(f32);
impl_float_math!(f64);

// Integer arithmetic wraps, and division by zero yields the dividend, as in
// WGSL. Float-only operations are rejected before a kernel is compiled.
macro_rules! impl_int_math {
    ($t:ty, $neg:expr, $abs:expr) => {
        impl HostMath for $t {
            #[inline]
            fn unary(op: UnaryOp, x: Self) -> Self {
                match op {
                    UnaryOp::Neg => $neg(x),
                    UnaryOp::Abs => $abs(x),
                    _ => x,
                }
            }

            #[inline]
            fn binary(op: BinaryOp, a: Self, b: Self) -> Self {
                match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Div => a.checked_div(b).unwrap_or(a),
                    BinaryOp::Pow => a,
                    BinaryOp::Min => a.min(b),
                    BinaryOp::Max => a.max(b),
                }
            }
        }
    };
}

impl_int_math!(i32, i32::wrapping_neg, i32::wrapping_abs);
impl_int_math!(u32, u32::wrapping_neg, |x: u32| x);

// ============================================================================
// Typed buffer views
// ============================================================================

/// Typed view of a host allocation
struct Ptr<T> {
    addr: u64,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ptr<T> {}

impl<T: Element> Ptr<T> {
    /// # Safety
    /// `i` must be in bounds.
    #[inline]
    unsafe fn read(&self, i: usize) -> T {
        debug_assert!(i < self.len);
        (self.addr as *const T).add(i).read()
    }

    /// # Safety
    /// `i` must be in bounds and owned by the calling task.
    #[inline]
    unsafe fn write(&self, i: usize, value: T) {
        debug_assert!(i < self.len);
        (self.addr as *mut T).add(i).write(value)
    }
}

enum Leaf<T> {
    Vector(Ptr<T>),
    Scalar(T),
}

struct Context<'a> {
    args: &'a [Bound],
    device: &'a str,
}

impl Context<'_> {
    fn fault(&self, reason: impl Into<String>) -> Error {
        Error::device(self.device, reason)
    }

    /// Buffer argument `i` viewed as `T`, holding at least `min_len` elements
    fn buffer<T: Element>(&self, i: usize, min_len: usize) -> Result<Ptr<T>> {
        match self.args.get(i) {
            Some(&Bound::Buffer { ptr, bytes }) => {
                let len = bytes / std::mem::size_of::<T>();
                if len < min_len {
                    return Err(self.fault(format!(
                        "argument {i} holds {len} elements, kernel needs {min_len}"
                    )));
                }
                if ptr == 0 && min_len > 0 {
                    return Err(self.fault(format!("argument {i} is a null buffer")));
                }
                Ok(Ptr {
                    addr: ptr,
                    len,
                    _marker: PhantomData,
                })
            }
            _ => Err(Error::Internal(format!("argument {i} is not a buffer"))),
        }
    }

    fn scalar<T: Element>(&self, i: usize) -> Result<T> {
        match self.args.get(i) {
            Some(&Bound::Scalar(v)) => Ok(T::from_f64(v)),
            _ => Err(Error::Internal(format!("argument {i} is not a scalar"))),
        }
    }

    /// Bind expression leaves starting at argument `first`
    fn leaves<T: Element>(&self, shape: &ExprShape, first: usize, n: usize) -> Result<Vec<Leaf<T>>> {
        shape
            .leaf_kinds()
            .into_iter()
            .enumerate()
            .map(|(k, is_vector)| {
                if is_vector {
                    self.buffer::<T>(first + k, n).map(Leaf::Vector)
                } else {
                    self.scalar::<T>(first + k).map(Leaf::Scalar)
                }
            })
            .collect()
    }

    fn elementwise<T: HostMath>(
        &self,
        assign: AssignOp,
        shape: &ExprShape,
        program: &Program,
        n: usize,
    ) -> Result<()> {
        let out = self.buffer::<T>(0, n)?;
        let leaves = self.leaves::<T>(shape, 1, n)?;

        par_try(n.div_ceil(CHUNK), |c| {
            for i in c * CHUNK..((c + 1) * CHUNK).min(n) {
                // SAFETY: i < n, which every leaf holds; index i belongs to this
                // chunk only.
                unsafe {
                    let v = program.eval_at(&leaves, i);
                    let stored = match assign.binary() {
                        None => v,
                        Some(op) => T::binary(op, out.read(i), v),
                    };
                    out.write(i, stored);
                }
            }
            Ok(())
        })
    }

    fn reduce<T: HostMath>(
        &self,
        op: ReduceOp,
        shape: &ExprShape,
        program: &Program,
        groups: usize,
        n: usize,
    ) -> Result<()> {
        let partials = self.buffer::<T>(0, groups)?;
        let leaves = self.leaves::<T>(shape, 1, n)?;
        let per_group = n.div_ceil(groups.max(1));

        par_try(groups, |g| {
            let start = (g * per_group).min(n);
            let end = ((g + 1) * per_group).min(n);
            let mut acc = op.identity::<T>();
            for i in start..end {
                // SAFETY: i < n, which every leaf holds.
                acc = op.combine(acc, unsafe { program.eval_at(&leaves, i) });
            }
            // SAFETY: one partial per group.
            unsafe { partials.write(g, acc) };
            Ok(())
        })
    }

    fn csr_product<T: HostMath>(&self, accumulate: bool, nrows: usize) -> Result<()> {
        let row_ptr = self.buffer::<u32>(0, nrows + 1)?;
        // SAFETY: row_ptr holds nrows + 1 entries.
        let nnz = unsafe { row_ptr.read(nrows) } as usize;
        let col = self.buffer::<u32>(1, nnz)?;
        let val = self.buffer::<T>(2, nnz)?;
        let x = self.buffer::<T>(3, 0)?;
        let y = self.buffer::<T>(4, nrows)?;
        let alpha = self.scalar::<T>(5)?;

        par_try(nrows.div_ceil(CHUNK), |c| {
            for row in c * CHUNK..((c + 1) * CHUNK).min(nrows) {
                // SAFETY: row < nrows, and row + 1 <= nrows.
                let (lo, hi) = unsafe { (row_ptr.read(row) as usize, row_ptr.read(row + 1) as usize) };
                if lo > hi || hi > nnz {
                    return Err(self.fault(format!("row {row} spans [{lo}, {hi}) outside {nnz} entries")));
                }
                let mut sum = T::zero();
                for j in lo..hi {
                    // SAFETY: j < nnz.
                    let (c, a) = unsafe { (col.read(j) as usize, val.read(j)) };
                    if c >= x.len {
                        return Err(self.fault(format!("column {c} outside x of length {}", x.len)));
                    }
                    // SAFETY: c checked above.
                    let xc = unsafe { x.read(c) };
                    sum = T::binary(BinaryOp::Add, sum, T::binary(BinaryOp::Mul, a, xc));
                }
                let scaled = T::binary(BinaryOp::Mul, alpha, sum);
                // SAFETY: row belongs to this chunk only; y does not alias x.
                unsafe {
                    let stored = if accumulate {
                        T::binary(BinaryOp::Add, y.read(row), scaled)
                    } else {
                        scaled
                    };
                    y.write(row, stored);
                }
            }
            Ok(())
        })
    }

    fn gather<T: HostMath>(&self, n: usize) -> Result<()> {
        let out = self.buffer::<T>(0, n)?;
        let src = self.buffer::<T>(1, 0)?;
        let idx = self.buffer::<u32>(2, n)?;

        par_try(n.div_ceil(CHUNK), |c| {
            for k in c * CHUNK..((c + 1) * CHUNK).min(n) {
                // SAFETY: k < n for both idx and out.
                let i = unsafe { idx.read(k) } as usize;
                if i >= src.len {
                    return Err(self.fault(format!("gather index {i} outside source of length {}", src.len)));
                }
                unsafe { out.write(k, src.read(i)) };
            }
            Ok(())
        })
    }
}

#[cfg(feature = "rayon")]
fn par_try<F>(count: usize, f: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Send + Sync,
{
    use rayon::prelude::*;
    (0..count).into_par_iter().try_for_each(f)
}

#[cfg(not(feature = "rayon"))]
fn par_try<F>(count: usize, f: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Send + Sync,
{
    (0..count).try_for_each(f)
}

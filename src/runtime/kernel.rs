//! Kernel descriptions handed to a runtime for compilation and launch
//!
//! A [`KernelSource`] is the backend-neutral description of one generated
//! kernel: its [`Signature`], entry point name and formal parameter list.
//! Backends turn it into their own compiled form (`Runtime::Kernel`), which
//! is then launched with a matching list of [`KernelArg`]s.
//!
//! # Parameter order
//!
//! Parameters follow the order in which the kernel reads them:
//!
//! | Kernel kind   | Parameters                                              |
//! |---------------|---------------------------------------------------------|
//! | Elementwise   | `dst`, then one parameter per expression leaf           |
//! | Reduce        | `partials`, then one parameter per expression leaf      |
//! | CsrProduct    | `row_ptr`, `col`, `val`, `x`, `y`, `alpha`              |
//! | Gather        | `dst`, `src`, `idx`                                     |
//!
//! Expression leaves appear in traversal order (left to right, depth first).

use smallvec::SmallVec;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::fusion::{ExprShape, Signature};

/// Kind of a formal kernel parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Device buffer of `dtype` elements
    Buffer {
        /// Element type stored in the buffer
        dtype: DType,
        /// Whether the kernel writes to the buffer
        writable: bool,
    },
    /// Scalar passed by value
    Scalar(DType),
}

/// Formal kernel parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    /// Name used in generated source
    pub name: String,
    /// Buffer or scalar
    pub kind: ParamKind,
}

impl KernelParam {
    fn buffer(name: impl Into<String>, dtype: DType, writable: bool) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Buffer { dtype, writable },
        }
    }

    fn scalar(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Scalar(dtype),
        }
    }

    /// True for buffer parameters
    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, ParamKind::Buffer { .. })
    }
}

/// Backend-neutral description of a generated kernel
#[derive(Debug, Clone)]
pub struct KernelSource {
    /// Entry point name, unique per signature
    pub name: String,
    /// What the kernel computes
    pub signature: Signature,
    /// Formal parameters in binding order
    pub params: Vec<KernelParam>,
    /// Workgroup size the kernel is generated for
    pub workgroup_size: u32,
}

impl KernelSource {
    /// Describe the kernel for `signature`.
    ///
    /// Fails with `KernelCompile` when the signature uses an operation that is
    /// not defined for its element type (e.g. `sqrt` on integers).
    pub fn new(signature: Signature) -> Result<Self> {
        let name = signature.kernel_name();
        let dtype = signature.dtype();

        let (params, workgroup_size) = match &signature {
            Signature::Elementwise { shape, .. } => {
                check_shape(&name, shape, dtype)?;
                let mut params = vec![KernelParam::buffer("dst", dtype, true)];
                params.extend(leaf_params(shape, dtype));
                (params, crate::config::effective_workgroup_size())
            }
            Signature::Reduce { shape, .. } => {
                check_shape(&name, shape, dtype)?;
                let mut params = vec![KernelParam::buffer("partials", dtype, true)];
                params.extend(leaf_params(shape, dtype));
                (params, crate::config::REDUCE_WORKGROUP_SIZE)
            }
            Signature::CsrProduct { .. } => (
                vec![
                    KernelParam::buffer("row_ptr", DType::U32, false),
                    KernelParam::buffer("col", DType::U32, false),
                    KernelParam::buffer("val", dtype, false),
                    KernelParam::buffer("x", dtype, false),
                    KernelParam::buffer("y", dtype, true),
                    KernelParam::scalar("alpha", dtype),
                ],
                crate::config::effective_workgroup_size(),
            ),
            Signature::Gather { .. } => (
                vec![
                    KernelParam::buffer("dst", dtype, true),
                    KernelParam::buffer("src", dtype, false),
                    KernelParam::buffer("idx", DType::U32, false),
                ],
                crate::config::effective_workgroup_size(),
            ),
        };

        Ok(Self {
            name,
            signature,
            params,
            workgroup_size,
        })
    }

    /// Number of buffer parameters
    pub fn buffer_count(&self) -> usize {
        self.params.iter().filter(|p| p.is_buffer()).count()
    }

    /// Check that `args` matches the formal parameter list
    pub fn check_args(&self, args: &[KernelArg]) -> Result<()> {
        if args.len() != self.params.len() {
            return Err(Error::invalid_argument(
                "args",
                format!(
                    "kernel '{}' takes {} arguments, got {}",
                    self.name,
                    self.params.len(),
                    args.len()
                ),
            ));
        }
        for (i, (param, arg)) in self.params.iter().zip(args).enumerate() {
            let ok = matches!(
                (param.kind, arg),
                (ParamKind::Buffer { .. }, KernelArg::Buffer(_))
                    | (ParamKind::Scalar(_), KernelArg::Scalar(_))
            );
            if !ok {
                return Err(Error::invalid_argument(
                    "args",
                    format!(
                        "argument {} of kernel '{}' should be a {} ('{}')",
                        i,
                        self.name,
                        if param.is_buffer() { "buffer" } else { "scalar" },
                        param.name
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn check_shape(kernel: &str, shape: &ExprShape, dtype: DType) -> Result<()> {
    match shape.unsupported_op(dtype) {
        Some(op) => Err(Error::KernelCompile {
            kernel: kernel.to_string(),
            diagnostics: format!("operation '{op}' is not defined for {dtype}"),
        }),
        None => Ok(()),
    }
}

fn leaf_params(shape: &ExprShape, dtype: DType) -> impl Iterator<Item = KernelParam> {
    shape
        .leaf_kinds()
        .into_iter()
        .enumerate()
        .map(move |(i, is_vector)| {
            if is_vector {
                KernelParam::buffer(format!("v{i}"), dtype, false)
            } else {
                KernelParam::scalar(format!("s{i}"), dtype)
            }
        })
}

/// Actual argument bound to a kernel parameter at launch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// Device buffer handle
    Buffer(u64),
    /// Scalar value, converted to the parameter's dtype by the backend
    Scalar(f64),
}

/// Argument list of one launch
pub type KernelArgs = SmallVec<[KernelArg; 8]>;

/// Identity of a device across runtimes, used as a cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    /// Runtime name (`"cpu"`, `"wgpu"`)
    pub backend: &'static str,
    /// Device id within the runtime
    pub id: usize,
}

impl DeviceKey {
    /// Create a device key
    pub const fn new(backend: &'static str, id: usize) -> Self {
        Self { backend, id }
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::ops::{AssignOp, BinaryOp, UnaryOp};

    fn axpy_shape() -> ExprShape {
        ExprShape::Binary(
            BinaryOp::Add,
            Box::new(ExprShape::Binary(
                BinaryOp::Mul,
                Box::new(ExprShape::Scalar),
                Box::new(ExprShape::Vector),
            )),
            Box::new(ExprShape::Vector),
        )
    }

    #[test]
    fn test_elementwise_params_follow_leaf_order() {
        let src = KernelSource::new(Signature::Elementwise {
            dtype: DType::F32,
            assign: AssignOp::Set,
            shape: axpy_shape(),
        })
        .unwrap();
        let names: Vec<_> = src.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["dst", "s0", "v1", "v2"]);
        assert_eq!(src.params[1].kind, ParamKind::Scalar(DType::F32));
        assert_eq!(src.buffer_count(), 3);
    }

    #[test]
    fn test_integer_sqrt_is_a_compile_error() {
        let err = KernelSource::new(Signature::Elementwise {
            dtype: DType::I32,
            assign: AssignOp::Set,
            shape: ExprShape::Unary(UnaryOp::Sqrt, Box::new(ExprShape::Vector)),
        })
        .unwrap_err();
        assert!(matches!(err, Error::KernelCompile { .. }), "{err}");
    }

    #[test]
    fn test_check_args_rejects_kind_mismatch() {
        let src = KernelSource::new(Signature::Gather { dtype: DType::F64 }).unwrap();
        assert!(src
            .check_args(&[KernelArg::Buffer(1), KernelArg::Buffer(2), KernelArg::Buffer(3)])
            .is_ok());
        assert!(src
            .check_args(&[KernelArg::Buffer(1), KernelArg::Scalar(2.0), KernelArg::Buffer(3)])
            .is_err());
        assert!(src.check_args(&[KernelArg::Buffer(1)]).is_err());
    }
}

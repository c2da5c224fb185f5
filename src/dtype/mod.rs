//! Data type system for vexr vectors
//!
//! `DType` is the runtime tag carried by generated kernels; `Element` is the
//! compile-time trait implemented by the Rust scalar types a `Vector` can hold.

mod element;

pub use element::Element;

use std::fmt;

/// Element types supported by vexr vectors and kernels
///
/// Kernels are generated per dtype, so the dtype is part of every kernel
/// signature. The WebGPU backend has no 64-bit float support and rejects
/// `F64` kernels at compile time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    /// 64-bit floating point
    F64 = 0,
    /// 32-bit floating point (most common)
    F32 = 1,
    /// 32-bit signed integer
    I32 = 11,
    /// 32-bit unsigned integer
    U32 = 21,
}

impl DType {
    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F64 => 8,
            Self::F32 | Self::I32 | Self::U32 => 4,
        }
    }

    /// Returns true if this is a floating point type
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32)
    }

    /// Returns true if this type can represent negative values
    #[inline]
    pub const fn is_signed(self) -> bool {
        !matches!(self, Self::U32)
    }

    /// Short name for display (e.g., "f32", "u32")
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::I32 => "i32",
            Self::U32 => "u32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Macro for runtime dtype dispatch to typed code.
///
/// Binds `$T` to the Rust type matching `$dtype` and evaluates `$body`.
#[macro_export]
macro_rules! dispatch_dtype {
    ($dtype:expr, $T:ident => $body:block) => {
        match $dtype {
            $crate::dtype::DType::F64 => {
                type $T = f64;
                $body
            }
            $crate::dtype::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::dtype::DType::I32 => {
                type $T = i32;
                $body
            }
            $crate::dtype::DType::U32 => {
                type $T = u32;
                $body
            }
        }
    };
}

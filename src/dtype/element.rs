//! Element trait for mapping Rust types to DType

use super::DType;
use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Sub};

/// Trait for types that can be elements of a vector
///
/// This trait connects Rust's type system to vexr's runtime dtype system.
///
/// # Bounds
/// - `Copy + Send + Sync + 'static` - values cross thread and queue boundaries
/// - `Pod + Zeroable` - safe memory transmutation for device copies (bytemuck)
/// - `Add + Sub + Mul + Div` - host-side combination of partial results
/// - `PartialOrd` - comparison for min/max reductions
pub trait Element:
    Copy
    + Clone
    + Debug
    + Send
    + Sync
    + Pod
    + Zeroable
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + PartialOrd
{
    /// The corresponding DType for this Rust type
    const DTYPE: DType;

    /// Convert to f64 for scalar kernel arguments
    fn to_f64(self) -> f64;

    /// Convert from f64 to this type
    fn from_f64(v: f64) -> Self;

    /// Zero value
    fn zero() -> Self;

    /// One value
    fn one() -> Self;

    /// Smallest finite value (identity of a max reduction)
    fn min_value() -> Self;

    /// Largest finite value (identity of a min reduction)
    fn max_value() -> Self;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr, $zero:expr, $one:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }

            #[inline]
            fn zero() -> Self {
                $zero
            }

            #[inline]
            fn one() -> Self {
                $one
            }

            #[inline]
            fn min_value() -> Self {
                <$t>::MIN
            }

            #[inline]
            fn max_value() -> Self {
                <$t>::MAX
            }
        }
    };
}

impl_element!(f64, DType::F64, 0.0, 1.0);
impl_element!(f32, DType::F32, 0.0, 1.0);
impl_element!(i32, DType::I32, 0, 1);
impl_element!(u32, DType::U32, 0, 1);

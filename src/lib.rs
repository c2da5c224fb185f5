//! # vexr
//!
//! **Vector expressions fused into single kernels and spread over several
//! compute devices.**
//!
//! vexr keeps vectors partitioned across a list of device queues. Arithmetic
//! on vectors builds expression trees that are compiled, once per shape and
//! device, into one kernel each; assigning an expression runs that kernel on
//! every partition concurrently.
//!
//! ## Features
//!
//! - **Expression fusion**: `y = 2x + sqrt(y) - cos(z)` is one kernel launch
//! - **Kernel cache**: each expression shape is compiled at most once per device
//! - **Partitioning**: vectors are split proportionally to measured device throughput
//! - **Reductions**: sum, product, min and max over fused expressions
//! - **Sparse**: partitioned CSR matrix-vector products with remote value exchange
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vexr::prelude::*;
//!
//! let queues = CpuRuntime::queue_list(2)?;
//! let x = Vector::<f32, CpuRuntime>::from_slice(&queues, &[1.0, 2.0, 3.0, 4.0])?;
//! let y = Vector::<f32, CpuRuntime>::new(&queues, 4)?;
//!
//! y.assign(2.0f32 * &x + sqrt(&x))?;
//! let total = Reductor::sum(&queues)?.apply(&y)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): multi-threaded execution inside each host device
//! - `wgpu`: GPU devices via WebGPU

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod config;
pub mod dtype;
pub mod error;
pub mod fusion;
pub mod partition;
pub mod reduce;
pub mod runtime;
pub mod sparse;
pub mod vector;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PartitionMode;
    pub use crate::dtype::{DType, Element};
    pub use crate::error::{Error, Result};
    pub use crate::fusion::{
        abs, ceil, cos, exp, floor, log, max, min, pow, sin, sqrt, tan, tanh, AssignOp, Expr,
        ReduceOp,
    };
    pub use crate::partition::Layout;
    pub use crate::reduce::Reductor;
    pub use crate::runtime::cpu::CpuRuntime;
    pub use crate::runtime::{Device, Event, Runtime, RuntimeClient};
    pub use crate::sparse::SpMat;
    pub use crate::vector::{MemFlags, Vector};

    #[cfg(feature = "wgpu")]
    pub use crate::runtime::wgpu::WgpuRuntime;
}

//! WebGPU runtime (requires the `wgpu` feature)
//!
//! Each adapter becomes one device with a single queue. Generated kernels are
//! emitted as WGSL (see [`crate::fusion::codegen`]), validated with naga and
//! compiled into compute pipelines on first use.
//!
//! # Limitations
//!
//! - WGSL has no 64-bit floats, so `f64` vectors are rejected at compile time
//! - Buffers are addressed through a process-wide handle registry

mod client;
mod device;
mod pipeline;
mod runtime;

pub use client::{WgpuClient, WgpuEvent};
pub use device::WgpuDevice;
pub use runtime::{WgpuKernel, WgpuRuntime};

/// Check if a WebGPU adapter is available on this system
pub fn is_wgpu_available() -> bool {
    WgpuRuntime::is_available()
}

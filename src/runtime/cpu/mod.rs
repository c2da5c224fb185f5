//! CPU runtime implementation
//!
//! The host is exposed as any number of virtual devices. Each one owns an
//! in-order worker queue, so a list of CPU clients behaves like a list of
//! independent device queues: launches return immediately with an event,
//! work on one queue runs in order, and different queues run concurrently.
//!
//! Expressions are lowered once per kernel and evaluated element by element
//! (see `interp`), parallelised across chunks with rayon.

mod client;
mod device;
mod interp;
mod runtime;

pub use client::{CpuClient, CpuEvent};
pub use device::CpuDevice;
pub use runtime::{CpuKernel, CpuRuntime};

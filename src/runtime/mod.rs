//! Runtime backends for kernel execution
//!
//! This module defines the `Runtime` trait and provides implementations
//! for the host (one worker queue per virtual device) and WebGPU.
//!
//! # Architecture
//!
//! ```text
//! Runtime (backend identity)
//! ├── Device (identifies a specific GPU/CPU)
//! ├── Client (owns the device's command queue)
//! ├── Kernel (compiled form of a generated KernelSource)
//! └── Event (completion handle of one enqueued operation)
//! ```
//!
//! Everything above this layer (vectors, expressions, reductions, sparse
//! matrices) is generic over `R: Runtime` and talks to devices only through
//! buffer handles (`u64`), kernel launches and events.

pub mod kernel;

pub mod cpu;

#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use kernel::{DeviceKey, KernelArg, KernelArgs, KernelParam, KernelSource, ParamKind};

use crate::error::Result;

/// Core trait for compute backends
///
/// `Runtime` abstracts over different compute devices (CPU, GPU, etc.).
/// It uses static dispatch via generics.
///
/// All enqueueing operations are asynchronous with respect to the host and
/// return an [`Event`]. Operations on one client execute in enqueue order;
/// different clients run concurrently.
///
/// # Example
///
/// ```ignore
/// let queues = CpuRuntime::queue_list(2)?;
/// let ptr = CpuRuntime::allocate(1024, &queues[0])?;
/// CpuRuntime::copy_to_device(&bytes, ptr, 0, &queues[0])?.wait()?;
/// CpuRuntime::deallocate(ptr, 1024, &queues[0]);
/// ```
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Device identifier type
    type Device: Device;

    /// Client for dispatching operations
    type Client: RuntimeClient<Self>;

    /// Compiled kernel
    type Kernel: Send + Sync + 'static;

    /// Completion handle of an enqueued operation
    type Event: Event;

    /// Human-readable name of this runtime
    fn name() -> &'static str;

    /// Allocate zero-initialised device memory
    ///
    /// Returns a device handle (u64). A zero-byte allocation returns the null
    /// handle `0`, which every other operation treats as empty.
    fn allocate(size_bytes: usize, client: &Self::Client) -> Result<u64>;

    /// Release device memory
    ///
    /// The release is ordered after all work already enqueued on `client`.
    fn deallocate(ptr: u64, size_bytes: usize, client: &Self::Client);

    /// Enqueue a host to device copy into `dst` at byte offset `offset`
    fn copy_to_device(
        src: &[u8],
        dst: u64,
        offset: usize,
        client: &Self::Client,
    ) -> Result<Self::Event>;

    /// Copy device memory at byte offset `offset` to the host (blocking)
    ///
    /// Waits for all work enqueued on `client` before reading.
    fn copy_from_device(
        src: u64,
        offset: usize,
        dst: &mut [u8],
        client: &Self::Client,
    ) -> Result<()>;

    /// Compile a generated kernel for the client's device
    fn compile(source: &KernelSource, client: &Self::Client) -> Result<Self::Kernel>;

    /// Enqueue a kernel over `work_items` elements
    fn launch(
        kernel: &Self::Kernel,
        args: &[KernelArg],
        work_items: usize,
        client: &Self::Client,
    ) -> Result<Self::Event>;
}

/// Trait for device identification
pub trait Device: Clone + Send + Sync + 'static {
    /// Unique identifier for this device within its runtime
    fn id(&self) -> usize;

    /// Check if two devices are the same
    fn is_same(&self, other: &Self) -> bool {
        self.id() == other.id()
    }

    /// Human-readable name
    fn name(&self) -> String {
        format!("Device({})", self.id())
    }
}

/// Trait for runtime clients that own a device queue
pub trait RuntimeClient<R: Runtime>: Clone + Send + Sync {
    /// Get the device this client operates on
    fn device(&self) -> &R::Device;

    /// Wait for all pending operations to complete
    ///
    /// Reports the first device error raised since the last synchronization.
    fn synchronize(&self) -> Result<()>;

    /// Cache key of the client's device
    fn key(&self) -> DeviceKey {
        DeviceKey::new(R::name(), self.device().id())
    }
}

/// Completion handle of one enqueued operation
pub trait Event: Send + 'static {
    /// Block until the operation has finished
    fn wait(self) -> Result<()>;
}

/// Wait for every event, returning the first error
///
/// All events are waited on even if an earlier one failed, so no work is
/// left running behind the returned error.
pub fn wait_all<E: Event>(events: impl IntoIterator<Item = E>) -> Result<()> {
    let mut first = None;
    for event in events {
        if let Err(e) = event.wait() {
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

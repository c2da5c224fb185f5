//! CPU runtime implementation

use std::sync::Arc;
use std::sync::mpsc;

use super::client::{CpuClient, CpuEvent, alloc_host, allocation_size, free_host};
use super::device::CpuDevice;
use super::interp::{self, Bound, Program};
use crate::error::{Error, Result};
use crate::runtime::{Device, KernelArg, KernelSource, Runtime, RuntimeClient};

/// CPU compute runtime
///
/// This is the default runtime that works on any platform. Memory is
/// allocated on the heap; each virtual device executes its queue on a
/// dedicated worker thread.
#[derive(Clone, Debug, Default)]
pub struct CpuRuntime;

/// A generated kernel prepared for host execution
#[derive(Debug, Clone)]
pub struct CpuKernel {
    source: Arc<KernelSource>,
    program: Option<Arc<Program>>,
}

impl CpuKernel {
    /// The description the kernel was built from
    pub fn source(&self) -> &KernelSource {
        &self.source
    }
}

impl CpuRuntime {
    /// Clients for `count` virtual host devices, ids `0..count`
    pub fn queue_list(count: usize) -> Result<Vec<CpuClient>> {
        if count == 0 {
            return Err(Error::DeviceEnumeration {
                reason: "requested zero host devices".into(),
            });
        }
        (0..count).map(|id| CpuClient::new(CpuDevice::new(id))).collect()
    }

    /// Clients for an explicit set of virtual device ids, in the given order
    pub fn queue_list_with_ids(ids: &[usize]) -> Result<Vec<CpuClient>> {
        if ids.is_empty() {
            return Err(Error::DeviceEnumeration {
                reason: "empty host device id list".into(),
            });
        }
        ids.iter()
            .map(|&id| CpuClient::new(CpuDevice::new(id)))
            .collect()
    }
}

fn checked_range(ptr: u64, offset: usize, len: usize, client: &CpuClient) -> Result<()> {
    let size = allocation_size(ptr)
        .ok_or_else(|| Error::device(client.device().name(), format!("unknown buffer {ptr:#x}")))?;
    if offset + len > size {
        return Err(Error::device(
            client.device().name(),
            format!("copy of {len} bytes at offset {offset} exceeds buffer of {size} bytes"),
        ));
    }
    Ok(())
}

impl Runtime for CpuRuntime {
    type Device = CpuDevice;
    type Client = CpuClient;
    type Kernel = CpuKernel;
    type Event = CpuEvent;

    fn name() -> &'static str {
        "cpu"
    }

    fn allocate(size_bytes: usize, _client: &Self::Client) -> Result<u64> {
        alloc_host(size_bytes)
    }

    fn deallocate(ptr: u64, _size_bytes: usize, client: &Self::Client) {
        if ptr == 0 {
            return;
        }
        // Queued so in-flight kernels reading the buffer finish first.
        if client
            .enqueue(move || {
                free_host(ptr);
                Ok(())
            })
            .is_err()
        {
            free_host(ptr);
        }
    }

    fn copy_to_device(
        src: &[u8],
        dst: u64,
        offset: usize,
        client: &Self::Client,
    ) -> Result<Self::Event> {
        if src.is_empty() {
            return client.enqueue(|| Ok(()));
        }
        checked_range(dst, offset, src.len(), client)?;

        let data = src.to_vec();
        client.enqueue(move || {
            // SAFETY: range checked against the live allocation above; the
            // buffer is released only through this same queue.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    (dst as *mut u8).add(offset),
                    data.len(),
                );
            }
            Ok(())
        })
    }

    fn copy_from_device(
        src: u64,
        offset: usize,
        dst: &mut [u8],
        client: &Self::Client,
    ) -> Result<()> {
        if dst.is_empty() {
            return client.synchronize();
        }
        checked_range(src, offset, dst.len(), client)?;

        let len = dst.len();
        let (sender, receiver) = mpsc::channel();
        let event = client.enqueue(move || {
            let mut bytes = vec![0u8; len];
            // SAFETY: range checked against the live allocation above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (src as *const u8).add(offset),
                    bytes.as_mut_ptr(),
                    len,
                );
            }
            let _ = sender.send(bytes);
            Ok(())
        })?;
        crate::runtime::Event::wait(event)?;

        let bytes = receiver.recv().map_err(|_| {
            Error::device(client.device().name(), "readback job produced no data")
        })?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    fn compile(source: &KernelSource, client: &Self::Client) -> Result<Self::Kernel> {
        log::debug!(
            "preparing host kernel {} ({}) for {}",
            source.name,
            source.signature,
            client.device().name()
        );
        Ok(CpuKernel {
            source: Arc::new(source.clone()),
            program: Program::lower(&source.signature).map(Arc::new),
        })
    }

    fn launch(
        kernel: &Self::Kernel,
        args: &[KernelArg],
        work_items: usize,
        client: &Self::Client,
    ) -> Result<Self::Event> {
        kernel.source.check_args(args)?;

        let bound = args
            .iter()
            .map(|arg| match *arg {
                KernelArg::Buffer(0) => Ok(Bound::Buffer { ptr: 0, bytes: 0 }),
                KernelArg::Buffer(ptr) => allocation_size(ptr)
                    .map(|bytes| Bound::Buffer { ptr, bytes })
                    .ok_or_else(|| {
                        Error::device(client.device().name(), format!("unknown buffer {ptr:#x}"))
                    }),
                KernelArg::Scalar(v) => Ok(Bound::Scalar(v)),
            })
            .collect::<Result<Vec<_>>>()?;

        log::trace!(
            "launch {} over {} items on {}",
            kernel.source.name,
            work_items,
            client.device().name()
        );
        client.count_launch();

        let source = kernel.source.clone();
        let program = kernel.program.clone();
        let device = client.device().name();
        client.enqueue(move || {
            interp::execute(&source.signature, program.as_deref(), &bound, work_items, &device)
        })
    }
}

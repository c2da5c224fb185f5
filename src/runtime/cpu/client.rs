//! CPU client, worker queue and host allocator
//!
//! Each virtual device owns one worker thread that executes enqueued jobs in
//! order. Clients are cached per device id, so every `CpuClient` for the same
//! device shares the same queue.

use parking_lot::{Condvar, Mutex};
use std::alloc::{Layout as AllocLayout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};

use super::device::CpuDevice;
use super::runtime::CpuRuntime;
use crate::error::{Error, Result};
use crate::runtime::{Device, Event, RuntimeClient};

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Task {
    job: Job,
    signal: Arc<Signal>,
}

#[derive(Default)]
struct Signal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    fn notify(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

/// State shared between a client and its worker thread
#[derive(Default)]
struct QueueState {
    /// First failure since the last synchronization
    failure: Mutex<Option<Error>>,
    launches: AtomicU64,
}

impl QueueState {
    fn record_failure(&self, err: Error) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }
}

// ============================================================================
// CpuClient
// ============================================================================

/// CPU client for operation dispatch
#[derive(Clone)]
pub struct CpuClient {
    pub(crate) device: CpuDevice,
    sender: mpsc::Sender<Task>,
    state: Arc<QueueState>,
}

impl std::fmt::Debug for CpuClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuClient")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Global client cache: device id -> client
static CLIENT_CACHE: OnceLock<Mutex<HashMap<usize, CpuClient>>> = OnceLock::new();

impl CpuClient {
    /// Get the client of virtual device `device`, starting its worker on first use
    pub fn new(device: CpuDevice) -> Result<Self> {
        let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = cache.lock();

        if let Some(client) = guard.get(&device.id()) {
            return Ok(client.clone());
        }

        let client = Self::spawn(device)?;
        guard.insert(client.device.id(), client.clone());
        Ok(client)
    }

    fn spawn(device: CpuDevice) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let state = Arc::new(QueueState::default());
        let worker_state = state.clone();
        let name = device.name();

        std::thread::Builder::new()
            .name(format!("vexr-{name}"))
            .spawn(move || {
                for Task { job, signal } in receiver {
                    let failure = match panic::catch_unwind(AssertUnwindSafe(job)) {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e),
                        Err(_) => Some(Error::device(&name, "job panicked")),
                    };
                    if let Some(e) = failure {
                        log::debug!("{name}: job failed: {e}");
                        worker_state.record_failure(e);
                    }
                    signal.notify();
                }
            })
            .map_err(|e| Error::device(device.name(), format!("cannot start worker: {e}")))?;

        log::debug!("started worker queue for {}", device.name());
        Ok(Self {
            device,
            sender,
            state,
        })
    }

    /// Enqueue a job behind all previously enqueued work
    pub(crate) fn enqueue(
        &self,
        job: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<CpuEvent> {
        let signal = Arc::new(Signal::default());
        self.sender
            .send(Task {
                job: Box::new(job),
                signal: signal.clone(),
            })
            .map_err(|_| Error::device(self.device.name(), "worker queue has shut down"))?;
        Ok(CpuEvent {
            signal,
            state: self.state.clone(),
        })
    }

    pub(crate) fn count_launch(&self) {
        self.state.launches.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of kernels launched on this device since process start
    pub fn launch_count(&self) -> u64 {
        self.state.launches.load(Ordering::Relaxed)
    }
}

impl RuntimeClient<CpuRuntime> for CpuClient {
    fn device(&self) -> &CpuDevice {
        &self.device
    }

    fn synchronize(&self) -> Result<()> {
        self.enqueue(|| Ok(()))?.wait()
    }
}

// ============================================================================
// CpuEvent
// ============================================================================

/// Completion handle of a job on a CPU worker queue
pub struct CpuEvent {
    signal: Arc<Signal>,
    state: Arc<QueueState>,
}

impl Event for CpuEvent {
    /// Waits for the job, then reports the first failure recorded on its queue
    fn wait(self) -> Result<()> {
        self.signal.wait();
        match self.state.take_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Host allocator
// ============================================================================

const ALIGN: usize = 64; // AVX-512 alignment

/// Live host allocations: address -> size in bytes
static ALLOCATIONS: OnceLock<Mutex<HashMap<u64, usize>>> = OnceLock::new();

fn allocations() -> &'static Mutex<HashMap<u64, usize>> {
    ALLOCATIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn alloc_host(size: usize) -> Result<u64> {
    if size == 0 {
        return Ok(0);
    }
    let layout = AllocLayout::from_size_align(size, ALIGN)
        .map_err(|e| Error::invalid_argument("size", e.to_string()))?;
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(Error::device(
            "cpu",
            format!("out of memory allocating {size} bytes"),
        ));
    }
    allocations().lock().insert(ptr as u64, size);
    Ok(ptr as u64)
}

pub(crate) fn free_host(ptr: u64) {
    if ptr == 0 {
        return;
    }
    let Some(size) = allocations().lock().remove(&ptr) else {
        log::warn!("ignoring free of unknown host buffer {ptr:#x}");
        return;
    };
    if let Ok(layout) = AllocLayout::from_size_align(size, ALIGN) {
        unsafe { dealloc(ptr as *mut u8, layout) };
    }
}

/// Size in bytes of a live host allocation
pub(crate) fn allocation_size(ptr: u64) -> Option<usize> {
    allocations().lock().get(&ptr).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_cached_per_device() {
        let a = CpuClient::new(CpuDevice::new(40)).unwrap();
        let b = CpuClient::new(CpuDevice::new(40)).unwrap();
        a.count_launch();
        assert_eq!(b.launch_count(), a.launch_count());
    }

    #[test]
    fn test_jobs_run_in_order() {
        let client = CpuClient::new(CpuDevice::new(41)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let events: Vec<_> = (0..16)
            .map(|i| {
                let log = log.clone();
                client
                    .enqueue(move || {
                        log.lock().push(i);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();
        crate::runtime::wait_all(events).unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_failure_surfaces_at_next_sync() {
        let client = CpuClient::new(CpuDevice::new(42)).unwrap();
        drop(client.enqueue(|| Err(Error::device("cpu:42", "boom"))).unwrap());
        let err = client.synchronize().unwrap_err();
        assert!(matches!(err, Error::DeviceRuntime { .. }));
        assert!(client.synchronize().is_ok());
    }

    #[test]
    fn test_host_allocation_is_tracked() {
        let ptr = alloc_host(100).unwrap();
        assert_eq!(allocation_size(ptr), Some(100));
        assert_eq!(ptr % ALIGN as u64, 0);
        free_host(ptr);
        assert_eq!(allocation_size(ptr), None);
        assert_eq!(alloc_host(0).unwrap(), 0);
    }
}

//! WebGPU client: device, queue and buffer registry

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use wgpu::{Buffer, BufferDescriptor, BufferUsages, Device, Queue, SubmissionIndex};

use super::WgpuRuntime;
use super::device::{WgpuDevice, query_adapter_blocking};
use super::pipeline::PipelineCache;
use crate::error::{Error, Result};
use crate::runtime::{Device as _, Event, RuntimeClient};

/// How long a blocking wait on the GPU may take before it is reported as an error
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// WgpuClient
// ============================================================================

/// WebGPU client owning one device and its queue
///
/// Clones share the device, queue and counters. There is at most one client
/// per adapter index, because buffers belong to the `wgpu::Device` that
/// created them.
#[derive(Clone)]
pub struct WgpuClient {
    pub(crate) device_id: WgpuDevice,
    pub(crate) wgpu_device: Arc<Device>,
    pub(crate) queue: Arc<Queue>,
    pub(crate) pipelines: Arc<PipelineCache>,
    // Bound in place of empty (null handle) buffer arguments
    pub(crate) placeholder: Arc<Buffer>,
    launches: Arc<AtomicU64>,
}

impl std::fmt::Debug for WgpuClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuClient")
            .field("device", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Global client cache: adapter index -> client
static CLIENT_CACHE: OnceLock<Mutex<HashMap<usize, WgpuClient>>> = OnceLock::new();

impl WgpuClient {
    /// Get the client of adapter `device`, creating the WebGPU device on first use
    ///
    /// # Errors
    ///
    /// `DeviceEnumeration` if the adapter does not exist, `DeviceRuntime` if
    /// the device request fails.
    pub fn new(device: WgpuDevice) -> Result<Self> {
        let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = cache.lock();
        if let Some(client) = guard.get(&device.index) {
            return Ok(client.clone());
        }

        let client = Self::new_uncached(device)?;
        guard.insert(client.device_id.index, client.clone());
        Ok(client)
    }

    fn new_uncached(device: WgpuDevice) -> Result<Self> {
        let (adapter, info) = query_adapter_blocking(device.index)?;

        let (wgpu_device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("vexr WebGPU Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
                experimental_features: wgpu::ExperimentalFeatures::default(),
            },
        ))
        .map_err(|e| Error::device(device.name(), format!("device request failed: {e}")))?;

        let wgpu_device = Arc::new(wgpu_device);
        let placeholder = Arc::new(wgpu_device.create_buffer(&BufferDescriptor {
            label: Some("vexr placeholder buffer"),
            size: 4,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        }));
        let device_id = WgpuDevice::with_info(device.index, info);
        log::debug!(
            "created WebGPU client {} on {} ({:?})",
            device_id.name(),
            device_id.adapter_name(),
            device_id.backend()
        );

        Ok(Self {
            device_id,
            pipelines: Arc::new(PipelineCache::new(wgpu_device.clone())),
            wgpu_device,
            queue: Arc::new(queue),
            placeholder,
            launches: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create a staging buffer for host readback
    pub(crate) fn create_staging_buffer(&self, label: &str, size: u64) -> Buffer {
        self.wgpu_device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Event completing when `submission` has executed
    pub(crate) fn event(&self, submission: SubmissionIndex) -> WgpuEvent {
        WgpuEvent {
            device: self.wgpu_device.clone(),
            name: self.device_id.name(),
            submission,
        }
    }

    /// Read a staging buffer filled by `submission` into `output` (blocking)
    pub(crate) fn read_staging(
        &self,
        staging: &Buffer,
        submission: SubmissionIndex,
        output: &mut [u8],
    ) -> Result<()> {
        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.wgpu_device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: Some(POLL_TIMEOUT),
            })
            .map_err(|e| self.fault(format!("poll failed during readback: {e}")))?;

        receiver
            .recv()
            .map_err(|_| self.fault("map_async callback was not invoked during readback"))?
            .map_err(|e| self.fault(format!("map_async failed during readback: {e}")))?;

        {
            let data = slice.get_mapped_range();
            output.copy_from_slice(&data[..output.len()]);
        }
        staging.unmap();
        Ok(())
    }

    pub(crate) fn fault(&self, reason: impl Into<String>) -> Error {
        Error::device(self.device_id.name(), reason)
    }

    pub(crate) fn count_launch(&self) {
        self.launches.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of kernels launched on this device since process start
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }
}

impl RuntimeClient<WgpuRuntime> for WgpuClient {
    fn device(&self) -> &WgpuDevice {
        &self.device_id
    }

    fn synchronize(&self) -> Result<()> {
        self.wgpu_device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(POLL_TIMEOUT),
            })
            .map(drop)
            .map_err(|e| self.fault(format!("synchronize failed: {e}")))
    }
}

// ============================================================================
// WgpuEvent
// ============================================================================

/// Completion handle of one queue submission
pub struct WgpuEvent {
    device: Arc<Device>,
    name: String,
    submission: SubmissionIndex,
}

impl Event for WgpuEvent {
    fn wait(self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(self.submission),
                timeout: Some(POLL_TIMEOUT),
            })
            .map(drop)
            .map_err(|e| Error::device(self.name, format!("wait failed: {e}")))
    }
}

// ============================================================================
// Buffer registry
// ============================================================================

/// Global buffer registry: handle -> buffer
///
/// WebGPU does not expose device addresses, so buffers are identified by
/// handles issued here. Handle 0 is never issued.
static BUFFER_REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<Buffer>>>> = OnceLock::new();

/// Counter for generating unique buffer handles.
static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn buffer_registry() -> &'static Mutex<HashMap<u64, Arc<Buffer>>> {
    BUFFER_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Allocate a zero-initialised storage buffer
pub(crate) fn register_buffer(client: &WgpuClient, size_bytes: usize) -> u64 {
    // WebGPU requires buffer sizes to be aligned to 4 bytes
    let aligned_size = size_bytes.div_ceil(4) * 4;
    let buffer = client.wgpu_device.create_buffer(&BufferDescriptor {
        label: Some("vexr partition buffer"),
        size: aligned_size as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });

    let id = BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    buffer_registry().lock().insert(id, Arc::new(buffer));
    id
}

/// Look up a buffer by handle
pub(crate) fn get_buffer(id: u64) -> Option<Arc<Buffer>> {
    if id == 0 {
        return None;
    }
    buffer_registry().lock().get(&id).cloned()
}

/// Drop the registry's reference; wgpu keeps the buffer alive for
/// submissions still using it.
pub(crate) fn release_buffer(id: u64) {
    if id != 0 {
        buffer_registry().lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_roundtrip() {
        let Ok(client) = WgpuClient::new(WgpuDevice::new(0)) else {
            println!("No GPU available, skipping test");
            return;
        };
        let id = register_buffer(&client, 10);
        let buffer = get_buffer(id).unwrap();
        assert_eq!(buffer.size(), 12);
        release_buffer(id);
        assert!(get_buffer(id).is_none());
        assert!(get_buffer(0).is_none());
    }
}

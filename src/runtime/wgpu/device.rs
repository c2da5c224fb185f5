//! WebGPU device identification and adapter discovery

use std::fmt;
use std::sync::Arc;
use wgpu::{Adapter, Backend, Limits};

use crate::error::{Error, Result};

/// Adapter properties cached when a client is created
#[derive(Clone)]
pub(crate) struct AdapterInfo {
    /// Adapter name (e.g., "NVIDIA GeForce RTX 4090")
    name: String,
    /// Backend type (Vulkan, Metal, DX12, etc.)
    backend: Backend,
    /// Device limits
    limits: Limits,
}

/// WebGPU device identifier.
///
/// The index is the position of the adapter in WebGPU enumeration order.
#[derive(Clone)]
pub struct WgpuDevice {
    pub(crate) index: usize,
    info: Option<Arc<AdapterInfo>>,
}

impl WgpuDevice {
    /// Identifier for the adapter at `index`; nothing is initialised yet
    pub fn new(index: usize) -> Self {
        Self { index, info: None }
    }

    pub(crate) fn with_info(index: usize, info: Arc<AdapterInfo>) -> Self {
        Self {
            index,
            info: Some(info),
        }
    }

    /// Adapter name, "unknown" before the client is created
    pub fn adapter_name(&self) -> String {
        self.info
            .as_ref()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Backend type, if known
    pub fn backend(&self) -> Option<Backend> {
        self.info.as_ref().map(|i| i.backend)
    }

    /// Device limits (defaults before the client is created)
    pub fn limits(&self) -> Limits {
        self.info
            .as_ref()
            .map(|i| i.limits.clone())
            .unwrap_or_default()
    }

    /// Maximum storage buffer binding size in bytes
    pub fn max_storage_buffer_size(&self) -> u64 {
        self.limits().max_storage_buffer_binding_size as u64
    }
}

impl crate::runtime::Device for WgpuDevice {
    fn id(&self) -> usize {
        self.index
    }

    fn name(&self) -> String {
        format!("wgpu:{}", self.index)
    }
}

impl fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("index", &self.index)
            .field("adapter", &self.adapter_name())
            .field("backend", &self.backend())
            .finish()
    }
}

// ============================================================================
// Adapter Discovery
// ============================================================================

/// All adapters visible to a default instance, in enumeration order
pub(crate) fn enumerate_adapters_blocking() -> Vec<Adapter> {
    let instance = wgpu::Instance::default();
    pollster::block_on(instance.enumerate_adapters(wgpu::Backends::all()))
}

/// The adapter at `index` together with its cached properties
pub(crate) fn query_adapter_blocking(index: usize) -> Result<(Adapter, Arc<AdapterInfo>)> {
    let mut adapters = enumerate_adapters_blocking();
    if index >= adapters.len() {
        return Err(Error::DeviceEnumeration {
            reason: format!(
                "WebGPU adapter {index} requested, {} available",
                adapters.len()
            ),
        });
    }
    let adapter = adapters.swap_remove(index);

    let wgpu_info = adapter.get_info();
    let info = Arc::new(AdapterInfo {
        name: wgpu_info.name,
        backend: wgpu_info.backend,
        limits: adapter.limits(),
    });
    Ok((adapter, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Device;

    #[test]
    fn test_wgpu_device_creation() {
        let device = WgpuDevice::new(3);
        assert_eq!(device.id(), 3);
        assert_eq!(device.name(), "wgpu:3");
        assert_eq!(device.adapter_name(), "unknown");
    }

    #[test]
    fn test_out_of_range_adapter_is_an_enumeration_error() {
        let count = enumerate_adapters_blocking().len();
        assert!(matches!(
            query_adapter_blocking(count),
            Err(Error::DeviceEnumeration { .. })
        ));
    }
}

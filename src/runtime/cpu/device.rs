//! CPU device implementation

use crate::runtime::Device;

/// Virtual host device
///
/// The host can be split into several virtual devices, each with its own
/// in-order worker queue, so multi-device partitioning runs without a GPU.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CpuDevice {
    id: usize,
}

impl CpuDevice {
    /// Create virtual host device `id`
    pub fn new(id: usize) -> Self {
        Self { id }
    }
}

impl Device for CpuDevice {
    fn id(&self) -> usize {
        self.id
    }

    fn name(&self) -> String {
        format!("cpu:{}", self.id)
    }
}

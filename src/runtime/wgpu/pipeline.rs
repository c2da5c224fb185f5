//! Pipeline creation for generated WGSL kernels

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BindingType, Buffer, BufferBindingType, ComputePipeline,
    ComputePipelineDescriptor, Device, PipelineLayoutDescriptor, ShaderModuleDescriptor,
    ShaderSource, ShaderStages,
};

/// Key for the bind group layout cache
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LayoutKey {
    /// Number of storage buffers in the layout
    pub num_storage_buffers: u32,
}

/// Per-device factory for compute pipelines
///
/// Compiled pipelines themselves are cached by the process-wide kernel
/// cache; this only shares bind group layouts between kernels with the same
/// number of bindings.
pub struct PipelineCache {
    device: Arc<Device>,
    layouts: Mutex<HashMap<LayoutKey, Arc<BindGroupLayout>>>,
}

impl PipelineCache {
    /// Create a pipeline cache for `device`
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create a layout of read-write storage buffers
    pub fn layout(&self, key: LayoutKey) -> Arc<BindGroupLayout> {
        let mut layouts = self.layouts.lock();
        if let Some(layout) = layouts.get(&key) {
            return layout.clone();
        }

        let entries: Vec<BindGroupLayoutEntry> = (0..key.num_storage_buffers)
            .map(|i| BindGroupLayoutEntry {
                binding: i,
                visibility: ShaderStages::COMPUTE,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let layout = Arc::new(
            self.device
                .create_bind_group_layout(&BindGroupLayoutDescriptor {
                    label: Some("vexr_storage_layout"),
                    entries: &entries,
                }),
        );
        layouts.insert(key, layout.clone());
        layout
    }

    /// Build the pipeline of one generated kernel
    pub fn create_pipeline(
        &self,
        name: &str,
        wgsl: &str,
        layout: &BindGroupLayout,
    ) -> ComputePipeline {
        let module = self.device.create_shader_module(ShaderModuleDescriptor {
            label: Some(name),
            source: ShaderSource::Wgsl(wgsl.into()),
        });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some(&format!("{name}_layout")),
                bind_group_layouts: &[layout],
                immediate_size: 0,
            });

        self.device
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(name),
                compilation_options: Default::default(),
                cache: None,
            })
    }

    /// Bind `buffers` to consecutive bindings
    pub fn create_bind_group(&self, layout: &BindGroupLayout, buffers: &[&Buffer]) -> BindGroup {
        let entries: Vec<BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("vexr_bind_group"),
            layout,
            entries: &entries,
        })
    }
}

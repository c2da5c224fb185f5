//! WebGPU runtime implementation

use std::sync::Arc;
use wgpu::util::DeviceExt;
use wgpu::{BindGroupLayout, Buffer, ComputePipeline};

use super::client::{WgpuClient, WgpuEvent, get_buffer, register_buffer, release_buffer};
use super::device::{WgpuDevice, enumerate_adapters_blocking};
use super::pipeline::LayoutKey;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::fusion::codegen;
use crate::runtime::{KernelArg, KernelSource, ParamKind, Runtime};

/// WebGPU compute runtime
///
/// Kernels are generated as WGSL, validated with naga and compiled into
/// compute pipelines. 64-bit floats are not available.
#[derive(Clone, Debug, Default)]
pub struct WgpuRuntime;

/// A generated kernel compiled into a compute pipeline
pub struct WgpuKernel {
    source: Arc<KernelSource>,
    wgsl: String,
    pipeline: ComputePipeline,
    layout: Arc<BindGroupLayout>,
}

impl WgpuKernel {
    /// The description the kernel was built from
    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    /// Generated WGSL text
    pub fn wgsl(&self) -> &str {
        &self.wgsl
    }
}

impl std::fmt::Debug for WgpuKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuKernel")
            .field("name", &self.source.name)
            .finish_non_exhaustive()
    }
}

impl WgpuRuntime {
    /// Clients for up to `max` WebGPU adapters, in enumeration order
    pub fn queue_list(max: usize) -> Result<Vec<WgpuClient>> {
        let available = enumerate_adapters_blocking().len();
        let count = available.min(max);
        if count == 0 {
            return Err(Error::DeviceEnumeration {
                reason: format!("{available} WebGPU adapters found, {max} requested"),
            });
        }
        (0..count).map(|i| WgpuClient::new(WgpuDevice::new(i))).collect()
    }

    /// Check if WebGPU is available on this system
    pub fn is_available() -> bool {
        !enumerate_adapters_blocking().is_empty()
    }
}

fn lookup(handle: u64, client: &WgpuClient) -> Result<Arc<Buffer>> {
    get_buffer(handle).ok_or_else(|| client.fault(format!("unknown buffer {handle}")))
}

fn check_copy(buffer: &Buffer, offset: usize, len: usize, client: &WgpuClient) -> Result<()> {
    if offset % 4 != 0 || len % 4 != 0 {
        return Err(Error::invalid_argument(
            "offset",
            format!("copy of {len} bytes at offset {offset} is not 4-byte aligned"),
        ));
    }
    if (offset + len) as u64 > buffer.size() {
        return Err(client.fault(format!(
            "copy of {len} bytes at offset {offset} exceeds buffer of {} bytes",
            buffer.size()
        )));
    }
    Ok(())
}

/// Validate generated WGSL before handing it to the driver
fn validate_wgsl(name: &str, wgsl: &str) -> Result<()> {
    use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

    let module = wgpu::naga::front::wgsl::Frontend::new()
        .parse(wgsl)
        .map_err(|e| Error::KernelCompile {
            kernel: name.to_string(),
            diagnostics: e.emit_to_string(wgsl),
        })?;
    Validator::new(ValidationFlags::all(), Capabilities::empty())
        .validate(&module)
        .map_err(|e| Error::KernelCompile {
            kernel: name.to_string(),
            diagnostics: e.emit_to_string(wgsl),
        })?;
    Ok(())
}

/// Encode one scalar argument as the raw bits the kernel decodes
fn scalar_bits(dtype: DType, value: f64) -> Result<u32> {
    match dtype {
        DType::F32 => Ok((value as f32).to_bits()),
        DType::I32 => Ok(value as i32 as u32),
        DType::U32 => Ok(value as u32),
        DType::F64 => Err(Error::unsupported_dtype(dtype, "WebGPU scalar argument")),
    }
}

impl Runtime for WgpuRuntime {
    type Device = WgpuDevice;
    type Client = WgpuClient;
    type Kernel = WgpuKernel;
    type Event = WgpuEvent;

    fn name() -> &'static str {
        "wgpu"
    }

    fn allocate(size_bytes: usize, client: &Self::Client) -> Result<u64> {
        if size_bytes == 0 {
            return Ok(0);
        }
        if size_bytes as u64 > client.device_id.max_storage_buffer_size() {
            return Err(client.fault(format!(
                "{size_bytes} bytes exceed the storage buffer limit of {}",
                client.device_id.max_storage_buffer_size()
            )));
        }
        Ok(register_buffer(client, size_bytes))
    }

    fn deallocate(ptr: u64, _size_bytes: usize, _client: &Self::Client) {
        release_buffer(ptr);
    }

    fn copy_to_device(
        src: &[u8],
        dst: u64,
        offset: usize,
        client: &Self::Client,
    ) -> Result<Self::Event> {
        if !src.is_empty() {
            let buffer = lookup(dst, client)?;
            check_copy(&buffer, offset, src.len(), client)?;
            client.queue.write_buffer(&buffer, offset as u64, src);
        }
        // An empty submission flushes the staged write.
        let submission = client.queue.submit(std::iter::empty());
        Ok(client.event(submission))
    }

    fn copy_from_device(
        src: u64,
        offset: usize,
        dst: &mut [u8],
        client: &Self::Client,
    ) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let buffer = lookup(src, client)?;
        check_copy(&buffer, offset, dst.len(), client)?;

        let staging = client.create_staging_buffer("vexr readback", dst.len() as u64);
        let mut encoder = client
            .wgpu_device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("copy_from_device"),
            });
        encoder.copy_buffer_to_buffer(&buffer, offset as u64, &staging, 0, dst.len() as u64);
        let submission = client.queue.submit(std::iter::once(encoder.finish()));
        client.read_staging(&staging, submission, dst)
    }

    fn compile(source: &KernelSource, client: &Self::Client) -> Result<Self::Kernel> {
        let wgsl = codegen::wgsl(source)?;
        validate_wgsl(&source.name, &wgsl)?;
        log::debug!(
            "compiling WGSL kernel {} ({}) for {}",
            source.name,
            source.signature,
            crate::runtime::Device::name(&client.device_id)
        );

        let layout = client.pipelines.layout(LayoutKey {
            num_storage_buffers: source.buffer_count() as u32 + 1,
        });
        let pipeline = client.pipelines.create_pipeline(&source.name, &wgsl, &layout);
        Ok(WgpuKernel {
            source: Arc::new(source.clone()),
            wgsl,
            pipeline,
            layout,
        })
    }

    fn launch(
        kernel: &Self::Kernel,
        args: &[KernelArg],
        work_items: usize,
        client: &Self::Client,
    ) -> Result<Self::Event> {
        let source = &kernel.source;
        source.check_args(args)?;
        let n = u32::try_from(work_items).map_err(|_| {
            Error::invalid_argument("work_items", format!("{work_items} exceeds u32 range"))
        })?;

        let mut buffers: Vec<Arc<Buffer>> = Vec::with_capacity(args.len() + 1);
        let mut params: Vec<u32> = vec![n];
        for (param, arg) in source.params.iter().zip(args) {
            match (param.kind, *arg) {
                (ParamKind::Buffer { .. }, KernelArg::Buffer(0)) => {
                    buffers.push(client.placeholder.clone())
                }
                (ParamKind::Buffer { .. }, KernelArg::Buffer(handle)) => {
                    buffers.push(lookup(handle, client)?)
                }
                (ParamKind::Scalar(dtype), KernelArg::Scalar(value)) => {
                    params.push(scalar_bits(dtype, value)?)
                }
                _ => return Err(Error::Internal(format!("argument mismatch for {}", source.name))),
            }
        }

        let params = client
            .wgpu_device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("vexr params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let mut bound: Vec<&Buffer> = buffers.iter().map(|b| b.as_ref()).collect();
        bound.push(&params);
        let bind_group = client.pipelines.create_bind_group(&kernel.layout, &bound);

        log::trace!(
            "launch {} over {} items on wgpu:{}",
            source.name,
            work_items,
            client.device_id.index
        );
        client.count_launch();

        let mut encoder = client
            .wgpu_device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&source.name),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&source.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, Some(&bind_group), &[]);
            pass.dispatch_workgroups(codegen::dispatch_size(source, work_items), 1, 1);
        }
        let submission = client.queue.submit(std::iter::once(encoder.finish()));
        Ok(client.event(submission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::Signature;

    #[test]
    fn test_scalar_bits() {
        assert_eq!(scalar_bits(DType::F32, 1.5).unwrap(), 1.5f32.to_bits());
        assert_eq!(scalar_bits(DType::I32, -2.0).unwrap(), (-2i32) as u32);
        assert_eq!(scalar_bits(DType::U32, 7.0).unwrap(), 7);
        assert!(scalar_bits(DType::F64, 1.0).is_err());
    }

    #[test]
    fn test_generated_gather_validates() {
        let source = KernelSource::new(Signature::Gather { dtype: DType::U32 }).unwrap();
        let wgsl = codegen::wgsl(&source).unwrap();
        validate_wgsl(&source.name, &wgsl).unwrap();
    }

    #[test]
    fn test_broken_wgsl_is_a_compile_error() {
        let err = validate_wgsl("broken", "fn broken( {").unwrap_err();
        assert!(matches!(err, Error::KernelCompile { .. }));
    }

    #[test]
    fn test_gather_on_gpu() {
        let Ok(queues) = WgpuRuntime::queue_list(1) else {
            println!("No GPU available, skipping test");
            return;
        };
        let client = &queues[0];
        let src: Vec<f32> = vec![10.0, 11.0, 12.0, 13.0];
        let idx: Vec<u32> = vec![3, 0];

        let src_ptr = WgpuRuntime::allocate(16, client).unwrap();
        let idx_ptr = WgpuRuntime::allocate(8, client).unwrap();
        let out_ptr = WgpuRuntime::allocate(8, client).unwrap();
        WgpuRuntime::copy_to_device(bytemuck::cast_slice(&src), src_ptr, 0, client).unwrap();
        WgpuRuntime::copy_to_device(bytemuck::cast_slice(&idx), idx_ptr, 0, client).unwrap();

        let source = KernelSource::new(Signature::Gather { dtype: DType::F32 }).unwrap();
        let kernel = WgpuRuntime::compile(&source, client).unwrap();
        let args = [
            KernelArg::Buffer(out_ptr),
            KernelArg::Buffer(src_ptr),
            KernelArg::Buffer(idx_ptr),
        ];
        WgpuRuntime::launch(&kernel, &args, 2, client).unwrap();

        let mut out = [0.0f32; 2];
        WgpuRuntime::copy_from_device(out_ptr, 0, bytemuck::cast_slice_mut(&mut out), client)
            .unwrap();
        assert_eq!(out, [13.0, 10.0]);
        for ptr in [src_ptr, idx_ptr, out_ptr] {
            WgpuRuntime::deallocate(ptr, 0, client);
        }
    }
}

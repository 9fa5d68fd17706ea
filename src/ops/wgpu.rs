//! WGPU batched kernels
//!
//! This module runs staged batches as compute shaders through `wgpu`. It
//! handles GPU context initialization (once, via `lazy_static`), eager
//! pipeline compilation for every entry point of `shaders/batched.wgsl`, and
//! upload, dispatch and readback per batch.
//!
//! ## Buffer Bindings
//!
//! | binding | contents                                          |
//! |---------|---------------------------------------------------|
//! | 0       | uniform `Params { count, in_dim, dim, arity, code }` |
//! | 1       | input slots, concatenated                         |
//! | 2       | auxiliary: dropout mask or forward value          |
//! | 3       | upstream gradient                                 |
//! | 4       | output, or input-gradient contributions           |
//! | 5       | max-scalar argmax                                 |
//!
//! Unused bindings get a one-element placeholder; `wgpu` rejects empty
//! storage buffers.
//!
//! ## Notes
//! - All futures are driven with `pollster::block_on` / `PollType::Wait`
//! - Errors never panic; they surface as [`KernelError`] and the dispatcher
//!   reruns the batch on the CPU

use super::{BackwardBatch, ForwardBatch, KernelError, Kernels};
use crate::node::Op;
use crate::tensors::TensorFloat;
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use wgpu::util::DeviceExt;

const SHADER: &str = include_str!("shaders/batched.wgsl");

const WORKGROUP: usize = 64;

const ENTRY_POINTS: [&str; 16] = [
    "activation_forward",
    "activation_backward",
    "pdot_forward",
    "pdot_backward",
    "pmul_forward",
    "pmul_backward",
    "add_forward",
    "add_backward",
    "sum_forward",
    "sum_backward",
    "max_forward",
    "max_backward",
    "broadcast_forward",
    "broadcast_backward",
    "mask_forward",
    "mask_backward",
];

/// Holds the WGPU device and queue shared by every graph in the process.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    ///
    /// # Errors
    /// [`KernelError::Unavailable`] if no adapter or device can be acquired.
    pub fn new() -> Result<Self, KernelError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(|e| KernelError::Unavailable(e.to_string()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("dynbatch"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| KernelError::Unavailable(e.to_string()))?;

        tracing::debug!(adapter = ?adapter.get_info().name, "gpu context ready");
        Ok(Self { device, queue })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Option<GpuContext> = match GpuContext::new() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            tracing::warn!(error = %e, "no gpu context");
            None
        }
    };
}

/// One kernel launch: entry point, shape parameters and host buffers.
struct Launch<'a> {
    entry: &'static str,
    params: [u32; 8],
    threads: usize,
    x: Cow<'a, [TensorFloat]>,
    aux: &'a [TensorFloat],
    dy: &'a [TensorFloat],
    idx_in: &'a [u32],
}

/// Compute-shader implementation of every batched operator.
pub struct WgpuKernels {
    ctx: &'static GpuContext,
    layout: wgpu::BindGroupLayout,
    pipelines: FxHashMap<&'static str, wgpu::ComputePipeline>,
}

impl WgpuKernels {
    /// Compiles every pipeline on the shared context.
    ///
    /// # Errors
    /// [`KernelError::Unavailable`] when no GPU context exists.
    pub fn new() -> Result<Self, KernelError> {
        let ctx = GPU_CONTEXT
            .as_ref()
            .ok_or_else(|| KernelError::Unavailable("no wgpu adapter".into()))?;
        let device = &ctx.device;

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("batched"),
            source: wgpu::ShaderSource::Wgsl(SHADER.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("batched_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage(1, true),
                storage(2, true),
                storage(3, true),
                storage(4, false),
                storage(5, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("batched_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipelines = ENTRY_POINTS
            .iter()
            .map(|&entry| {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(entry),
                    compilation_options: Default::default(),
                    cache: None,
                });
                (entry, pipeline)
            })
            .collect();

        Ok(Self {
            ctx,
            layout,
            pipelines,
        })
    }

    fn limit(&self) -> usize {
        self.ctx.device.limits().max_compute_workgroups_per_dimension as usize * WORKGROUP
    }

    /// Uploads, dispatches and reads back one launch.
    fn run(&self, launch: Launch<'_>, out: &mut [TensorFloat], idx: &mut [u32]) -> Result<(), KernelError> {
        if launch.threads > self.limit() {
            return Err(KernelError::TooLarge {
                elements: launch.threads,
                limit: self.limit(),
            });
        }
        let pipeline = self
            .pipelines
            .get(launch.entry)
            .ok_or(KernelError::Unsupported { op: launch.entry })?;
        let device = &self.ctx.device;

        let storage = |label: &str, data: &[u8], writable: bool| {
            let mut usage = wgpu::BufferUsages::STORAGE;
            if writable {
                usage |= wgpu::BufferUsages::COPY_SRC;
            }
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage,
            })
        };

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::cast_slice(&launch.params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let x = storage("x", bytemuck::cast_slice(&padded(&launch.x)), false);
        let aux = storage("aux", bytemuck::cast_slice(&padded(launch.aux)), false);
        let dy = storage("dy", bytemuck::cast_slice(&padded(launch.dy)), false);
        let zeros = vec![0.0f32; out.len().max(1)];
        let dst = storage("dst", bytemuck::cast_slice(&zeros), true);
        let idx_buf = storage("idx", bytemuck::cast_slice(&padded(launch.idx_in)), true);

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(launch.entry),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: x.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: aux.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: dy.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: dst.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: idx_buf.as_entire_binding(),
                },
            ],
        });

        let out_bytes = (out.len().max(1) * 4) as u64;
        let idx_bytes = (launch.idx_in.len().max(1) * 4) as u64;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: out_bytes + idx_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(launch.entry),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(launch.entry),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(launch.threads.div_ceil(WORKGROUP) as u32, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&dst, 0, &staging, 0, out_bytes);
        encoder.copy_buffer_to_buffer(&idx_buf, 0, &staging, out_bytes, idx_bytes);
        self.ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| KernelError::Dispatch(e.to_string()))?;
        rx.recv()
            .map_err(|e| KernelError::Dispatch(e.to_string()))?
            .map_err(|e| KernelError::Dispatch(e.to_string()))?;

        {
            let data = slice.get_mapped_range();
            let (head, tail) = data.split_at(out_bytes as usize);
            let values: &[f32] = bytemuck::try_cast_slice(head).map_err(|e| KernelError::Dispatch(e.to_string()))?;
            out.copy_from_slice(&values[..out.len()]);
            let indices: &[u32] = bytemuck::try_cast_slice(tail).map_err(|e| KernelError::Dispatch(e.to_string()))?;
            idx.copy_from_slice(&indices[..idx.len()]);
        }
        staging.unmap();
        Ok(())
    }
}

impl Kernels for WgpuKernels {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn forward(&self, op: Op, batch: &mut ForwardBatch) -> Result<(), KernelError> {
        let count = batch.count;
        let dim = batch.dim;
        let in_dim = batch.in_dims.first().copied().unwrap_or(0);
        let (entry, code, threads) = match op {
            Op::Input => return Err(KernelError::Unsupported { op: op.name() }),
            Op::Activation(a) => ("activation_forward", a.code(), count * dim),
            Op::PointDot => ("pdot_forward", 0, count),
            Op::PointMul => ("pmul_forward", 0, count * dim),
            Op::Add { .. } => ("add_forward", 0, count * dim),
            Op::Sum => ("sum_forward", 0, count),
            Op::MaxScalar => ("max_forward", 0, count),
            Op::ScalarToVector => ("broadcast_forward", 0, count * dim),
            Op::Dropout { .. } => ("mask_forward", 0, count * dim),
        };
        let launch = Launch {
            entry,
            params: params(count, in_dim, dim, batch.inputs.len(), code),
            threads,
            x: concat(&batch.inputs),
            aux: &batch.mask,
            dy: &[],
            idx_in: &batch.argmax,
        };
        let mut argmax = batch.argmax.clone();
        self.run(launch, &mut batch.output, &mut argmax)?;
        batch.argmax = argmax;
        Ok(())
    }

    fn backward(&self, op: Op, batch: &mut BackwardBatch) -> Result<(), KernelError> {
        let count = batch.count;
        let dim = batch.dim;
        let in_dim = batch.in_dims.first().copied().unwrap_or(0);
        let (entry, code, threads, aux) = match op {
            Op::Input => return Err(KernelError::Unsupported { op: op.name() }),
            Op::Activation(a) => ("activation_backward", a.code(), count * dim, &batch.value),
            Op::PointDot => ("pdot_backward", 0, count * in_dim, &batch.mask),
            Op::PointMul => ("pmul_backward", 0, count * dim, &batch.mask),
            Op::Add { .. } => ("add_backward", 0, count * dim, &batch.mask),
            Op::Sum => ("sum_backward", 0, count * in_dim, &batch.mask),
            Op::MaxScalar => ("max_backward", 0, count * in_dim, &batch.mask),
            Op::ScalarToVector => ("broadcast_backward", 0, count, &batch.mask),
            Op::Dropout { .. } => ("mask_backward", 0, count * dim, &batch.mask),
        };
        let launch = Launch {
            entry,
            params: params(count, in_dim, dim, batch.inputs.len(), code),
            threads,
            x: concat(&batch.inputs),
            aux,
            dy: &batch.grad,
            idx_in: &batch.argmax,
        };
        let mut contributions = batch.input_grads.concat();
        let mut argmax = batch.argmax.clone();
        self.run(launch, &mut contributions, &mut argmax)?;

        let mut offset = 0;
        for slot in &mut batch.input_grads {
            let len = slot.len();
            slot.copy_from_slice(&contributions[offset..offset + len]);
            offset += len;
        }
        Ok(())
    }
}

fn params(count: usize, in_dim: usize, dim: usize, arity: usize, code: u32) -> [u32; 8] {
    [count as u32, in_dim as u32, dim as u32, arity as u32, code, 0, 0, 0]
}

fn concat(slots: &[Vec<TensorFloat>]) -> Cow<'_, [TensorFloat]> {
    match slots {
        [single] => Cow::Borrowed(single.as_slice()),
        _ => Cow::Owned(slots.concat()),
    }
}

/// Guarantees at least one element so the buffer can be bound.
fn padded<T: bytemuck::Pod + Default>(data: &[T]) -> Cow<'_, [T]> {
    if data.is_empty() {
        Cow::Owned(vec![T::default()])
    } else {
        Cow::Borrowed(data)
    }
}

//! GPU compute backend
//!
//! Implements [`ComputeBackend`] with wgpu compute shaders over storage
//! buffers. This backend is only available when the `gpu` feature is enabled.
//!
//! # Shader Files
//!
//! - `shaders/fluid.wgsl` - advection, force injection, divergence, Jacobi,
//!   vorticity, confinement and gradient subtraction (one entry point each)
//! - `shaders/visualize.wgsl` - vector and scalar visualizers writing packed RGBA8
//!
//! # Implementation
//!
//! Dispatches of one frame are recorded into a single command encoder, each in
//! its own compute pass with a freshly built bind group, and submitted at
//! [`present`](ComputeBackend::present). A poller thread waits on each
//! submission index and then runs the completion callbacks registered for it.
//! Pipelines are compiled on first use and cached per (kernel, precision);
//! half precision is selected through the `quantize_f16` override constant.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::context::GpuContext;
use super::{BufferHandle, CompletionCallback, ComputeBackend, DispatchTarget, ParamSlot};
use crate::config::Precision;
use crate::error::BackendError;
use crate::field::FieldDescriptor;
use crate::params::ParameterBlock;
use crate::stages::Kernel;

/// Workgroup edge length (matches `@workgroup_size(8, 8)` in the shaders)
const WORKGROUP_SIZE: u32 = 8;

/// Bytes per field cell (two `f32` components)
const CELL_BYTES: u64 = 8;

/// Bytes per surface pixel (packed RGBA8)
const PIXEL_BYTES: u64 = 4;

const PARAMS_BYTES: u64 = std::mem::size_of::<ParameterBlock>() as u64;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    precision: Precision,
}

impl GpuBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * CELL_BYTES
    }
}

struct GpuSurface {
    width: u32,
    height: u32,
    pixels: wgpu::Buffer,
    presented: wgpu::Buffer,
    has_presented: bool,
}

impl GpuSurface {
    fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * PIXEL_BYTES
    }
}

#[derive(Default)]
struct GpuState {
    buffers: FxHashMap<BufferHandle, GpuBuffer>,
    params: Vec<wgpu::Buffer>,
    surface: Option<GpuSurface>,
    encoder: Option<wgpu::CommandEncoder>,
    last_submission: Option<wgpu::SubmissionIndex>,
    next_handle: u64,
}

type PollRequest = (Option<wgpu::SubmissionIndex>, CompletionCallback);

/// Waits on submissions and runs completion callbacks, in order
struct Poller {
    device: Arc<wgpu::Device>,
    sender: Mutex<Option<Sender<PollRequest>>>,
    worker: Option<JoinHandle<()>>,
}

fn wait_for(device: &wgpu::Device, index: Option<wgpu::SubmissionIndex>) {
    let maintain = match index {
        Some(index) => wgpu::Maintain::WaitForSubmissionIndex(index),
        None => wgpu::Maintain::Wait,
    };
    let _ = device.poll(maintain);
}

impl Poller {
    fn spawn(device: Arc<wgpu::Device>) -> Self {
        let (sender, receiver) = mpsc::channel::<PollRequest>();
        let thread_device = Arc::clone(&device);
        let worker = thread::Builder::new()
            .name("gpu-backend-poller".into())
            .spawn(move || {
                for (index, callback) in receiver {
                    wait_for(&thread_device, index);
                    callback();
                }
            });

        match worker {
            Ok(handle) => Self {
                device,
                sender: Mutex::new(Some(sender)),
                worker: Some(handle),
            },
            Err(e) => {
                warn!("Failed to spawn GPU poller thread: {e}; completions will block the caller");
                Self {
                    device,
                    sender: Mutex::new(None),
                    worker: None,
                }
            }
        }
    }

    fn submit(&self, index: Option<wgpu::SubmissionIndex>, callback: CompletionCallback) {
        let undelivered = {
            let guard = self
                .sender
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match guard.as_ref() {
                Some(sender) => sender.send((index, callback)).err().map(|e| e.0),
                None => Some((index, callback)),
            }
        };
        if let Some((index, callback)) = undelivered {
            wait_for(&self.device, index);
            callback();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: wgpu::BufferSize::new(PARAMS_BYTES),
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// wgpu implementation of [`ComputeBackend`]
pub struct GpuBackend {
    context: GpuContext,
    field_module: wgpu::ShaderModule,
    visualize_module: wgpu::ShaderModule,
    field_layout: wgpu::BindGroupLayout,
    visualize_layout: wgpu::BindGroupLayout,
    field_pipeline_layout: wgpu::PipelineLayout,
    visualize_pipeline_layout: wgpu::PipelineLayout,
    pipelines: Mutex<FxHashMap<(Kernel, Precision), Arc<wgpu::ComputePipeline>>>,
    state: Mutex<GpuState>,
    poller: Poller,
    name: String,
}

impl std::fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackend")
            .field("adapter", &self.context.adapter_name())
            .finish_non_exhaustive()
    }
}

impl GpuBackend {
    /// Create the backend: load shaders, build bind group layouts and start
    /// the completion poller. Pipelines are compiled lazily.
    #[must_use]
    pub fn new(context: GpuContext) -> Self {
        let device = context.device();

        let field_module = device.create_shader_module(wgpu::include_wgsl!("shaders/fluid.wgsl"));
        let visualize_module =
            device.create_shader_module(wgpu::include_wgsl!("shaders/visualize.wgsl"));

        // params, source_a, source_b, destination
        let field_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Field Kernel Bind Group Layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });

        // params, values, pixels
        let visualize_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Visualize Bind Group Layout"),
            entries: &[uniform_entry(0), storage_entry(1, true), storage_entry(2, false)],
        });

        let field_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Field Kernel Pipeline Layout"),
            bind_group_layouts: &[&field_layout],
            push_constant_ranges: &[],
        });
        let visualize_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Visualize Pipeline Layout"),
                bind_group_layouts: &[&visualize_layout],
                push_constant_ranges: &[],
            });

        let poller = Poller::spawn(context.shared_device());
        let name = format!("wgpu ({})", context.adapter_name());

        Self {
            context,
            field_module,
            visualize_module,
            field_layout,
            visualize_layout,
            field_pipeline_layout,
            visualize_pipeline_layout,
            pipelines: Mutex::new(FxHashMap::default()),
            state: Mutex::new(GpuState::default()),
            poller,
            name,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, GpuState>, BackendError> {
        self.state.lock().map_err(|_| BackendError::LockPoisoned)
    }

    /// Fetch or compile the pipeline for `kernel` at `precision`.
    fn pipeline(
        &self,
        kernel: Kernel,
        precision: Precision,
    ) -> Result<Arc<wgpu::ComputePipeline>, BackendError> {
        let key = (kernel, precision);
        let mut cache = self.pipelines.lock().map_err(|_| BackendError::LockPoisoned)?;
        if let Some(pipeline) = cache.get(&key) {
            return Ok(Arc::clone(pipeline));
        }

        let mut constants = HashMap::new();
        let (layout, module) = if kernel.writes_surface() {
            (&self.visualize_pipeline_layout, &self.visualize_module)
        } else {
            let quantize = if precision == Precision::Float16 { 1.0 } else { 0.0 };
            constants.insert("quantize_f16".to_string(), quantize);
            (&self.field_pipeline_layout, &self.field_module)
        };

        let device = self.context.device();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.name()),
            layout: Some(layout),
            module,
            entry_point: kernel.name(),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            warn!("Failed to create {} pipeline: {}", kernel, error);
            return Err(BackendError::PipelineUnavailable(kernel));
        }

        debug!("Compiled {} pipeline ({:?})", kernel, precision);
        let pipeline = Arc::new(pipeline);
        cache.insert(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Submit the pending encoder, if any.
    fn flush(&self, state: &mut GpuState) {
        if let Some(encoder) = state.encoder.take() {
            let index = self.context.queue().submit(std::iter::once(encoder.finish()));
            state.last_submission = Some(index);
        }
    }

    fn new_encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.context
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Record one dispatch into the frame encoder.
    fn record(
        &self,
        state: &mut GpuState,
        kernel: Kernel,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        (width, height): (u32, u32),
    ) {
        let encoder = state
            .encoder
            .get_or_insert_with(|| self.new_encoder("Frame Encoder"));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.name()),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(
            width.div_ceil(WORKGROUP_SIZE),
            height.div_ceil(WORKGROUP_SIZE),
            1,
        );
    }

    /// Copy `size` bytes of `source` into a mappable buffer and read them back.
    fn read_back<T: bytemuck::Pod>(
        &self,
        state: &mut GpuState,
        source: &wgpu::Buffer,
        size: u64,
    ) -> Result<Vec<T>, BackendError> {
        let device = self.context.device();
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Pending dispatches go first so the copy sees their results
        let mut encoder = state
            .encoder
            .take()
            .unwrap_or_else(|| self.new_encoder("Readback Encoder"));
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        let index = self.context.queue().submit(std::iter::once(encoder.finish()));
        state.last_submission = Some(index);

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| BackendError::Readback(e.to_string()))?
            .map_err(|e| BackendError::Readback(e.to_string()))?;

        let data = slice.get_mapped_range();
        let values: Vec<T> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(values)
    }
}

impl ComputeBackend for GpuBackend {
    fn create_field(&self, descriptor: &FieldDescriptor) -> Result<BufferHandle, BackendError> {
        if !self.context.can_allocate(descriptor.width, descriptor.height) {
            return Err(BackendError::InsufficientMemory {
                width: descriptor.width,
                height: descriptor.height,
            });
        }
        let buffer = self.context.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some(descriptor.label),
            size: descriptor.cell_count() as u64 * CELL_BYTES,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut state = self.lock()?;
        let handle = BufferHandle(state.next_handle);
        state.next_handle += 1;
        state.buffers.insert(
            handle,
            GpuBuffer {
                buffer,
                width: descriptor.width,
                height: descriptor.height,
                precision: descriptor.precision,
            },
        );
        Ok(handle)
    }

    fn destroy_field(&self, handle: BufferHandle) {
        if let Ok(mut state) = self.lock() {
            // wgpu keeps the allocation alive until in-flight work using it finishes
            state.buffers.remove(&handle);
        }
    }

    fn create_param_slot(&self) -> Result<ParamSlot, BackendError> {
        let buffer = self.context.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Parameter Block"),
            size: PARAMS_BYTES,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut state = self.lock()?;
        let slot = ParamSlot(state.params.len() as u32);
        state.params.push(buffer);
        Ok(slot)
    }

    fn write_params(&self, slot: ParamSlot, block: &ParameterBlock) -> Result<(), BackendError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        // Queue writes land before the next submission, so recorded work goes first
        self.flush(state);
        let buffer = state
            .params
            .get(slot.0 as usize)
            .ok_or(BackendError::UnknownParamSlot(slot))?;
        self.context
            .queue()
            .write_buffer(buffer, 0, bytemuck::bytes_of(block));
        Ok(())
    }

    fn configure_surface(&self, width: u32, height: u32) -> Result<(), BackendError> {
        let size = u64::from(width) * u64::from(height) * PIXEL_BYTES;
        let device = self.context.device();
        let pixels = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Surface Pixels"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let presented = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Presented Pixels"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let mut state = self.lock()?;
        state.surface = Some(GpuSurface {
            width,
            height,
            pixels,
            presented,
            has_presented: false,
        });
        Ok(())
    }

    fn dispatch_kernel(
        &self,
        kernel: Kernel,
        sources: &[BufferHandle],
        params: Option<ParamSlot>,
        target: DispatchTarget,
    ) -> Result<(), BackendError> {
        if sources.len() != kernel.source_count() {
            return Err(BackendError::SourceCount {
                kernel,
                expected: kernel.source_count(),
                actual: sources.len(),
            });
        }
        let slot = params.ok_or(BackendError::MissingParameters(kernel))?;

        let mut guard = self.lock()?;
        let state = &mut *guard;
        let uniform = state
            .params
            .get(slot.0 as usize)
            .ok_or(BackendError::UnknownParamSlot(slot))?;

        let (destination, dimensions, precision) = match target {
            DispatchTarget::Buffer(handle) => {
                if kernel.writes_surface() {
                    return Err(BackendError::InvalidTarget(kernel));
                }
                if sources.contains(&handle) {
                    return Err(BackendError::Aliasing {
                        kernel,
                        buffer: handle,
                    });
                }
                let dest = state
                    .buffers
                    .get(&handle)
                    .ok_or(BackendError::UnknownBuffer(handle))?;
                (&dest.buffer, dest.dimensions(), dest.precision)
            }
            DispatchTarget::Surface => {
                if !kernel.writes_surface() {
                    return Err(BackendError::InvalidTarget(kernel));
                }
                let surface = state
                    .surface
                    .as_ref()
                    .ok_or(BackendError::SurfaceNotConfigured)?;
                (&surface.pixels, (surface.width, surface.height), Precision::Float32)
            }
        };

        let mut bound = Vec::with_capacity(sources.len());
        for handle in sources {
            let source = state
                .buffers
                .get(handle)
                .ok_or(BackendError::UnknownBuffer(*handle))?;
            if source.dimensions() != dimensions {
                return Err(BackendError::DimensionMismatch {
                    expected: dimensions,
                    actual: source.dimensions(),
                });
            }
            bound.push(&source.buffer);
        }

        let pipeline = self.pipeline(kernel, precision)?;

        let bind_group = if kernel.writes_surface() {
            self.context
                .device()
                .create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Visualize Bind Group"),
                    layout: &self.visualize_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: uniform.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: bound[0].as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: destination.as_entire_binding(),
                        },
                    ],
                })
        } else {
            // Single-source kernels never read binding 2; bind the first source there too
            let second = bound.get(1).copied().unwrap_or(bound[0]);
            self.context
                .device()
                .create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Field Kernel Bind Group"),
                    layout: &self.field_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: uniform.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: bound[0].as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: second.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: destination.as_entire_binding(),
                        },
                    ],
                })
        };

        self.record(state, kernel, &pipeline, &bind_group, dimensions);
        Ok(())
    }

    fn present(&self) -> Result<(), BackendError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let surface = state
            .surface
            .as_mut()
            .ok_or(BackendError::SurfaceNotConfigured)?;

        let mut encoder = state
            .encoder
            .take()
            .unwrap_or_else(|| self.new_encoder("Frame Encoder"));
        encoder.copy_buffer_to_buffer(
            &surface.pixels,
            0,
            &surface.presented,
            0,
            surface.byte_size(),
        );
        surface.has_presented = true;

        let index = self.context.queue().submit(std::iter::once(encoder.finish()));
        state.last_submission = Some(index);
        Ok(())
    }

    fn on_frame_complete(&self, callback: CompletionCallback) {
        let index = self.lock().ok().and_then(|mut state| state.last_submission.take());
        self.poller.submit(index, callback);
    }

    fn upload_field(&self, handle: BufferHandle, data: &[[f32; 2]]) -> Result<(), BackendError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        self.flush(state);
        let buffer = state
            .buffers
            .get(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))?;
        if data.len() as u64 * CELL_BYTES != buffer.byte_size() {
            return Err(BackendError::DimensionMismatch {
                expected: buffer.dimensions(),
                actual: (data.len() as u32, 1),
            });
        }
        let precision = buffer.precision;
        let quantized: Vec<[f32; 2]> = data
            .iter()
            .map(|cell| cell.map(|c| precision.quantize(c)))
            .collect();
        self.context
            .queue()
            .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(&quantized));
        Ok(())
    }

    fn read_field(&self, handle: BufferHandle) -> Result<Vec<[f32; 2]>, BackendError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let buffer = state
            .buffers
            .remove(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))?;
        let result = self.read_back(state, &buffer.buffer, buffer.byte_size());
        state.buffers.insert(handle, buffer);
        result
    }

    fn read_presented(&self) -> Result<Vec<u32>, BackendError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let surface = state
            .surface
            .take()
            .ok_or(BackendError::SurfaceNotConfigured)?;
        let result = if surface.has_presented {
            self.read_back(state, &surface.presented, surface.byte_size())
        } else {
            Ok(vec![0; surface.width as usize * surface.height as usize])
        };
        state.surface = Some(surface);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_gpu(&self) -> bool {
        true
    }
}

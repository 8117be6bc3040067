//! CPU reference backend
//!
//! Executes every kernel on the calling thread, one cell at a time, using the
//! bodies in [`crate::kernels`]. Dispatches therefore complete before
//! `dispatch_kernel` returns, but completion callbacks are still delivered
//! asynchronously from a notifier thread, optionally after an artificial
//! per-frame latency that stands in for device lag.

use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytemuck::Zeroable;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::{BufferHandle, CompletionCallback, ComputeBackend, DispatchTarget, ParamSlot};
use crate::config::Precision;
use crate::error::BackendError;
use crate::field::FieldDescriptor;
use crate::kernels::{self, Cell, Grid};
use crate::params::ParameterBlock;
use crate::stages::Kernel;

/// Host-memory field buffer
#[derive(Debug)]
struct CpuBuffer {
    width: u32,
    height: u32,
    precision: Precision,
    cells: Vec<Cell>,
}

impl CpuBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug)]
struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
    presented: Option<Vec<u32>>,
}

#[derive(Debug, Default)]
struct CpuState {
    buffers: FxHashMap<BufferHandle, CpuBuffer>,
    params: Vec<ParameterBlock>,
    surface: Option<Surface>,
    next_handle: u64,
    frames_presented: u64,
}

impl CpuState {
    fn source_grids<'a>(
        &'a self,
        sources: &[BufferHandle],
        expected: (u32, u32),
    ) -> Result<Vec<Grid<'a>>, BackendError> {
        sources
            .iter()
            .map(|handle| {
                let buffer = self
                    .buffers
                    .get(handle)
                    .ok_or(BackendError::UnknownBuffer(*handle))?;
                if buffer.dimensions() != expected {
                    return Err(BackendError::DimensionMismatch {
                        expected,
                        actual: buffer.dimensions(),
                    });
                }
                Ok(Grid::new(
                    &buffer.cells,
                    buffer.width as usize,
                    buffer.height as usize,
                ))
            })
            .collect()
    }

    fn compute_field(
        &self,
        kernel: Kernel,
        sources: &[BufferHandle],
        block: &ParameterBlock,
        dimensions: (u32, u32),
        precision: Precision,
    ) -> Result<Vec<Cell>, BackendError> {
        let grids = self.source_grids(sources, dimensions)?;
        let width = dimensions.0 as usize;
        let count = width * dimensions.1 as usize;

        (0..count)
            .map(|index| {
                let x = (index % width) as isize;
                let y = (index / width) as isize;
                kernels::field_cell(kernel, &grids, x, y, block)
                    .map(|cell| cell.map(|c| precision.quantize(c)))
                    .ok_or(BackendError::InvalidTarget(kernel))
            })
            .collect()
    }

    fn run_visualize(
        &mut self,
        kernel: Kernel,
        source: BufferHandle,
        block: &ParameterBlock,
    ) -> Result<(), BackendError> {
        let mut surface = self.surface.take().ok_or(BackendError::SurfaceNotConfigured)?;
        let result = self
            .source_grids(&[source], (surface.width, surface.height))
            .and_then(|grids| {
                let width = surface.width as usize;
                for (index, pixel) in surface.pixels.iter_mut().enumerate() {
                    let value = grids[0].fetch((index % width) as isize, (index / width) as isize);
                    *pixel = kernels::surface_pixel(kernel, value, block)
                        .ok_or(BackendError::InvalidTarget(kernel))?;
                }
                Ok(())
            });
        self.surface = Some(surface);
        result
    }
}

/// Runs completion callbacks on a dedicated thread, in submission order
#[derive(Debug)]
struct Notifier {
    sender: Mutex<Option<Sender<CompletionCallback>>>,
    worker: Option<JoinHandle<()>>,
}

impl Notifier {
    fn spawn(latency: Duration) -> Self {
        let (sender, receiver) = mpsc::channel::<CompletionCallback>();
        let worker = thread::Builder::new()
            .name("cpu-backend-notifier".into())
            .spawn(move || {
                for callback in receiver {
                    if !latency.is_zero() {
                        thread::sleep(latency);
                    }
                    callback();
                }
            });

        match worker {
            Ok(handle) => Self {
                sender: Mutex::new(Some(sender)),
                worker: Some(handle),
            },
            Err(e) => {
                // Callbacks run inline on the presenting thread instead
                tracing::warn!("Failed to spawn completion notifier thread: {e}");
                Self {
                    sender: Mutex::new(None),
                    worker: None,
                }
            }
        }
    }

    fn notify(&self, callback: CompletionCallback) {
        let undelivered = {
            let guard = self
                .sender
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match guard.as_ref() {
                Some(sender) => sender.send(callback).err().map(|mpsc::SendError(cb)| cb),
                None => Some(callback),
            }
        };
        if let Some(callback) = undelivered {
            callback();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Configures a [`CpuBackend`] before its notifier thread starts
#[derive(Debug, Clone, Default)]
pub struct CpuBackendBuilder {
    completion_latency: Duration,
    unavailable: FxHashSet<Kernel>,
}

impl CpuBackendBuilder {
    /// Delay each completion notification by `latency`.
    pub fn completion_latency(mut self, latency: Duration) -> Self {
        self.completion_latency = latency;
        self
    }

    /// Report [`BackendError::PipelineUnavailable`] for every dispatch of `kernel`.
    pub fn unavailable_kernel(mut self, kernel: Kernel) -> Self {
        self.unavailable.insert(kernel);
        self
    }

    /// Build the backend and start its notifier thread.
    #[must_use]
    pub fn build(self) -> CpuBackend {
        if !self.unavailable.is_empty() {
            debug!("CPU backend built with unavailable kernels: {:?}", self.unavailable);
        }
        CpuBackend {
            state: Mutex::new(CpuState::default()),
            notifier: Notifier::spawn(self.completion_latency),
            unavailable: self.unavailable,
        }
    }
}

/// Single-threaded reference implementation of [`ComputeBackend`]
#[derive(Debug)]
pub struct CpuBackend {
    state: Mutex<CpuState>,
    notifier: Notifier,
    unavailable: FxHashSet<Kernel>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// Backend with immediate completion and every kernel available
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a backend
    #[must_use]
    pub fn builder() -> CpuBackendBuilder {
        CpuBackendBuilder::default()
    }

    /// Number of frames presented so far
    #[must_use]
    pub fn frames_presented(&self) -> u64 {
        self.lock().map_or(0, |state| state.frames_presented)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CpuState>, BackendError> {
        self.state.lock().map_err(|_| BackendError::LockPoisoned)
    }
}

impl ComputeBackend for CpuBackend {
    fn create_field(&self, descriptor: &FieldDescriptor) -> Result<BufferHandle, BackendError> {
        let mut state = self.lock()?;
        let handle = BufferHandle(state.next_handle);
        state.next_handle += 1;
        state.buffers.insert(
            handle,
            CpuBuffer {
                width: descriptor.width,
                height: descriptor.height,
                precision: descriptor.precision,
                cells: vec![[0.0; 2]; descriptor.cell_count()],
            },
        );
        Ok(handle)
    }

    fn destroy_field(&self, handle: BufferHandle) {
        if let Ok(mut state) = self.lock() {
            state.buffers.remove(&handle);
        }
    }

    fn create_param_slot(&self) -> Result<ParamSlot, BackendError> {
        let mut state = self.lock()?;
        let slot = ParamSlot(state.params.len() as u32);
        state.params.push(ParameterBlock::zeroed());
        Ok(slot)
    }

    fn write_params(&self, slot: ParamSlot, block: &ParameterBlock) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        let stored = state
            .params
            .get_mut(slot.0 as usize)
            .ok_or(BackendError::UnknownParamSlot(slot))?;
        *stored = *block;
        Ok(())
    }

    fn configure_surface(&self, width: u32, height: u32) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        state.surface = Some(Surface {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
            presented: None,
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
        if self.unavailable.contains(&kernel) {
            return Err(BackendError::PipelineUnavailable(kernel));
        }
        if sources.len() != kernel.source_count() {
            return Err(BackendError::SourceCount {
                kernel,
                expected: kernel.source_count(),
                actual: sources.len(),
            });
        }
        let slot = params.ok_or(BackendError::MissingParameters(kernel))?;

        let mut state = self.lock()?;
        let block = *state
            .params
            .get(slot.0 as usize)
            .ok_or(BackendError::UnknownParamSlot(slot))?;

        match target {
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
                let (dimensions, precision) = state
                    .buffers
                    .get(&handle)
                    .map(|dest| (dest.dimensions(), dest.precision))
                    .ok_or(BackendError::UnknownBuffer(handle))?;
                let cells =
                    state.compute_field(kernel, sources, &block, dimensions, precision)?;
                if let Some(dest) = state.buffers.get_mut(&handle) {
                    dest.cells = cells;
                }
                Ok(())
            }
            DispatchTarget::Surface => {
                if !kernel.writes_surface() {
                    return Err(BackendError::InvalidTarget(kernel));
                }
                state.run_visualize(kernel, sources[0], &block)
            }
        }
    }

    fn present(&self) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        let surface = state
            .surface
            .as_mut()
            .ok_or(BackendError::SurfaceNotConfigured)?;
        surface.presented = Some(surface.pixels.clone());
        state.frames_presented += 1;
        Ok(())
    }

    fn on_frame_complete(&self, callback: CompletionCallback) {
        self.notifier.notify(callback);
    }

    fn upload_field(&self, handle: BufferHandle, data: &[[f32; 2]]) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        let buffer = state
            .buffers
            .get_mut(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))?;
        if data.len() != buffer.cells.len() {
            return Err(BackendError::DimensionMismatch {
                expected: buffer.dimensions(),
                actual: (data.len() as u32, 1),
            });
        }
        let precision = buffer.precision;
        for (dst, src) in buffer.cells.iter_mut().zip(data) {
            *dst = src.map(|c| precision.quantize(c));
        }
        Ok(())
    }

    fn read_field(&self, handle: BufferHandle) -> Result<Vec<[f32; 2]>, BackendError> {
        let state = self.lock()?;
        state
            .buffers
            .get(&handle)
            .map(|buffer| buffer.cells.clone())
            .ok_or(BackendError::UnknownBuffer(handle))
    }

    fn read_presented(&self) -> Result<Vec<u32>, BackendError> {
        let state = self.lock()?;
        let surface = state
            .surface
            .as_ref()
            .ok_or(BackendError::SurfaceNotConfigured)?;
        Ok(surface
            .presented
            .clone()
            .unwrap_or_else(|| vec![0; surface.pixels.len()]))
    }

    fn name(&self) -> &str {
        "cpu-reference"
    }

    fn is_gpu(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::field::FieldLayout;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn descriptor(width: u32, height: u32, precision: Precision) -> FieldDescriptor {
        FieldDescriptor {
            label: "test",
            width,
            height,
            layout: FieldLayout::Vector2,
            precision,
        }
    }

    fn backend_with_params(width: u32, height: u32) -> (CpuBackend, ParamSlot) {
        let backend = CpuBackend::new();
        let slot = backend.create_param_slot().unwrap();
        let block = ParameterBlock::new(width, height, &SimulationConfig::default());
        backend.write_params(slot, &block).unwrap();
        (backend, slot)
    }

    #[test]
    fn test_aliasing_rejected() {
        let (backend, slot) = backend_with_params(4, 4);
        let a = backend.create_field(&descriptor(4, 4, Precision::Float32)).unwrap();
        let err = backend
            .dispatch_kernel(Kernel::Divergence, &[a], Some(slot), DispatchTarget::Buffer(a))
            .unwrap_err();
        assert!(matches!(err, BackendError::Aliasing { buffer, .. } if buffer == a));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let (backend, slot) = backend_with_params(4, 4);
        let small = backend.create_field(&descriptor(4, 4, Precision::Float32)).unwrap();
        let large = backend.create_field(&descriptor(8, 4, Precision::Float32)).unwrap();
        let err = backend
            .dispatch_kernel(Kernel::Divergence, &[small], Some(slot), DispatchTarget::Buffer(large))
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::DimensionMismatch {
                expected: (8, 4),
                actual: (4, 4)
            }
        ));
    }

    #[test]
    fn test_dispatch_argument_validation() {
        let (backend, slot) = backend_with_params(4, 4);
        let a = backend.create_field(&descriptor(4, 4, Precision::Float32)).unwrap();
        let b = backend.create_field(&descriptor(4, 4, Precision::Float32)).unwrap();
        let target = DispatchTarget::Buffer(b);

        assert!(matches!(
            backend.dispatch_kernel(Kernel::Divergence, &[a], None, target),
            Err(BackendError::MissingParameters(Kernel::Divergence))
        ));
        assert!(matches!(
            backend.dispatch_kernel(Kernel::Advect, &[a], Some(slot), target),
            Err(BackendError::SourceCount { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            backend.dispatch_kernel(Kernel::Divergence, &[a], Some(ParamSlot(99)), target),
            Err(BackendError::UnknownParamSlot(ParamSlot(99)))
        ));
        assert!(matches!(
            backend.dispatch_kernel(Kernel::Divergence, &[BufferHandle(99)], Some(slot), target),
            Err(BackendError::UnknownBuffer(BufferHandle(99)))
        ));
        assert!(matches!(
            backend.dispatch_kernel(Kernel::VisualizeScalar, &[a], Some(slot), target),
            Err(BackendError::InvalidTarget(Kernel::VisualizeScalar))
        ));
        assert!(matches!(
            backend.dispatch_kernel(Kernel::Divergence, &[a], Some(slot), DispatchTarget::Surface),
            Err(BackendError::InvalidTarget(Kernel::Divergence))
        ));
    }

    #[test]
    fn test_unavailable_kernel_leaves_target_untouched() {
        let backend = CpuBackend::builder()
            .unavailable_kernel(Kernel::Divergence)
            .build();
        let slot = backend.create_param_slot().unwrap();
        let a = backend.create_field(&descriptor(2, 2, Precision::Float32)).unwrap();
        let b = backend.create_field(&descriptor(2, 2, Precision::Float32)).unwrap();
        backend.upload_field(b, &[[1.0, 2.0]; 4]).unwrap();

        let err = backend
            .dispatch_kernel(Kernel::Divergence, &[a], Some(slot), DispatchTarget::Buffer(b))
            .unwrap_err();
        assert!(matches!(err, BackendError::PipelineUnavailable(Kernel::Divergence)));
        assert_eq!(backend.read_field(b).unwrap(), vec![[1.0, 2.0]; 4]);
    }

    #[test]
    fn test_float16_fields_round_writes() {
        let (backend, slot) = backend_with_params(2, 1);
        let half = backend.create_field(&descriptor(2, 1, Precision::Float16)).unwrap();
        let single = backend.create_field(&descriptor(2, 1, Precision::Float32)).unwrap();
        let third = 1.0_f32 / 3.0;

        backend.upload_field(half, &[[third, 0.0]; 2]).unwrap();
        backend.upload_field(single, &[[third, 0.0]; 2]).unwrap();
        assert_eq!(backend.read_field(half).unwrap()[0][0], Precision::Float16.quantize(third));
        assert_eq!(backend.read_field(single).unwrap()[0][0], third);

        // A kernel writing into a half-precision field rounds its output too
        let velocity = backend.create_field(&descriptor(2, 1, Precision::Float32)).unwrap();
        let out = backend.create_field(&descriptor(2, 1, Precision::Float16)).unwrap();
        backend
            .dispatch_kernel(
                Kernel::Advect,
                &[velocity, single],
                Some(slot),
                DispatchTarget::Buffer(out),
            )
            .unwrap();
        let expected = Precision::Float16.quantize(0.99 * third);
        assert_eq!(backend.read_field(out).unwrap(), vec![[expected, 0.0]; 2]);
    }

    #[test]
    fn test_upload_length_checked() {
        let backend = CpuBackend::new();
        let a = backend.create_field(&descriptor(2, 2, Precision::Float32)).unwrap();
        assert!(matches!(
            backend.upload_field(a, &[[0.0, 0.0]; 3]),
            Err(BackendError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_surface_lifecycle() {
        let (backend, slot) = backend_with_params(2, 2);
        let density = backend.create_field(&descriptor(2, 2, Precision::Float32)).unwrap();
        backend.upload_field(density, &[[1.0, 0.0]; 4]).unwrap();

        assert!(matches!(backend.present(), Err(BackendError::SurfaceNotConfigured)));
        assert!(matches!(
            backend.dispatch_kernel(Kernel::VisualizeScalar, &[density], Some(slot), DispatchTarget::Surface),
            Err(BackendError::SurfaceNotConfigured)
        ));

        backend.configure_surface(2, 2).unwrap();
        assert_eq!(backend.read_presented().unwrap(), vec![0; 4]);
        backend
            .dispatch_kernel(Kernel::VisualizeScalar, &[density], Some(slot), DispatchTarget::Surface)
            .unwrap();
        // Nothing is visible until present
        assert_eq!(backend.read_presented().unwrap(), vec![0; 4]);
        backend.present().unwrap();
        assert_eq!(backend.read_presented().unwrap(), vec![0xFFFF_FFFF; 4]);
        assert_eq!(backend.frames_presented(), 1);
    }

    #[test]
    fn test_completion_callbacks_run_in_order() {
        let backend = CpuBackend::builder()
            .completion_latency(Duration::from_millis(2))
            .build();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            backend.on_frame_complete(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        let received: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_latency_delays_completion() {
        let backend = CpuBackend::builder()
            .completion_latency(Duration::from_millis(20))
            .build();
        let done = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let counter = Arc::clone(&done);
        backend.on_frame_complete(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        drop(backend); // joins the notifier, which runs the pending callback
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_destroyed_buffer_is_unknown() {
        let backend = CpuBackend::new();
        let a = backend.create_field(&descriptor(2, 2, Precision::Float32)).unwrap();
        backend.destroy_field(a);
        assert!(matches!(backend.read_field(a), Err(BackendError::UnknownBuffer(_))));
        // Destroying twice is harmless
        backend.destroy_field(a);
    }
}

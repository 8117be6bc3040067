//! Compute backends
//!
//! A [`ComputeBackend`] owns the device-side storage of every field buffer and
//! parameter block and executes kernels over them. Two implementations exist:
//!
//! - [`CpuBackend`]: single-threaded reference implementation, always available
//! - `GpuBackend`: wgpu compute shaders (requires the `gpu` feature)
//!
//! # Feature Flags
//!
//! - `gpu` (default): Enables the wgpu backend. Disable with `--no-default-features`
//!   for environments without GPU access.
//!
//! # Backend Selection
//!
//! [`create_backend`] with [`BackendPreference::Auto`] picks the best available backend:
//! 1. Try GPU (if `gpu` feature enabled and hardware available)
//! 2. Fall back to CPU (always available)

mod context;
mod cpu;

#[cfg(feature = "gpu")]
mod gpu;

pub use context::GpuInitResult;
pub use cpu::{CpuBackend, CpuBackendBuilder};

#[cfg(feature = "gpu")]
pub use context::GpuContext;
#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;

use std::sync::Arc;

use crate::config::BackendPreference;
use crate::error::BackendError;
use crate::field::FieldDescriptor;
use crate::params::ParameterBlock;
use crate::stages::Kernel;
use tracing::info;

#[cfg(feature = "gpu")]
use tracing::warn;

/// Opaque handle to a field buffer owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a parameter block owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamSlot(pub u32);

/// Where a dispatch writes its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchTarget {
    /// A field buffer (never one of the dispatch's sources)
    Buffer(BufferHandle),
    /// The presentation surface (RGBA8, one `u32` per cell)
    Surface,
}

/// Callback run once all work submitted before it has completed
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Device abstraction the frame scheduler drives
///
/// Dispatches are enqueued in call order and executed in that order.
/// Completion is reported asynchronously through [`ComputeBackend::on_frame_complete`],
/// on a thread owned by the backend.
pub trait ComputeBackend: Send + Sync {
    /// Allocate a zero-initialised field buffer.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot hold the buffer.
    fn create_field(&self, descriptor: &FieldDescriptor) -> Result<BufferHandle, BackendError>;

    /// Release a field buffer. Unknown handles are ignored.
    fn destroy_field(&self, handle: BufferHandle);

    /// Allocate a zeroed parameter block.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot allocate the uniform buffer.
    fn create_param_slot(&self) -> Result<ParamSlot, BackendError>;

    /// Overwrite a parameter block. Takes effect for dispatches enqueued afterwards.
    ///
    /// # Errors
    ///
    /// [`BackendError::UnknownParamSlot`] for a slot this backend did not create.
    fn write_params(&self, slot: ParamSlot, block: &ParameterBlock) -> Result<(), BackendError>;

    /// (Re)create the presentation surface at grid resolution.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot allocate the surface.
    fn configure_surface(&self, width: u32, height: u32) -> Result<(), BackendError>;

    /// Enqueue one kernel pass.
    ///
    /// # Errors
    ///
    /// Unknown handles, aliasing between destination and sources, size
    /// mismatches and pipeline creation failures are reported here; nothing is
    /// written in those cases.
    fn dispatch_kernel(
        &self,
        kernel: Kernel,
        sources: &[BufferHandle],
        params: Option<ParamSlot>,
        target: DispatchTarget,
    ) -> Result<(), BackendError>;

    /// Finish the frame: submit pending work and publish the surface.
    ///
    /// # Errors
    ///
    /// [`BackendError::SurfaceNotConfigured`] before `configure_surface`.
    fn present(&self) -> Result<(), BackendError>;

    /// Run `callback` once all work presented so far has completed.
    fn on_frame_complete(&self, callback: CompletionCallback);

    /// Replace the contents of a field buffer.
    ///
    /// # Errors
    ///
    /// Unknown handle or a data length that does not match the buffer.
    fn upload_field(&self, handle: BufferHandle, data: &[[f32; 2]]) -> Result<(), BackendError>;

    /// Copy a field buffer back to the host (waits for pending work).
    ///
    /// # Errors
    ///
    /// Unknown handle or a failed device readback.
    fn read_field(&self, handle: BufferHandle) -> Result<Vec<[f32; 2]>, BackendError>;

    /// Copy the last presented surface back to the host.
    ///
    /// # Errors
    ///
    /// [`BackendError::SurfaceNotConfigured`] before `configure_surface`.
    fn read_presented(&self) -> Result<Vec<u32>, BackendError>;

    /// Human-readable backend name for logging
    fn name(&self) -> &str;

    /// `true` for the GPU backend
    fn is_gpu(&self) -> bool;
}

/// Create a compute backend according to `preference`.
///
/// With [`BackendPreference::Auto`] this tries the GPU first and falls back to
/// the CPU reference backend, logging the reason.
///
/// # Errors
///
/// Only [`BackendPreference::Gpu`] can fail: [`BackendError::NoAdapter`] when
/// no adapter exists (or the `gpu` feature is disabled) and
/// [`BackendError::DeviceCreation`] when the adapter refuses a device.
pub fn create_backend(
    preference: BackendPreference,
) -> Result<Arc<dyn ComputeBackend>, BackendError> {
    match preference {
        BackendPreference::Cpu => {
            info!("Using CPU backend (requested)");
            Ok(Arc::new(CpuBackend::new()))
        }
        BackendPreference::Gpu => create_gpu_backend(),
        BackendPreference::Auto => match create_gpu_backend() {
            Ok(backend) => Ok(backend),
            #[cfg(feature = "gpu")]
            Err(BackendError::DeviceCreation { adapter, message }) => {
                warn!(
                    "GPU '{}' found but failed to initialize: {}. Falling back to CPU.",
                    adapter, message
                );
                Ok(Arc::new(CpuBackend::new()))
            }
            Err(_) => {
                info!("No GPU available, using CPU backend");
                Ok(Arc::new(CpuBackend::new()))
            }
        },
    }
}

#[cfg(feature = "gpu")]
fn create_gpu_backend() -> Result<Arc<dyn ComputeBackend>, BackendError> {
    match GpuContext::new() {
        GpuInitResult::Success(context) => {
            info!("Using GPU backend: {}", context.adapter_name());
            Ok(Arc::new(GpuBackend::new(context)))
        }
        GpuInitResult::NoGpuFound => Err(BackendError::NoAdapter),
        GpuInitResult::InitFailed {
            adapter_name,
            error,
        } => Err(BackendError::DeviceCreation {
            adapter: adapter_name,
            message: error,
        }),
    }
}

#[cfg(not(feature = "gpu"))]
fn create_gpu_backend() -> Result<Arc<dyn ComputeBackend>, BackendError> {
    info!("GPU feature disabled");
    Err(BackendError::NoAdapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference_always_succeeds() {
        let backend = create_backend(BackendPreference::Cpu).unwrap();
        assert!(!backend.is_gpu());
        assert_eq!(backend.name(), "cpu-reference");
    }

    #[test]
    fn test_auto_preference_never_fails() {
        // Which backend is chosen depends on the machine
        let backend = create_backend(BackendPreference::Auto).unwrap();
        assert!(!backend.name().is_empty());
    }
}

//! GPU context and initialization
//!
//! This module handles GPU device initialization and capability detection.
//! It distinguishes between "no GPU found" (expected on some systems) and
//! "GPU found but failed to initialize" (potential driver issue).

/// Result of GPU initialization attempt
///
/// - `NoGpuFound`: No compatible GPU adapter (silent fallback to CPU)
/// - `InitFailed`: GPU found but initialization failed (log warning)
#[derive(Debug)]
pub enum GpuInitResult {
    /// GPU initialized successfully
    #[cfg(feature = "gpu")]
    Success(GpuContext),
    /// No GPU adapter found (silent fallback to CPU)
    NoGpuFound,
    /// GPU found but initialization failed (log warning, fallback to CPU)
    InitFailed {
        /// Name of the adapter that failed
        adapter_name: String,
        /// Error message
        error: String,
    },
}

#[cfg(feature = "gpu")]
mod gpu_impl {
    use std::sync::Arc;

    use super::GpuInitResult;
    use tracing::{debug, info};

    /// Bytes per cell of one field buffer (two `f32` components)
    const CELL_BYTES: u64 = 8;

    /// Device, queue and adapter information for one GPU
    ///
    /// The device is reference-counted so the backend's completion poller
    /// thread can wait on submissions while the main thread records new ones.
    #[derive(Debug)]
    pub struct GpuContext {
        device: Arc<wgpu::Device>,
        queue: wgpu::Queue,
        adapter_info: wgpu::AdapterInfo,
    }

    impl GpuContext {
        /// Initialize GPU context
        ///
        /// # Returns
        ///
        /// - `GpuInitResult::Success` - GPU ready to use
        /// - `GpuInitResult::NoGpuFound` - No compatible GPU adapter
        /// - `GpuInitResult::InitFailed` - GPU found but initialization failed
        #[allow(clippy::new_ret_no_self)]
        pub fn new() -> GpuInitResult {
            info!("Attempting to initialize GPU context");

            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });

            let adapter = if let Some(a) =
                pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })) {
                debug!("Found GPU adapter: {}", a.get_info().name);
                a
            } else {
                debug!("No GPU adapter found");
                return GpuInitResult::NoGpuFound;
            };

            let adapter_info = adapter.get_info();
            let adapter_name = adapter_info.name.clone();

            match pollster::block_on(adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("FluidSim GPU"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )) {
                Ok((device, queue)) => {
                    info!("GPU context initialized successfully: {}", adapter_name);
                    GpuInitResult::Success(Self {
                        device: Arc::new(device),
                        queue,
                        adapter_info,
                    })
                }
                Err(e) => {
                    debug!("Failed to create GPU device: {}", e);
                    GpuInitResult::InitFailed {
                        adapter_name,
                        error: e.to_string(),
                    }
                }
            }
        }

        /// Adapter name for logging (e.g. "NVIDIA `GeForce` GTX 1660")
        #[must_use]
        pub fn adapter_name(&self) -> &str {
            &self.adapter_info.name
        }

        /// Check whether one field buffer of a grid this size fits the
        /// device's buffer and storage-binding limits
        #[must_use]
        pub fn can_allocate(&self, width: u32, height: u32) -> bool {
            let bytes = u64::from(width) * u64::from(height) * CELL_BYTES;
            let limits = self.device.limits();
            bytes > 0
                && bytes <= u64::from(limits.max_storage_buffer_binding_size)
                && bytes <= limits.max_buffer_size
        }

        /// Reference to the wgpu device
        #[must_use]
        pub fn device(&self) -> &wgpu::Device {
            &self.device
        }

        /// Shared handle to the device
        #[must_use]
        pub fn shared_device(&self) -> Arc<wgpu::Device> {
            Arc::clone(&self.device)
        }

        /// Reference to the wgpu queue
        #[must_use]
        pub fn queue(&self) -> &wgpu::Queue {
            &self.queue
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_gpu_init_returns_valid_result() {
            // Which variant comes back depends on the hardware
            match GpuContext::new() {
                GpuInitResult::Success(ctx) => {
                    assert!(ctx.device().limits().max_buffer_size > 0);
                    let _ = ctx.adapter_name();
                }
                GpuInitResult::NoGpuFound => {}
                GpuInitResult::InitFailed { error, .. } => {
                    assert!(!error.is_empty());
                }
            }
        }

        #[test]
        fn test_can_allocate() {
            if let GpuInitResult::Success(ctx) = GpuContext::new() {
                assert!(ctx.can_allocate(256, 256));
                assert!(!ctx.can_allocate(65_536, 65_536));
            }
        }
    }
}

#[cfg(feature = "gpu")]
pub use gpu_impl::GpuContext;

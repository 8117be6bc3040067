use std::ptr;
use std::sync::Mutex;

use fluid_sim_core::{
    create_backend, BackendPreference, FluidSimulation, Precision, SimulationConfig,
};
use tracing::info;

use crate::error::{DefaultFluidSimError, FluidSimErrorCode};
use crate::helpers::{track_error, track_result};

/// Backend selection for `fluid_sim_new`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluidSimBackend {
    /// GPU when available, otherwise the CPU reference backend.
    Auto = 0,
    /// GPU only; creation fails with `BackendUnavailable` without an adapter.
    Gpu = 1,
    /// Single-threaded CPU reference backend.
    Cpu = 2,
}

/// Storage precision of the simulation fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluidSimPrecision {
    /// 16-bit float per component (default).
    Half = 0,
    /// 32-bit float per component.
    Full = 1,
}

/// C-compatible subset of the simulation configuration.
///
/// Obtain defaults with `fluid_sim_default_config` and override fields as needed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FluidSimConfig {
    /// Jacobi iterations per frame.
    pub pressure_iterations: u32,
    /// Frames allowed in flight at once (also the parameter ring size).
    pub max_in_flight: u32,
    /// Screen pixels per grid cell.
    pub screen_scale_adjustment: f32,
    /// Injection radius in screen pixels.
    pub ink_radius: f32,
    /// Dye added per pointer per frame at the pointer center.
    pub impulse_scalar: f32,
    /// Multiplicative decay applied during advection.
    pub dissipation: f32,
    /// Vorticity confinement strength.
    pub vorticity_strength: f32,
    /// Field storage precision.
    pub precision: FluidSimPrecision,
    /// Compute backend selection.
    pub backend: FluidSimBackend,
    /// Emit dye from the bottom center until the first touch.
    pub idle_emitter: bool,
}

impl From<&SimulationConfig> for FluidSimConfig {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            pressure_iterations: config.pressure_iterations,
            max_in_flight: config.max_in_flight as u32,
            screen_scale_adjustment: config.screen_scale_adjustment,
            ink_radius: config.ink_radius,
            impulse_scalar: config.impulse_scalar,
            dissipation: config.dissipation,
            vorticity_strength: config.vorticity_strength,
            precision: match config.precision {
                Precision::Float16 => FluidSimPrecision::Half,
                Precision::Float32 => FluidSimPrecision::Full,
            },
            backend: match config.backend {
                BackendPreference::Auto => FluidSimBackend::Auto,
                BackendPreference::Gpu => FluidSimBackend::Gpu,
                BackendPreference::Cpu => FluidSimBackend::Cpu,
            },
            idle_emitter: config.idle_emitter,
        }
    }
}

impl FluidSimConfig {
    fn to_simulation_config(self) -> SimulationConfig {
        let max_in_flight = self.max_in_flight as usize;
        SimulationConfig {
            pressure_iterations: self.pressure_iterations,
            max_in_flight,
            ring_size: max_in_flight,
            screen_scale_adjustment: self.screen_scale_adjustment,
            ink_radius: self.ink_radius,
            impulse_scalar: self.impulse_scalar,
            dissipation: self.dissipation,
            vorticity_strength: self.vorticity_strength,
            precision: match self.precision {
                FluidSimPrecision::Half => Precision::Float16,
                FluidSimPrecision::Full => Precision::Float32,
            },
            backend: match self.backend {
                FluidSimBackend::Auto => BackendPreference::Auto,
                FluidSimBackend::Gpu => BackendPreference::Gpu,
                FluidSimBackend::Cpu => BackendPreference::Cpu,
            },
            idle_emitter: self.idle_emitter,
            ..SimulationConfig::default()
        }
    }
}

/// Default configuration.
#[no_mangle]
pub extern "C" fn fluid_sim_default_config() -> FluidSimConfig {
    FluidSimConfig::from(&SimulationConfig::default())
}

/// The fluid simulation context.
///
/// # Thread Safety
/// The simulation sits behind a `Mutex`, so every function may be called from
/// any thread. `fluid_sim_render_frame` blocks while the maximum number of
/// frames is in flight; other calls on the same instance wait for it.
pub struct FluidSimInstance {
    pub(crate) sim: Mutex<FluidSimulation>,
}

impl FluidSimInstance {
    /// Build an instance for a screen of `screen_width` x `screen_height` pixels.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a zero-sized screen, `InvalidConfig` when the
    /// configuration fails validation, `BackendUnavailable` when the requested
    /// backend cannot be created and `BackendFailure` when allocation fails.
    pub(crate) fn new(
        screen_width: u32,
        screen_height: u32,
        config: SimulationConfig,
    ) -> Result<Box<Self>, DefaultFluidSimError> {
        if screen_width == 0 || screen_height == 0 {
            return Err(DefaultFluidSimError::invalid_parameter(format!(
                "Screen size must be positive, got {screen_width}x{screen_height}"
            )));
        }

        let backend = create_backend(config.backend)?;
        info!("Creating FFI fluid simulation on {}", backend.name());
        let sim = FluidSimulation::new(backend, config, screen_width, screen_height)?;

        Ok(Box::new(Self {
            sim: Mutex::new(sim),
        }))
    }
}

/// Create a new fluid simulation and return it via out-parameter.
///
/// - Returns `FluidSimErrorCode::Ok` (0) on success with a valid instance in `out_instance`
/// - Returns a non-zero error code on failure with `out_instance` set to null
///
/// Parameters
/// - `screen_width`, `screen_height`: drawable size in pixels
/// - `config`: optional configuration; null selects `fluid_sim_default_config()`
/// - `out_instance`: receives the created instance; must be non-null
///
/// Call `fluid_sim_get_last_error()` for a description of a failure.
///
/// # Safety
///
/// - `out_instance` must be a valid, non-null pointer to writable memory.
/// - `config` must be null or point to a valid `FluidSimConfig`.
/// - The caller owns the returned instance and MUST call `fluid_sim_destroy`
///   exactly once.
///
/// Example (C)
/// ```c
/// FluidSimConfig config = fluid_sim_default_config();
/// config.backend = Cpu;
/// FluidSimInstance* sim = NULL;
/// if (fluid_sim_new(640, 480, &config, &sim) != Ok) {
///     fprintf(stderr, "Failed to create simulation: %s\n", fluid_sim_get_last_error());
///     return;
/// }
/// fluid_sim_render_frame(sim, NULL);
/// fluid_sim_destroy(sim);
/// ```
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_new(
    screen_width: u32,
    screen_height: u32,
    config: *const FluidSimConfig,
    out_instance: *mut *mut FluidSimInstance,
) -> FluidSimErrorCode {
    if out_instance.is_null() {
        return track_error(&DefaultFluidSimError::null_pointer("out_instance"));
    }

    // SAFETY: caller guarantees `config` is null or valid
    let config = unsafe { config.as_ref() }
        .copied()
        .unwrap_or_else(|| fluid_sim_default_config())
        .to_simulation_config();

    match track_result(FluidSimInstance::new(screen_width, screen_height, config)) {
        Ok(instance) => {
            unsafe {
                *out_instance = Box::into_raw(instance);
            }
            FluidSimErrorCode::Ok
        }
        Err(code) => {
            unsafe {
                *out_instance = ptr::null_mut();
            }
            code
        }
    }
}

/// Destroy an instance previously created by `fluid_sim_new`.
///
/// Waits for in-flight frames before releasing GPU resources. A null `ptr`
/// is a no-op.
///
/// # Safety
/// - The pointer MUST have been created by `fluid_sim_new` and not freed already.
/// - The caller must not use the pointer afterwards.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_destroy(ptr: *mut FluidSimInstance) {
    if ptr.is_null() {
        return;
    }

    // SAFETY: the pointer came from `Box::into_raw` in `fluid_sim_new`
    unsafe {
        drop(Box::from_raw(ptr));
    }
}

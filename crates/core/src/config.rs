//! Simulation configuration
//!
//! [`SimulationConfig`] gathers every tunable of the pipeline. It is
//! serde-serializable so hosts can load it from a file; missing keys fall
//! back to the defaults below.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::SimulationError;

/// Storage precision of field values.
///
/// Both precisions keep two `f32` components per cell in memory. `Float16`
/// rounds every value a kernel writes to the nearest half-precision value,
/// which reproduces the behaviour of two-channel half-float textures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// IEEE 754 half precision
    #[default]
    Float16,
    /// IEEE 754 single precision
    Float32,
}

impl Precision {
    /// Round a value to this precision.
    #[inline]
    #[must_use]
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            Self::Float16 => f16::from_f32(value).to_f32(),
            Self::Float32 => value,
        }
    }

    /// Bytes per component the original texture format would use.
    #[must_use]
    pub const fn component_bytes(self) -> usize {
        match self {
            Self::Float16 => 2,
            Self::Float32 => 4,
        }
    }
}

/// Which compute backend to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// GPU when available, CPU otherwise
    #[default]
    Auto,
    /// GPU only; failing to initialise one is an error
    Gpu,
    /// Single-threaded CPU reference backend
    Cpu,
}

/// Tunables for a [`FluidSimulation`](crate::FluidSimulation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Jacobi relaxation passes per frame (fixed budget, 0 skips relaxation)
    pub pressure_iterations: u32,
    /// Maximum number of frames submitted but not yet completed
    pub max_in_flight: usize,
    /// Number of parameter blocks in the ring (must be >= `max_in_flight`)
    pub ring_size: usize,
    /// Screen pixels per grid cell
    pub screen_scale_adjustment: f32,
    /// Injection radius in screen pixels
    pub ink_radius: f32,
    /// Dye added to the density field per injection
    pub impulse_scalar: f32,
    /// Advection and confinement time step
    pub time_step: f32,
    /// Multiplier applied by advection each frame
    pub dissipation: f32,
    /// Vorticity confinement strength
    pub vorticity_strength: f32,
    /// Grid spacing used by the pressure solve
    pub cell_size: f32,
    /// Gain applied before colour mapping
    pub visualize_scale: f32,
    /// Field storage precision
    pub precision: Precision,
    /// Emit an upward jet from the bottom centre until the first touch
    pub idle_emitter: bool,
    /// Backend to construct with [`create_backend`](crate::backend::create_backend)
    pub backend: BackendPreference,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            pressure_iterations: 40,
            max_in_flight: 3,
            ring_size: 3,
            screen_scale_adjustment: 1.0,
            ink_radius: 150.0,
            impulse_scalar: 0.8,
            time_step: 1.0,
            dissipation: 0.99,
            vorticity_strength: 0.35,
            cell_size: 1.0,
            visualize_scale: 1.0,
            precision: Precision::Float16,
            idle_emitter: false,
            backend: BackendPreference::Auto,
        }
    }
}

impl SimulationConfig {
    /// Check every field for a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SimulationError> {
        fn invalid(message: impl Into<String>) -> Result<(), SimulationError> {
            Err(SimulationError::InvalidConfig(message.into()))
        }

        if self.max_in_flight == 0 {
            return invalid("max_in_flight must be at least 1");
        }
        if self.ring_size < self.max_in_flight {
            return invalid(format!(
                "ring_size ({}) must be >= max_in_flight ({})",
                self.ring_size, self.max_in_flight
            ));
        }
        if !(self.screen_scale_adjustment.is_finite() && self.screen_scale_adjustment > 0.0) {
            return invalid("screen_scale_adjustment must be positive and finite");
        }
        if !(self.ink_radius.is_finite() && self.ink_radius > 0.0) {
            return invalid("ink_radius must be positive and finite");
        }
        if !(self.dissipation.is_finite() && (0.0..=1.0).contains(&self.dissipation)) {
            return invalid("dissipation must lie in [0, 1]");
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return invalid("cell_size must be positive and finite");
        }
        for (name, value) in [
            ("impulse_scalar", self.impulse_scalar),
            ("time_step", self.time_step),
            ("vorticity_strength", self.vorticity_strength),
            ("visualize_scale", self.visualize_scale),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be non-negative and finite"));
            }
        }
        Ok(())
    }

    /// Grid dimensions for a screen of the given size in pixels.
    ///
    /// Each dimension is at least one cell.
    #[must_use]
    pub fn grid_dimensions(&self, screen_width: u32, screen_height: u32) -> (u32, u32) {
        let scale = self.screen_scale_adjustment;
        let width = (screen_width as f32 / scale).floor() as u32;
        let height = (screen_height as f32 / scale).floor() as u32;
        (width.max(1), height.max(1))
    }

    /// Injection radius in grid cells.
    #[must_use]
    pub fn ink_radius_cells(&self) -> f32 {
        self.ink_radius / self.screen_scale_adjustment
    }
}

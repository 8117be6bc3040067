//! Error types for the fluid simulation
//!
//! Backend failures are reported through [`BackendError`]; everything the
//! frame scheduler can refuse at construction time is a [`SimulationError`].
//! Stage-level failures during a frame are not propagated as errors: the
//! scheduler logs them and skips the rest of that frame.

use crate::backend::{BufferHandle, ParamSlot};
use crate::stages::Kernel;
use thiserror::Error;

/// Errors raised by a [`ComputeBackend`](crate::backend::ComputeBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// No compatible GPU adapter was found.
    #[error("no compatible GPU adapter found")]
    NoAdapter,

    /// An adapter was found but the device could not be created.
    #[error("failed to create device on adapter '{adapter}': {message}")]
    DeviceCreation {
        /// Name of the adapter that failed
        adapter: String,
        /// Driver error message
        message: String,
    },

    /// The compute pipeline for a kernel could not be created.
    #[error("compute pipeline unavailable for kernel {0}")]
    PipelineUnavailable(Kernel),

    /// A kernel was dispatched without the parameter block it reads.
    #[error("kernel {0} requires a parameter slot")]
    MissingParameters(Kernel),

    /// A kernel was dispatched with the wrong number of source buffers.
    #[error("kernel {kernel} expects {expected} source buffer(s), got {actual}")]
    SourceCount {
        /// Kernel being dispatched
        kernel: Kernel,
        /// Number of sources the kernel reads
        expected: usize,
        /// Number of sources supplied
        actual: usize,
    },

    /// A surface kernel was aimed at a buffer or a field kernel at the surface.
    #[error("kernel {0} cannot write to that target")]
    InvalidTarget(Kernel),

    /// The handle does not name a live buffer on this backend.
    #[error("unknown buffer handle {0:?}")]
    UnknownBuffer(BufferHandle),

    /// The slot does not name a parameter block on this backend.
    #[error("unknown parameter slot {0:?}")]
    UnknownParamSlot(ParamSlot),

    /// The destination of a dispatch is also one of its sources.
    #[error("kernel {kernel} would read and write buffer {buffer:?} in the same pass")]
    Aliasing {
        /// Kernel being dispatched
        kernel: Kernel,
        /// Buffer bound as both source and destination
        buffer: BufferHandle,
    },

    /// Buffers bound to one dispatch (or an upload) disagree in size.
    #[error("dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        /// Dimensions of the destination
        expected: (u32, u32),
        /// Dimensions of the offending buffer or upload
        actual: (u32, u32),
    },

    /// A visualize kernel or readback ran before `configure_surface`.
    #[error("presentation surface not configured")]
    SurfaceNotConfigured,

    /// The device cannot hold a grid of this size.
    #[error("insufficient device memory for a {width}x{height} grid")]
    InsufficientMemory {
        /// Grid width in cells
        width: u32,
        /// Grid height in cells
        height: u32,
    },

    /// Copying data back from the device failed.
    #[error("readback failed: {0}")]
    Readback(String),

    /// A backend lock was poisoned by a panicking thread.
    #[error("backend state lock poisoned")]
    LockPoisoned,
}

/// Errors returned when constructing or reconfiguring a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A previous resize failed and the simulation holds no fields.
    #[error("simulation has no fields; the last resize failed")]
    NoFields,

    /// The backend refused an operation required to build the simulation.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_messages() {
        let err = BackendError::PipelineUnavailable(Kernel::PressureJacobi);
        assert_eq!(
            err.to_string(),
            "compute pipeline unavailable for kernel pressure_jacobi"
        );

        let err = BackendError::DimensionMismatch {
            expected: (4, 4),
            actual: (2, 8),
        };
        assert!(err.to_string().contains("(4, 4)"));
    }

    #[test]
    fn test_simulation_error_wraps_backend() {
        let err: SimulationError = BackendError::NoAdapter.into();
        assert!(matches!(err, SimulationError::Backend(BackendError::NoAdapter)));
        assert_eq!(err.to_string(), "no compatible GPU adapter found");
    }
}

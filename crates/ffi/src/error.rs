use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr;

use fluid_sim_core::{BackendError, SimulationError};

/// Common interface for FFI error types.
///
/// - `code()` - the error code passed across the FFI boundary
/// - `msg()` - the message stored for `fluid_sim_get_last_error`
pub(crate) trait FluidSimError {
    /// Returns the error code to be returned across the FFI boundary.
    fn code(&self) -> FluidSimErrorCode;

    /// Returns the human-readable error message.
    fn msg(&self) -> &str;
}

/// Default implementation of `FluidSimError` for the FFI layer.
///
/// Wraps a `FluidSimErrorCode` with a message and provides one constructor
/// per failure family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DefaultFluidSimError {
    code: FluidSimErrorCode,
    msg: String,
}

impl DefaultFluidSimError {
    /// Null pointer passed where non-null required.
    ///
    /// # Arguments
    /// * `param_name` - The name of the parameter that was null (e.g., `"out_instance"`)
    pub fn null_pointer(param_name: &str) -> Self {
        Self {
            code: FluidSimErrorCode::NullPointer,
            msg: format!("Parameter '{param_name}' cannot be null"),
        }
    }

    /// Poisoned lock around the simulation.
    pub fn lock_poisoned(lock_name: &str) -> Self {
        Self {
            code: FluidSimErrorCode::LockPoisoned,
            msg: format!("Lock '{lock_name}' was poisoned by a panic in another thread"),
        }
    }

    /// Invalid argument with a custom message.
    pub fn invalid_parameter(message: String) -> Self {
        Self {
            code: FluidSimErrorCode::InvalidParameter,
            msg: message,
        }
    }

    /// Caller-provided buffer cannot hold the result.
    pub fn buffer_too_small(required: usize, capacity: usize) -> Self {
        Self {
            code: FluidSimErrorCode::BufferTooSmall,
            msg: format!("Buffer holds {capacity} elements, {required} required"),
        }
    }
}

impl From<SimulationError> for DefaultFluidSimError {
    fn from(error: SimulationError) -> Self {
        let code = match error {
            SimulationError::Backend(backend) => return Self::from(backend),
            SimulationError::InvalidConfig(_) => FluidSimErrorCode::InvalidConfig,
            SimulationError::NoFields => FluidSimErrorCode::BackendFailure,
        };
        Self {
            code,
            msg: error.to_string(),
        }
    }
}

impl From<BackendError> for DefaultFluidSimError {
    fn from(error: BackendError) -> Self {
        let code = match error {
            BackendError::NoAdapter | BackendError::DeviceCreation { .. } => {
                FluidSimErrorCode::BackendUnavailable
            }
            BackendError::LockPoisoned => FluidSimErrorCode::LockPoisoned,
            _ => FluidSimErrorCode::BackendFailure,
        };
        Self {
            code,
            msg: error.to_string(),
        }
    }
}

impl FluidSimError for DefaultFluidSimError {
    fn code(&self) -> FluidSimErrorCode {
        self.code
    }

    fn msg(&self) -> &str {
        &self.msg
    }
}

/// FFI error codes returned by fluid simulation functions.
/// Follows standard C convention: 0 = success, non-zero = error.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluidSimErrorCode {
    /// Operation completed successfully.
    Ok = 0,

    /// Invalid pointer: null pointer passed where non-null required.
    NullPointer = 1,

    /// Lock poisoned: internal synchronization primitive was poisoned by a panic.
    LockPoisoned = 2,

    /// Invalid parameter passed to function.
    InvalidParameter = 3,

    /// Simulation configuration failed validation.
    InvalidConfig = 4,

    /// No compute backend could be created (GPU requested but absent).
    BackendUnavailable = 5,

    /// The compute backend rejected an operation (allocation, readback, ...).
    BackendFailure = 6,

    /// Output buffer is smaller than the data to copy.
    BufferTooSmall = 7,
}

impl From<DefaultFluidSimError> for FluidSimErrorCode {
    fn from(error: DefaultFluidSimError) -> Self {
        error.code
    }
}

thread_local! {
    /// Most recent FFI error on this thread (C string, error code).
    /// The `CString` is owned here so returned pointers stay valid until the next call.
    static LAST_ERROR: RefCell<(Option<CString>, FluidSimErrorCode)> = const { RefCell::new((None, FluidSimErrorCode::Ok)) };
}

/// Internal helper to read `LAST_ERROR` thread-local storage (cstring, code).
pub(crate) fn with_last_error<F, R>(f: F) -> R
where
    F: FnOnce(&(Option<CString>, FluidSimErrorCode)) -> R,
{
    LAST_ERROR.with_borrow(f)
}

/// Internal helper to mutate `LAST_ERROR` thread-local storage (cstring, code).
pub(crate) fn with_last_error_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut (Option<CString>, FluidSimErrorCode)) -> R,
{
    LAST_ERROR.with_borrow_mut(f)
}

/// Retrieve the most recent FFI error message as a null-terminated C string.
///
/// Returns:
/// - A borrowed pointer to the error message if an error occurred.
/// - `null` if the last call succeeded or the message cannot be converted to a C string.
///
/// # Thread Safety
/// Error messages are stored per-thread, so each thread sees only its own errors.
///
/// # Lifetime
/// The returned pointer is valid until the next FFI call on this thread that
/// sets or clears the error, or until the thread terminates.
///
/// **DO NOT FREE THIS POINTER** - it is managed internally.
///
/// Example:
/// ```c
/// FluidSimInstance* sim = NULL;
/// if (fluid_sim_new(640, 480, NULL, &sim) != Ok) {
///     const char* error = fluid_sim_get_last_error();
///     if (error) {
///         printf("Fluid sim creation failed: %s\n", error);
///     }
/// }
/// ```
#[no_mangle]
pub extern "C" fn fluid_sim_get_last_error() -> *const c_char {
    with_last_error(|(cstring, _code)| cstring.as_ref().map_or(ptr::null(), |cs| cs.as_ptr()))
}

/// Retrieve the most recent FFI error code (`Ok` if the last call succeeded).
#[no_mangle]
pub extern "C" fn fluid_sim_get_last_error_code() -> FluidSimErrorCode {
    with_last_error(|(_cstring, code)| *code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::{clear_last_error, track_error};
    use std::ffi::CStr;

    #[test]
    fn test_last_error_roundtrip() {
        let code = track_error(&DefaultFluidSimError::null_pointer("out_instance"));
        assert_eq!(code, FluidSimErrorCode::NullPointer);
        assert_eq!(fluid_sim_get_last_error_code(), FluidSimErrorCode::NullPointer);

        let message = unsafe { CStr::from_ptr(fluid_sim_get_last_error()) };
        assert_eq!(
            message.to_str().unwrap(),
            "Parameter 'out_instance' cannot be null"
        );

        clear_last_error();
        assert!(fluid_sim_get_last_error().is_null());
        assert_eq!(fluid_sim_get_last_error_code(), FluidSimErrorCode::Ok);
    }

    #[test]
    fn test_backend_errors_map_to_codes() {
        let unavailable = DefaultFluidSimError::from(BackendError::NoAdapter);
        assert_eq!(unavailable.code(), FluidSimErrorCode::BackendUnavailable);

        let config = DefaultFluidSimError::from(SimulationError::InvalidConfig("bad".into()));
        assert_eq!(config.code(), FluidSimErrorCode::InvalidConfig);
        assert!(config.msg().contains("bad"));

        let wrapped = DefaultFluidSimError::from(SimulationError::Backend(
            BackendError::LockPoisoned,
        ));
        assert_eq!(wrapped.code(), FluidSimErrorCode::LockPoisoned);
    }

    #[test]
    fn test_errors_are_thread_local() {
        track_error(&DefaultFluidSimError::invalid_parameter("x".into()));
        let other = std::thread::spawn(|| fluid_sim_get_last_error_code())
            .join()
            .unwrap();
        assert_eq!(other, FluidSimErrorCode::Ok);
    }
}

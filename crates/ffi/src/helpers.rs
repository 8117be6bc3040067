use std::ffi::CString;
use std::sync::MutexGuard;

use fluid_sim_core::FluidSimulation;

use crate::error::{with_last_error_mut, DefaultFluidSimError, FluidSimError, FluidSimErrorCode};
use crate::instance::FluidSimInstance;

/// Set the thread-local error message and code.
pub(crate) fn set_last_error(error: &impl FluidSimError) {
    with_last_error_mut(|(cstring, code)| {
        *cstring = CString::new(error.msg()).ok();
        *code = error.code();
    });
}

/// Record an error in thread-local storage and return its code.
#[inline]
pub(crate) fn track_error(error: &impl FluidSimError) -> FluidSimErrorCode {
    set_last_error(error);
    error.code()
}

/// Clear the thread-local error message and code.
pub(crate) fn clear_last_error() {
    with_last_error_mut(|(cstring, code)| {
        *cstring = None;
        *code = FluidSimErrorCode::Ok;
    });
}

/// Record the error of a failed result, or clear the last error on success.
pub(crate) fn track_result<T>(result: Result<T, DefaultFluidSimError>) -> Result<T, FluidSimErrorCode> {
    match result {
        Ok(value) => {
            clear_last_error();
            Ok(value)
        }
        Err(error) => Err(track_error(&error)),
    }
}

/// Run `f` and collapse its result into an error code.
pub(crate) fn handle_ffi_result_error<F>(f: F) -> FluidSimErrorCode
where
    F: FnOnce() -> Result<(), DefaultFluidSimError>,
{
    match track_result(f()) {
        Ok(()) => FluidSimErrorCode::Ok,
        Err(code) => code,
    }
}

/// Borrow an instance from a raw pointer.
///
/// # Safety
/// `ptr` must be null or point to a live instance created by `fluid_sim_new`.
pub(crate) unsafe fn instance_from_ptr<'a>(
    ptr: *const FluidSimInstance,
) -> Result<&'a FluidSimInstance, DefaultFluidSimError> {
    // SAFETY: non-null pointers come from `Box::into_raw` in `fluid_sim_new`
    unsafe { ptr.as_ref() }.ok_or_else(|| DefaultFluidSimError::null_pointer("ptr"))
}

/// Lock the simulation of an instance.
pub(crate) fn lock_simulation(
    instance: &FluidSimInstance,
) -> Result<MutexGuard<'_, FluidSimulation>, DefaultFluidSimError> {
    instance
        .sim
        .lock()
        .map_err(|_| DefaultFluidSimError::lock_poisoned("simulation"))
}

/// Run `f` with exclusive access to the simulation behind `ptr`.
///
/// # Safety
/// Same contract as [`instance_from_ptr`].
pub(crate) unsafe fn with_simulation<F, T>(
    ptr: *const FluidSimInstance,
    f: F,
) -> Result<T, DefaultFluidSimError>
where
    F: FnOnce(&mut FluidSimulation) -> Result<T, DefaultFluidSimError>,
{
    // SAFETY: forwarded caller contract
    let instance = unsafe { instance_from_ptr(ptr) }?;
    let mut sim = lock_simulation(instance)?;
    f(&mut sim)
}

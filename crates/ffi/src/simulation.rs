use fluid_sim_core::{FrameOutcome, View};

use crate::error::{DefaultFluidSimError, FluidSimErrorCode};
use crate::helpers::{handle_ffi_result_error, track_error, with_simulation};
use crate::instance::FluidSimInstance;

/// Field shown on the presented surface.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluidSimView {
    Density = 0,
    Pressure = 1,
    Velocity = 2,
    Vorticity = 3,
}

impl From<View> for FluidSimView {
    fn from(view: View) -> Self {
        match view {
            View::Density => Self::Density,
            View::Pressure => Self::Pressure,
            View::Velocity => Self::Velocity,
            View::Vorticity => Self::Vorticity,
        }
    }
}

/// Summary of one `fluid_sim_render_frame` call.
/// Keep this layout stable for C/C++/C# consumers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FluidSimFrameReport {
    /// Sequence number of the rendered frame.
    pub frame_index: u64,
    /// Stages dispatched successfully.
    pub stages_executed: u32,
    /// Stages in the frame plan.
    pub stages_planned: u32,
    /// The simulation was paused and nothing was rendered.
    pub paused: bool,
    /// Every planned stage ran.
    pub complete: bool,
}

/// Render one frame, blocking while the in-flight limit is reached.
///
/// Stage failures do not fail the call; they show up as `complete == false`
/// in the report.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by `fluid_sim_new`.
/// - `out_report` must be null or point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_render_frame(
    ptr: *const FluidSimInstance,
    out_report: *mut FluidSimFrameReport,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| {
        let report = unsafe {
            with_simulation(ptr, |sim| {
                Ok(match sim.render_frame() {
                    FrameOutcome::Rendered(report) => FluidSimFrameReport {
                        frame_index: report.frame_index,
                        stages_executed: report.stages_executed as u32,
                        stages_planned: report.stages_planned as u32,
                        paused: false,
                        complete: report.is_complete(),
                    },
                    FrameOutcome::Paused => FluidSimFrameReport {
                        frame_index: sim.frame_index(),
                        paused: true,
                        ..FluidSimFrameReport::default()
                    },
                })
            })
        }?;
        // SAFETY: caller guarantees `out_report` is null or writable
        if let Some(out) = unsafe { out_report.as_mut() } {
            *out = report;
        }
        Ok(())
    })
}

/// Press the single pointer at screen position `(x, y)`.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_pointer_down(
    ptr: *const FluidSimInstance,
    x: f32,
    y: f32,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| {
            sim.pointer_down(x, y);
            Ok(())
        })
    })
}

/// Drag the single pointer to `(x, y)`.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_pointer_move(
    ptr: *const FluidSimInstance,
    x: f32,
    y: f32,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| {
            sim.pointer_move(x, y);
            Ok(())
        })
    })
}

/// Release the single pointer.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_pointer_up(ptr: *const FluidSimInstance) -> FluidSimErrorCode {
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| {
            sim.pointer_up();
            Ok(())
        })
    })
}

/// Begin touch `id` at `(x, y)`. At most five touches are tracked.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_touch_down(
    ptr: *const FluidSimInstance,
    id: u64,
    x: f32,
    y: f32,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| {
            sim.touch_down(id, x, y);
            Ok(())
        })
    })
}

/// Move touch `id` to `(x, y)`.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_touch_move(
    ptr: *const FluidSimInstance,
    id: u64,
    x: f32,
    y: f32,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| {
            sim.touch_move(id, x, y);
            Ok(())
        })
    })
}

/// End touch `id`.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_touch_up(
    ptr: *const FluidSimInstance,
    id: u64,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| {
            sim.touch_up(id);
            Ok(())
        })
    })
}

/// Cycle the displayed field and report the new one.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by `fluid_sim_new`.
/// - `out_view` must be null or point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_advance_view(
    ptr: *const FluidSimInstance,
    out_view: *mut FluidSimView,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| {
        let view = unsafe { with_simulation(ptr, |sim| Ok(sim.advance_view())) }?;
        // SAFETY: caller guarantees `out_view` is null or writable
        if let Some(out) = unsafe { out_view.as_mut() } {
            *out = view.into();
        }
        Ok(())
    })
}

/// Toggle pause and report whether the simulation is now paused.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by `fluid_sim_new`.
/// - `out_paused` must be null or point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_toggle_pause(
    ptr: *const FluidSimInstance,
    out_paused: *mut bool,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| {
        let paused = unsafe { with_simulation(ptr, |sim| Ok(sim.toggle_pause())) }?;
        // SAFETY: caller guarantees `out_paused` is null or writable
        if let Some(out) = unsafe { out_paused.as_mut() } {
            *out = paused;
        }
        Ok(())
    })
}

/// Application focus change. Losing focus cancels all touches and pauses;
/// regaining it resumes.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_set_focus(
    ptr: *const FluidSimInstance,
    focused: bool,
) -> FluidSimErrorCode {
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| {
            if focused {
                sim.focus_gained();
            } else {
                sim.focus_lost();
            }
            Ok(())
        })
    })
}

/// Restart the simulation for a new screen size.
///
/// Waits for in-flight frames; all fields restart from zero.
///
/// # Safety
/// `ptr` must be a valid pointer returned by `fluid_sim_new`.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_resize(
    ptr: *const FluidSimInstance,
    screen_width: u32,
    screen_height: u32,
) -> FluidSimErrorCode {
    if screen_width == 0 || screen_height == 0 {
        return track_error(&DefaultFluidSimError::invalid_parameter(format!(
            "Screen size must be positive, got {screen_width}x{screen_height}"
        )));
    }
    handle_ffi_result_error(|| unsafe {
        with_simulation(ptr, |sim| Ok(sim.resize(screen_width, screen_height)?))
    })
}

/// Size of the presented surface in pixels (one pixel per grid cell).
///
/// # Safety
/// - `ptr` must be a valid pointer returned by `fluid_sim_new`.
/// - `out_width` and `out_height` must be non-null and writable.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_surface_size(
    ptr: *const FluidSimInstance,
    out_width: *mut u32,
    out_height: *mut u32,
) -> FluidSimErrorCode {
    if out_width.is_null() {
        return track_error(&DefaultFluidSimError::null_pointer("out_width"));
    }
    if out_height.is_null() {
        return track_error(&DefaultFluidSimError::null_pointer("out_height"));
    }
    handle_ffi_result_error(|| {
        let (width, height) = unsafe { with_simulation(ptr, |sim| Ok(sim.grid_size())) }?;
        // SAFETY: checked non-null above
        unsafe {
            *out_width = width;
            *out_height = height;
        }
        Ok(())
    })
}

/// Copy the most recently presented surface as packed RGBA8 (`u32` per pixel,
/// little-endian R, G, B, A), row-major.
///
/// Returns `BufferTooSmall` when `capacity` is less than the pixel count; use
/// `fluid_sim_surface_size` to size the buffer.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by `fluid_sim_new`.
/// - `out_pixels` must be non-null and writable for `capacity` elements.
#[no_mangle]
pub unsafe extern "C" fn fluid_sim_copy_surface(
    ptr: *const FluidSimInstance,
    out_pixels: *mut u32,
    capacity: usize,
) -> FluidSimErrorCode {
    if out_pixels.is_null() {
        return track_error(&DefaultFluidSimError::null_pointer("out_pixels"));
    }
    handle_ffi_result_error(|| {
        let pixels = unsafe { with_simulation(ptr, |sim| Ok(sim.read_presented()?)) }?;
        if pixels.len() > capacity {
            return Err(DefaultFluidSimError::buffer_too_small(pixels.len(), capacity));
        }
        // SAFETY: caller guarantees `capacity` writable elements
        let out = unsafe { std::slice::from_raw_parts_mut(out_pixels, pixels.len()) };
        out.copy_from_slice(&pixels);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{
        fluid_sim_default_config, fluid_sim_destroy, fluid_sim_new, FluidSimBackend,
        FluidSimConfig, FluidSimPrecision,
    };
    use std::ptr;

    struct Guard(*mut FluidSimInstance);

    impl Drop for Guard {
        fn drop(&mut self) {
            unsafe { fluid_sim_destroy(self.0) };
        }
    }

    fn create(width: u32, height: u32) -> Guard {
        let config = FluidSimConfig {
            backend: FluidSimBackend::Cpu,
            precision: FluidSimPrecision::Full,
            pressure_iterations: 4,
            ink_radius: 4.0,
            ..fluid_sim_default_config()
        };
        let mut sim: *mut FluidSimInstance = ptr::null_mut();
        let code = unsafe { fluid_sim_new(width, height, &config, &mut sim) };
        assert_eq!(code, FluidSimErrorCode::Ok);
        Guard(sim)
    }

    #[test]
    fn test_render_frame_reports() {
        let sim = create(32, 24);
        let mut report = FluidSimFrameReport::default();
        unsafe {
            assert_eq!(fluid_sim_pointer_down(sim.0, 10.0, 10.0), FluidSimErrorCode::Ok);
            assert_eq!(fluid_sim_render_frame(sim.0, &mut report), FluidSimErrorCode::Ok);
        }
        assert!(report.complete);
        assert!(!report.paused);
        assert_eq!(report.frame_index, 0);
        assert_eq!(report.stages_executed, report.stages_planned);
    }

    #[test]
    fn test_pause_reported() {
        let sim = create(16, 16);
        let mut paused = false;
        let mut report = FluidSimFrameReport::default();
        unsafe {
            fluid_sim_toggle_pause(sim.0, &mut paused);
            assert!(paused);
            fluid_sim_render_frame(sim.0, &mut report);
        }
        assert!(report.paused);
    }

    #[test]
    fn test_copy_surface_checks_capacity() {
        let sim = create(20, 10);
        let (mut width, mut height) = (0, 0);
        unsafe {
            fluid_sim_surface_size(sim.0, &mut width, &mut height);
            fluid_sim_render_frame(sim.0, ptr::null_mut());
        }
        assert_eq!((width, height), (20, 10));

        let mut small = vec![0u32; 10];
        let code = unsafe { fluid_sim_copy_surface(sim.0, small.as_mut_ptr(), small.len()) };
        assert_eq!(code, FluidSimErrorCode::BufferTooSmall);

        let mut pixels = vec![0u32; 200];
        let code = unsafe { fluid_sim_copy_surface(sim.0, pixels.as_mut_ptr(), pixels.len()) };
        assert_eq!(code, FluidSimErrorCode::Ok);
        assert!(pixels.iter().all(|px| px >> 24 == 0xFF));
    }

    #[test]
    fn test_advance_view_cycles() {
        let sim = create(16, 16);
        let mut view = FluidSimView::Density;
        unsafe { fluid_sim_advance_view(sim.0, &mut view) };
        assert_eq!(view, FluidSimView::from(View::Density.next()));
    }

    #[test]
    fn test_resize_changes_surface() {
        let sim = create(16, 16);
        let (mut width, mut height) = (0, 0);
        unsafe {
            assert_eq!(fluid_sim_resize(sim.0, 40, 8), FluidSimErrorCode::Ok);
            assert_eq!(fluid_sim_resize(sim.0, 0, 8), FluidSimErrorCode::InvalidParameter);
            fluid_sim_surface_size(sim.0, &mut width, &mut height);
        }
        assert_eq!((width, height), (40, 8));
    }

    #[test]
    fn test_null_instance_rejected() {
        let code = unsafe { fluid_sim_pointer_up(ptr::null()) };
        assert_eq!(code, FluidSimErrorCode::NullPointer);
    }
}

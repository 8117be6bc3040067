//! C ABI for the fluid simulation
//!
//! Exposes an opaque `FluidSimInstance` driven through `extern "C"` functions.
//! Every fallible function returns a `FluidSimErrorCode` (0 = success) and
//! records a human-readable message retrievable with
//! `fluid_sim_get_last_error` on the calling thread. The C header
//! (`FluidSimFFI.h`) is generated by `cbindgen` at build time.
//!
//! Typical host loop:
//!
//! ```c
//! FluidSimInstance* sim = NULL;
//! fluid_sim_new(width, height, NULL, &sim);
//! while (running) {
//!     fluid_sim_pointer_move(sim, x, y);
//!     fluid_sim_render_frame(sim, NULL);
//!     fluid_sim_copy_surface(sim, pixels, pixel_capacity);
//! }
//! fluid_sim_destroy(sim);
//! ```

mod error;
mod helpers;
mod instance;
mod simulation;

pub use error::{fluid_sim_get_last_error, fluid_sim_get_last_error_code, FluidSimErrorCode};
pub use instance::{
    fluid_sim_default_config, fluid_sim_destroy, fluid_sim_new, FluidSimBackend, FluidSimConfig,
    FluidSimInstance, FluidSimPrecision,
};
pub use simulation::{
    fluid_sim_advance_view, fluid_sim_copy_surface, fluid_sim_pointer_down,
    fluid_sim_pointer_move, fluid_sim_pointer_up, fluid_sim_render_frame, fluid_sim_resize,
    fluid_sim_set_focus, fluid_sim_surface_size, fluid_sim_toggle_pause, fluid_sim_touch_down,
    fluid_sim_touch_move, fluid_sim_touch_up, FluidSimFrameReport, FluidSimView,
};

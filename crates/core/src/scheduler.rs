//! Frame scheduler
//!
//! [`FluidSimulation`] owns the fields, the parameter ring, the interaction
//! tracker and the in-flight limiter, and drives one frame per
//! [`FluidSimulation::render_frame`] call:
//!
//! 1. acquire a frame slot (blocks while `max_in_flight` frames are outstanding)
//! 2. sample the interaction tracker
//! 3. write the sample into the next parameter block
//! 4. dispatch the frame plan, stopping at the first failing stage
//! 5. present and hand the slot to the completion callback
//! 6. roll the tracker

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::ComputeBackend;
use crate::config::SimulationConfig;
use crate::core_types::Vec2;
use crate::error::{BackendError, SimulationError};
use crate::field::{FieldKind, FluidFields};
use crate::interaction::InteractionTracker;
use crate::limiter::FrameLimiter;
use crate::params::{ParameterBlock, ParameterRing};
use crate::stages::{apply_stage, FramePlan, Kernel, View};

/// Summary of one rendered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    /// Sequence number, starting at 0
    pub frame_index: u64,
    /// Parameter ring index used by this frame
    pub slot: usize,
    /// `false` when the interaction sample was rejected or failed to upload
    pub parameters_written: bool,
    /// `true` when injection stages were part of the plan
    pub pointer_active: bool,
    /// Stages dispatched successfully
    pub stages_executed: usize,
    /// Stages in the frame plan
    pub stages_planned: usize,
    /// Kernel of the first failing stage, if any
    pub skipped_from: Option<Kernel>,
}

impl FrameReport {
    /// `true` when every planned stage ran
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped_from.is_none() && self.stages_executed == self.stages_planned
    }
}

/// Result of [`FluidSimulation::render_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was recorded and presented
    Rendered(FrameReport),
    /// The simulation is paused; nothing was submitted
    Paused,
}

/// Interactive stable-fluids simulation
pub struct FluidSimulation {
    backend: Arc<dyn ComputeBackend>,
    config: SimulationConfig,
    screen_size: (u32, u32),
    grid_size: (u32, u32),
    fields: Option<FluidFields>,
    ring: ParameterRing,
    tracker: InteractionTracker,
    view: View,
    limiter: FrameLimiter,
    paused: bool,
    frame_index: u64,
}

impl std::fmt::Debug for FluidSimulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluidSimulation")
            .field("backend", &self.backend.name())
            .field("screen_size", &self.screen_size)
            .field("grid_size", &self.grid_size)
            .field("view", &self.view)
            .field("paused", &self.paused)
            .field("frame_index", &self.frame_index)
            .finish_non_exhaustive()
    }
}

impl FluidSimulation {
    /// Build a simulation for a screen of `screen_width` x `screen_height` pixels.
    ///
    /// # Errors
    ///
    /// [`SimulationError::InvalidConfig`] when the configuration fails
    /// validation, [`SimulationError::Backend`] when the surface, fields or
    /// parameter slots cannot be created.
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        config: SimulationConfig,
        screen_width: u32,
        screen_height: u32,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let grid_size = config.grid_dimensions(screen_width, screen_height);

        backend.configure_surface(grid_size.0, grid_size.1)?;
        let fields = FluidFields::create(backend.as_ref(), grid_size.0, grid_size.1, config.precision)?;
        let template = ParameterBlock::new(grid_size.0, grid_size.1, &config);
        let ring = match ParameterRing::new(backend.as_ref(), config.ring_size, template) {
            Ok(ring) => ring,
            Err(e) => {
                fields.destroy(backend.as_ref());
                return Err(e.into());
            }
        };

        let tracker = if config.idle_emitter {
            InteractionTracker::with_idle_emitter(screen_width as f32, screen_height as f32)
        } else {
            InteractionTracker::new()
        };

        info!(
            "Fluid simulation ready on {} backend: {}x{} grid, {} pressure iterations, {} frames in flight",
            backend.name(),
            grid_size.0,
            grid_size.1,
            config.pressure_iterations,
            config.max_in_flight
        );

        Ok(Self {
            limiter: FrameLimiter::new(config.max_in_flight),
            backend,
            config,
            screen_size: (screen_width, screen_height),
            grid_size,
            fields: Some(fields),
            ring,
            tracker,
            view: View::default(),
            paused: false,
            frame_index: 0,
        })
    }

    /// Record, submit and present one frame.
    ///
    /// Blocks while `max_in_flight` frames are outstanding. Stage failures are
    /// logged and reported in the [`FrameReport`]; they never abort the loop.
    pub fn render_frame(&mut self) -> FrameOutcome {
        if self.paused {
            return FrameOutcome::Paused;
        }
        let Some(fields) = self.fields.as_mut() else {
            return FrameOutcome::Paused;
        };

        let frame_slot = self.limiter.acquire();

        let sample = self
            .tracker
            .sample()
            .scaled(1.0 / self.config.screen_scale_adjustment);
        let pointer_active = sample.is_active();

        let frame_index = self.frame_index;
        let ring_index = self.ring.next_index();
        let advance = match self.ring.advance(self.backend.as_ref(), &sample) {
            Ok(advance) => Some(advance),
            Err(e) => {
                warn!("Frame {frame_index}: failed to upload parameters: {e}; skipping stages");
                None
            }
        };

        let plan = FramePlan::build(pointer_active, self.config.pressure_iterations, self.view);
        let mut stages_executed = 0;
        let mut skipped_from = None;

        if let Some(advance) = advance {
            for stage in plan.stages() {
                match apply_stage(self.backend.as_ref(), fields, stage, advance.slot) {
                    Ok(()) => stages_executed += 1,
                    Err(e) => {
                        warn!(
                            "Frame {frame_index}: stage {} failed: {e}; skipping the remaining {} stage(s)",
                            stage.kernel,
                            plan.len() - stages_executed - 1
                        );
                        skipped_from = Some(stage.kernel);
                        break;
                    }
                }
            }
        } else {
            skipped_from = plan.stages().first().map(|stage| stage.kernel);
        }

        if let Err(e) = self.backend.present() {
            warn!("Frame {frame_index}: present failed: {e}");
        }
        self.backend
            .on_frame_complete(Box::new(move || drop(frame_slot)));

        self.tracker.roll();
        self.frame_index += 1;

        FrameOutcome::Rendered(FrameReport {
            frame_index,
            slot: ring_index,
            parameters_written: advance.is_some_and(|a| a.written),
            pointer_active,
            stages_executed,
            stages_planned: plan.len(),
            skipped_from,
        })
    }

    /// Single-pointer press at a screen position
    pub fn pointer_down(&mut self, x: f32, y: f32) {
        self.tracker.pointer_down(Vec2::new(x, y));
    }

    /// Single-pointer drag
    pub fn pointer_move(&mut self, x: f32, y: f32) {
        self.tracker.pointer_move(Vec2::new(x, y));
    }

    /// Single-pointer release
    pub fn pointer_up(&mut self) {
        self.tracker.pointer_up();
    }

    /// Begin touch `id`
    pub fn touch_down(&mut self, id: u64, x: f32, y: f32) {
        self.tracker.touch_down(id, Vec2::new(x, y));
    }

    /// Move touch `id`
    pub fn touch_move(&mut self, id: u64, x: f32, y: f32) {
        self.tracker.touch_move(id, Vec2::new(x, y));
    }

    /// End touch `id`
    pub fn touch_up(&mut self, id: u64) {
        self.tracker.touch_up(id);
    }

    /// Cycle the displayed field and return the new view.
    pub fn advance_view(&mut self) -> View {
        self.view = self.view.next();
        debug!("View changed to {}", self.view);
        self.view
    }

    /// Field currently displayed
    #[must_use]
    pub fn view(&self) -> View {
        self.view
    }

    /// Flip the paused flag and return the new value.
    pub fn toggle_pause(&mut self) -> bool {
        self.set_paused(!self.paused);
        self.paused
    }

    /// Pause or resume. In-flight frames still complete while paused.
    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            debug!("Simulation {}", if paused { "paused" } else { "resumed" });
        }
        self.paused = paused;
    }

    /// `true` while paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Host window lost focus: pause and drop any active touches.
    pub fn focus_lost(&mut self) {
        self.tracker.cancel_all();
        self.set_paused(true);
    }

    /// Host window regained focus: resume.
    pub fn focus_gained(&mut self) {
        self.set_paused(false);
    }

    /// Recreate every field for a new screen size. The simulation restarts
    /// from zero state.
    ///
    /// Waits for in-flight frames first.
    ///
    /// # Errors
    ///
    /// Returns the backend error when the surface, fields or parameter blocks
    /// cannot be recreated. The simulation then has no fields and renders
    /// nothing until a later `resize` succeeds.
    pub fn resize(&mut self, screen_width: u32, screen_height: u32) -> Result<(), SimulationError> {
        self.limiter.wait_idle();
        if let Some(fields) = self.fields.take() {
            fields.destroy(self.backend.as_ref());
        }

        let grid_size = self
            .config
            .grid_dimensions(screen_width, screen_height);
        debug!(
            "Resizing to {}x{} screen ({}x{} grid)",
            screen_width, screen_height, grid_size.0, grid_size.1
        );
        self.screen_size = (screen_width, screen_height);
        self.grid_size = grid_size;
        self.tracker
            .set_screen_size(screen_width as f32, screen_height as f32);

        self.backend.configure_surface(grid_size.0, grid_size.1)?;
        let fields = FluidFields::create(
            self.backend.as_ref(),
            grid_size.0,
            grid_size.1,
            self.config.precision,
        )?;
        self.fields = Some(fields);
        let template = ParameterBlock::new(grid_size.0, grid_size.1, &self.config);
        self.ring.reset(self.backend.as_ref(), template)?;
        Ok(())
    }

    /// Block until every submitted frame has completed.
    pub fn wait_idle(&self) {
        self.limiter.wait_idle();
    }

    /// Copy the active buffer of a field to the host.
    ///
    /// # Errors
    ///
    /// [`SimulationError::NoFields`] after a failed resize, otherwise the
    /// backend's readback error.
    pub fn read_field(&self, kind: FieldKind) -> Result<Vec<[f32; 2]>, SimulationError> {
        let fields = self.fields.as_ref().ok_or(SimulationError::NoFields)?;
        Ok(self.backend.read_field(fields.get(kind).read())?)
    }

    /// Overwrite the active buffer of a field.
    ///
    /// # Errors
    ///
    /// [`SimulationError::NoFields`] after a failed resize, otherwise the
    /// backend's upload error (for example a length mismatch).
    pub fn write_field(&mut self, kind: FieldKind, data: &[[f32; 2]]) -> Result<(), SimulationError> {
        let fields = self.fields.as_ref().ok_or(SimulationError::NoFields)?;
        Ok(self.backend.upload_field(fields.get(kind).read(), data)?)
    }

    /// RGBA8 pixels of the last presented frame, row-major at grid resolution.
    ///
    /// # Errors
    ///
    /// Returns the backend's readback error.
    pub fn read_presented(&self) -> Result<Vec<u32>, BackendError> {
        self.backend.read_presented()
    }

    /// Frames submitted but not yet completed
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.limiter.outstanding()
    }

    /// Highest number of frames ever in flight at once
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.limiter.peak()
    }

    /// Frames rendered so far
    #[must_use]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Grid `(width, height)` in cells
    #[must_use]
    pub fn grid_size(&self) -> (u32, u32) {
        self.grid_size
    }

    /// Screen `(width, height)` in pixels
    #[must_use]
    pub fn screen_size(&self) -> (u32, u32) {
        self.screen_size
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Backend the simulation runs on
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Host copy of a parameter block
    #[must_use]
    pub fn parameter_block(&self, ring_index: usize) -> &ParameterBlock {
        self.ring.block(ring_index)
    }
}

impl Drop for FluidSimulation {
    fn drop(&mut self) {
        self.limiter.wait_idle();
        if let Some(fields) = self.fields.take() {
            fields.destroy(self.backend.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::config::Precision;

    fn config() -> SimulationConfig {
        SimulationConfig {
            pressure_iterations: 4,
            ink_radius: 4.0,
            precision: Precision::Float32,
            ..SimulationConfig::default()
        }
    }

    fn simulation(backend: CpuBackend) -> FluidSimulation {
        FluidSimulation::new(Arc::new(backend), config(), 16, 12).unwrap()
    }

    fn rendered(outcome: FrameOutcome) -> FrameReport {
        match outcome {
            FrameOutcome::Rendered(report) => report,
            FrameOutcome::Paused => panic!("frame unexpectedly paused"),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = SimulationConfig {
            ring_size: 1,
            ..config()
        };
        let result = FluidSimulation::new(Arc::new(CpuBackend::new()), bad, 16, 16);
        assert!(matches!(result, Err(SimulationError::InvalidConfig(_))));
    }

    #[test]
    fn test_idle_frame_runs_full_plan() {
        let mut sim = simulation(CpuBackend::new());
        let report = rendered(sim.render_frame());
        assert_eq!(report.frame_index, 0);
        assert_eq!(report.slot, 0);
        assert!(!report.pointer_active);
        assert_eq!(report.stages_planned, 2 + 3 + 4 + 2);
        assert!(report.is_complete());
        assert_eq!(sim.frame_index(), 1);
    }

    #[test]
    fn test_ring_slot_cycles() {
        let mut sim = simulation(CpuBackend::new());
        let slots: Vec<usize> = (0..5).map(|_| rendered(sim.render_frame()).slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_pointer_frames_inject() {
        let mut sim = simulation(CpuBackend::new());
        sim.pointer_down(8.0, 6.0);
        let report = rendered(sim.render_frame());
        assert!(report.pointer_active);
        assert!(report.parameters_written);
        assert_eq!(report.stages_planned, 2 + 2 + 3 + 4 + 2);
        assert_eq!(sim.parameter_block(report.slot).point_count, 1);

        sim.pointer_up();
        assert!(!rendered(sim.render_frame()).pointer_active);
    }

    #[test]
    fn test_non_finite_pointer_leaves_block_unchanged() {
        let mut sim = simulation(CpuBackend::new());
        let before = *sim.parameter_block(0);
        sim.pointer_down(f32::NAN, 1.0);
        let report = rendered(sim.render_frame());
        assert!(!report.parameters_written);
        assert_eq!(
            bytemuck::bytes_of(sim.parameter_block(0)),
            bytemuck::bytes_of(&before)
        );
    }

    #[test]
    fn test_failing_stage_skips_rest_of_frame() {
        let backend = CpuBackend::builder()
            .unavailable_kernel(Kernel::Divergence)
            .build();
        let mut sim = simulation(backend);
        for _ in 0..2 {
            let report = rendered(sim.render_frame());
            assert_eq!(report.skipped_from, Some(Kernel::Divergence));
            // advect x2, vorticity, confinement
            assert_eq!(report.stages_executed, 4);
            assert!(!report.is_complete());
        }
    }

    #[test]
    fn test_pause_issues_no_frames() {
        let mut sim = simulation(CpuBackend::new());
        assert!(sim.toggle_pause());
        assert_eq!(sim.render_frame(), FrameOutcome::Paused);
        assert_eq!(sim.frame_index(), 0);
        assert_eq!(sim.in_flight(), 0);

        sim.focus_gained();
        assert!(!sim.is_paused());
        assert!(matches!(sim.render_frame(), FrameOutcome::Rendered(_)));

        sim.pointer_down(1.0, 1.0);
        sim.focus_lost();
        assert!(sim.is_paused());
        sim.focus_gained();
        assert!(!rendered(sim.render_frame()).pointer_active);
    }

    #[test]
    fn test_advance_view_cycles() {
        let mut sim = simulation(CpuBackend::new());
        assert_eq!(sim.view(), View::Density);
        assert_eq!(sim.advance_view(), View::Pressure);
        assert_eq!(sim.advance_view(), View::Velocity);
        assert_eq!(sim.advance_view(), View::Vorticity);
        assert_eq!(sim.advance_view(), View::Density);
    }

    #[test]
    fn test_resize_restarts_from_zero() {
        let mut sim = simulation(CpuBackend::new());
        sim.pointer_down(8.0, 6.0);
        sim.render_frame();
        sim.pointer_move(12.0, 6.0);
        sim.render_frame();
        sim.wait_idle();
        assert!(sim
            .read_field(FieldKind::Density)
            .unwrap()
            .iter()
            .any(|c| c[0] > 0.0));

        sim.resize(8, 4).unwrap();
        assert_eq!(sim.grid_size(), (8, 4));
        assert_eq!(sim.screen_size(), (8, 4));
        for kind in FieldKind::ALL {
            let data = sim.read_field(kind).unwrap();
            assert_eq!(data.len(), 32);
            assert!(data.iter().all(|c| *c == [0.0, 0.0]));
        }
        assert_eq!(sim.read_presented().unwrap().len(), 32);

        sim.pointer_up();
        let report = rendered(sim.render_frame());
        assert_eq!(report.slot, 0);
        assert!(report.is_complete());
    }

    #[test]
    fn test_write_field_length_checked() {
        let mut sim = simulation(CpuBackend::new());
        assert!(sim.write_field(FieldKind::Pressure, &[[0.0, 0.0]; 3]).is_err());
        assert!(sim
            .write_field(FieldKind::Pressure, &vec![[1.0, 0.0]; 16 * 12])
            .is_ok());
        assert_eq!(sim.read_field(FieldKind::Pressure).unwrap()[0], [1.0, 0.0]);
    }
}

//! Per-frame parameter blocks and the ring that cycles them
//!
//! [`ParameterBlock`] is the uniform struct every kernel reads. Its layout
//! matches `Params` in the WGSL shaders byte for byte. The
//! [`ParameterRing`] holds one block per in-flight frame so the host never
//! overwrites a block the device may still be reading.

use bytemuck::{Pod, Zeroable};

use crate::backend::{ComputeBackend, ParamSlot};
use crate::config::SimulationConfig;
use crate::core_types::{is_finite, Vec2};
use crate::error::BackendError;
use crate::interaction::{InteractionSample, MAX_POINTS};

/// Uniform parameters for one frame (must match the WGSL `Params` struct layout)
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ParameterBlock {
    /// `xy` = position, `zw` = previous position, in grid cells
    pub points: [[f32; 4]; MAX_POINTS],
    /// `(1 / width, 1 / height)`
    pub cell_offsets: [f32; 2],
    /// Grid `(width, height)`
    pub screen_size: [f32; 2],
    /// Dye added per injection
    pub impulse_scalar: f32,
    /// Injection radius in cells
    pub ink_radius: f32,
    /// Number of valid entries in `points`
    pub point_count: u32,
    /// Advection and confinement time step
    pub time_step: f32,
    /// Multiplier applied by advection
    pub dissipation: f32,
    /// Vorticity confinement strength
    pub vorticity_strength: f32,
    /// Grid spacing for the pressure solve
    pub cell_size: f32,
    /// Gain applied before colour mapping
    pub visualize_scale: f32,
    /// Keeps the struct a multiple of 16 bytes
    pub _padding: [u32; 4],
}

impl ParameterBlock {
    /// Block with the static fields filled in and no active points.
    #[must_use]
    pub fn new(width: u32, height: u32, config: &SimulationConfig) -> Self {
        Self {
            points: [[0.0; 4]; MAX_POINTS],
            cell_offsets: [1.0 / width as f32, 1.0 / height as f32],
            screen_size: [width as f32, height as f32],
            impulse_scalar: config.impulse_scalar,
            ink_radius: config.ink_radius_cells(),
            point_count: 0,
            time_step: config.time_step,
            dissipation: config.dissipation,
            vorticity_strength: config.vorticity_strength,
            cell_size: config.cell_size,
            visualize_scale: config.visualize_scale,
            _padding: [0; 4],
        }
    }

    /// Grid `(width, height)` in cells
    #[must_use]
    pub fn grid_size(&self) -> (usize, usize) {
        (self.screen_size[0] as usize, self.screen_size[1] as usize)
    }

    /// Write a sample into the point slots.
    ///
    /// Returns `false` and leaves the block untouched when any position or
    /// impulse is not finite. Unused slots are zeroed.
    pub fn write_sample(&mut self, sample: &InteractionSample) -> bool {
        let finite = sample.active_points().all(|p| {
            is_finite(&p.position) && is_finite(&p.previous_or_current()) && is_finite(&p.impulse())
        });
        if !finite {
            return false;
        }

        let mut count = 0u32;
        self.points = [[0.0; 4]; MAX_POINTS];
        for (slot, point) in self.points.iter_mut().zip(sample.active_points()) {
            let previous = point.previous_or_current();
            *slot = [point.position.x, point.position.y, previous.x, previous.y];
            count += 1;
        }
        self.point_count = count;
        true
    }

    /// Position of point `index`
    #[must_use]
    pub fn position(&self, index: usize) -> Vec2 {
        let p = self.points[index];
        Vec2::new(p[0], p[1])
    }

    /// Previous position of point `index`
    #[must_use]
    pub fn previous(&self, index: usize) -> Vec2 {
        let p = self.points[index];
        Vec2::new(p[2], p[3])
    }

    /// Active points as `(position, previous)` pairs
    pub fn active_points(&self) -> impl Iterator<Item = (Vec2, Vec2)> + '_ {
        let count = (self.point_count as usize).min(MAX_POINTS);
        (0..count).map(|i| (self.position(i), self.previous(i)))
    }
}

/// Outcome of one [`ParameterRing::advance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAdvance {
    /// Ring index used this frame
    pub index: usize,
    /// Backend slot holding that block
    pub slot: ParamSlot,
    /// `false` when the sample was rejected and the block kept its old contents
    pub written: bool,
}

/// Fixed-size round-robin of parameter blocks
#[derive(Debug)]
pub struct ParameterRing {
    blocks: Vec<ParameterBlock>,
    slots: Vec<ParamSlot>,
    next: usize,
}

impl ParameterRing {
    /// Allocate `size` backend slots, each initialised to `template`.
    ///
    /// # Errors
    ///
    /// Returns the first slot allocation or upload error.
    pub fn new(
        backend: &dyn ComputeBackend,
        size: usize,
        template: ParameterBlock,
    ) -> Result<Self, BackendError> {
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            let slot = backend.create_param_slot()?;
            backend.write_params(slot, &template)?;
            slots.push(slot);
        }
        Ok(Self {
            blocks: vec![template; size],
            slots,
            next: 0,
        })
    }

    /// Number of blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// `true` for a ring with no blocks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index the next [`advance`](Self::advance) will use
    #[must_use]
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Host copy of block `index`
    #[must_use]
    pub fn block(&self, index: usize) -> &ParameterBlock {
        &self.blocks[index]
    }

    /// Claim the next block, write `sample` into it and upload it.
    ///
    /// The ring index advances even when the sample is rejected or the upload
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns the backend's upload error.
    pub fn advance(
        &mut self,
        backend: &dyn ComputeBackend,
        sample: &InteractionSample,
    ) -> Result<RingAdvance, BackendError> {
        let index = self.next;
        self.next = (self.next + 1) % self.blocks.len();

        let block = &mut self.blocks[index];
        let written = block.write_sample(sample);
        if written {
            backend.write_params(self.slots[index], block)?;
        } else {
            tracing::trace!("Rejected non-finite interaction sample (ring index {index})");
        }
        Ok(RingAdvance {
            index,
            slot: self.slots[index],
            written,
        })
    }

    /// Reset every block to `template` and restart at index 0.
    ///
    /// # Errors
    ///
    /// Returns the first upload error.
    pub fn reset(
        &mut self,
        backend: &dyn ComputeBackend,
        template: ParameterBlock,
    ) -> Result<(), BackendError> {
        for (block, slot) in self.blocks.iter_mut().zip(&self.slots) {
            *block = template;
            backend.write_params(*slot, block)?;
        }
        self.next = 0;
        Ok(())
    }
}

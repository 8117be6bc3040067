//! Pointer and touch tracking
//!
//! The tracker turns host input events into one [`InteractionSample`] per
//! frame. Each point carries its current position and the position it had at
//! the end of the previous frame; the difference is the impulse injected into
//! the velocity field. [`InteractionTracker::roll`] is called once per
//! rendered frame to move current positions into the previous slots.

use crate::core_types::Vec2;

/// Maximum number of simultaneous touches
pub const MAX_POINTS: usize = 5;

/// Touch id used by the single-pointer (mouse) API
pub const POINTER_ID: u64 = 0;

/// Distance from the bottom edge of the idle emitter, in screen pixels
const IDLE_EMITTER_INSET: f32 = 50.0;

/// One active point in a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    /// Position this frame
    pub position: Vec2,
    /// Position at the end of the previous frame, `None` on the first frame of a touch
    pub previous: Option<Vec2>,
}

impl TouchPoint {
    /// Previous position, or the current one when the touch just started
    #[must_use]
    pub fn previous_or_current(&self) -> Vec2 {
        self.previous.unwrap_or(self.position)
    }

    /// Movement since the previous frame (zero on the first frame of a touch)
    #[must_use]
    pub fn impulse(&self) -> Vec2 {
        self.position - self.previous_or_current()
    }
}

/// Snapshot of all active points for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InteractionSample {
    /// Up to [`MAX_POINTS`] points; unused slots are `None`
    pub points: [Option<TouchPoint>; MAX_POINTS],
}

impl InteractionSample {
    /// Sample with a single point
    #[must_use]
    pub fn single(position: Vec2, previous: Option<Vec2>) -> Self {
        let mut sample = Self::default();
        sample.points[0] = Some(TouchPoint { position, previous });
        sample
    }

    /// `true` when at least one point is present
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.points.iter().any(Option::is_some)
    }

    /// Present points in slot order
    pub fn active_points(&self) -> impl Iterator<Item = &TouchPoint> {
        self.points.iter().flatten()
    }

    /// Multiply every position by `factor` (screen pixels to grid cells).
    #[must_use]
    pub fn scaled(&self, factor: f32) -> Self {
        let mut out = *self;
        for point in out.points.iter_mut().flatten() {
            point.position *= factor;
            point.previous = point.previous.map(|p| p * factor);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TrackedTouch {
    id: u64,
    position: Vec2,
    previous: Option<Vec2>,
}

/// Host-independent record of pointer and touch state
#[derive(Debug, Clone, Default)]
pub struct InteractionTracker {
    touches: [Option<TrackedTouch>; MAX_POINTS],
    idle_emitter: Option<TouchPoint>,
    interacted: bool,
}

impl InteractionTracker {
    /// Tracker with no points and no idle emitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that reports an upward jet from the bottom centre of a
    /// `width` x `height` screen until the first touch begins.
    #[must_use]
    pub fn with_idle_emitter(width: f32, height: f32) -> Self {
        Self {
            idle_emitter: Some(Self::emitter_point(width, height)),
            ..Self::default()
        }
    }

    fn emitter_point(width: f32, height: f32) -> TouchPoint {
        let y = (height - IDLE_EMITTER_INSET).max(height * 0.5);
        TouchPoint {
            position: Vec2::new(width * 0.5, y),
            previous: Some(Vec2::new(width * 0.5, y + 1.0)),
        }
    }

    /// Move the idle emitter after a resize (no-op when it is disabled).
    pub fn set_screen_size(&mut self, width: f32, height: f32) {
        if self.idle_emitter.is_some() {
            self.idle_emitter = Some(Self::emitter_point(width, height));
        }
    }

    /// `true` once any touch has started
    #[must_use]
    pub fn has_interacted(&self) -> bool {
        self.interacted
    }

    /// Begin a touch. Ignored when all slots are taken.
    pub fn touch_down(&mut self, id: u64, position: Vec2) {
        self.interacted = true;
        if let Some(existing) = self.find_mut(id) {
            existing.position = position;
            existing.previous = None;
            return;
        }
        if let Some(slot) = self.touches.iter_mut().find(|t| t.is_none()) {
            *slot = Some(TrackedTouch {
                id,
                position,
                previous: None,
            });
        } else {
            tracing::trace!("Ignoring touch {id}: all {MAX_POINTS} slots in use");
        }
    }

    /// Update a touch's position. Unknown ids are ignored.
    pub fn touch_move(&mut self, id: u64, position: Vec2) {
        if let Some(touch) = self.find_mut(id) {
            touch.position = position;
        }
    }

    /// End a touch.
    pub fn touch_up(&mut self, id: u64) {
        for slot in &mut self.touches {
            if slot.is_some_and(|t| t.id == id) {
                *slot = None;
            }
        }
    }

    /// Single-pointer press
    pub fn pointer_down(&mut self, position: Vec2) {
        self.touch_down(POINTER_ID, position);
    }

    /// Single-pointer drag
    pub fn pointer_move(&mut self, position: Vec2) {
        self.touch_move(POINTER_ID, position);
    }

    /// Single-pointer release
    pub fn pointer_up(&mut self) {
        self.touch_up(POINTER_ID);
    }

    /// Drop every active touch.
    pub fn cancel_all(&mut self) {
        self.touches = [None; MAX_POINTS];
    }

    /// Points for the current frame, packed into the lowest slots.
    #[must_use]
    pub fn sample(&self) -> InteractionSample {
        let mut sample = InteractionSample::default();
        let active = self.touches.iter().flatten().map(|t| TouchPoint {
            position: t.position,
            previous: t.previous,
        });
        for (slot, point) in sample.points.iter_mut().zip(active) {
            *slot = Some(point);
        }

        if !self.interacted && !sample.is_active() {
            if let Some(emitter) = self.idle_emitter {
                sample.points[0] = Some(emitter);
            }
        }
        sample
    }

    /// End of frame: every current position becomes the previous one.
    pub fn roll(&mut self) {
        for touch in self.touches.iter_mut().flatten() {
            touch.previous = Some(touch.position);
        }
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut TrackedTouch> {
        self.touches.iter_mut().flatten().find(|t| t.id == id)
    }
}

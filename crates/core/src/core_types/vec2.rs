//! Vector type alias for 2D positions and impulses.

use nalgebra::Vector2;

/// 2D vector type for pointer positions, impulses and grid coordinates.
///
/// This is a simple alias for `nalgebra::Vector2<f32>`, used by the interaction
/// tracker and the parameter blocks for screen- and grid-space points.
pub type Vec2 = Vector2<f32>;

/// Returns `true` when both components are finite (not NaN, not infinite).
#[inline]
pub fn is_finite(v: &Vec2) -> bool {
    v.x.is_finite() && v.y.is_finite()
}

//! Core math types shared by the simulation modules

pub mod vec2;

pub use vec2::{is_finite, Vec2};

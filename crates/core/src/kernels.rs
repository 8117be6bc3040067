//! Per-cell kernel bodies for the CPU backend
//!
//! These functions are the reference definitions of every stage; the WGSL
//! shaders in `backend/shaders/` compute the same expressions. Coordinates
//! are in grid units: cell `(x, y)` has its centre at `(x, y)`. Neighbour
//! fetches clamp to the edge of the grid.

use std::f32::consts::TAU;

use crate::params::ParameterBlock;
use crate::stages::Kernel;

/// Two components per cell
pub type Cell = [f32; 2];

/// Read-only row-major view of one field buffer
#[derive(Debug, Clone, Copy)]
pub struct Grid<'a> {
    cells: &'a [Cell],
    width: usize,
    height: usize,
}

impl<'a> Grid<'a> {
    /// Wrap `cells`, which must hold `width * height` entries.
    #[must_use]
    pub fn new(cells: &'a [Cell], width: usize, height: usize) -> Self {
        debug_assert_eq!(cells.len(), width * height);
        Self {
            cells,
            width,
            height,
        }
    }

    /// Cell at `(x, y)`, clamped to the grid
    #[inline]
    #[must_use]
    pub fn fetch(&self, x: isize, y: isize) -> Cell {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.cells[cy * self.width + cx]
    }

    /// Bilinear sample at a continuous position, clamped to the grid
    #[must_use]
    pub fn bilinear(&self, px: f32, py: f32) -> Cell {
        let px = px.clamp(0.0, (self.width - 1) as f32);
        let py = py.clamp(0.0, (self.height - 1) as f32);
        let x0 = px.floor();
        let y0 = py.floor();
        let fx = px - x0;
        let fy = py - y0;
        let (x0, y0) = (x0 as isize, y0 as isize);

        let c00 = self.fetch(x0, y0);
        let c10 = self.fetch(x0 + 1, y0);
        let c01 = self.fetch(x0, y0 + 1);
        let c11 = self.fetch(x0 + 1, y0 + 1);

        let mut out = [0.0; 2];
        for i in 0..2 {
            let bottom = c00[i] + (c10[i] - c00[i]) * fx;
            let top = c01[i] + (c11[i] - c01[i]) * fx;
            out[i] = bottom + (top - bottom) * fy;
        }
        out
    }
}

/// The four axis neighbours of a cell
#[derive(Debug, Clone, Copy)]
struct Stencil {
    left: Cell,
    right: Cell,
    bottom: Cell,
    top: Cell,
}

impl Stencil {
    #[inline(always)]
    fn around(grid: &Grid<'_>, x: isize, y: isize) -> Self {
        Self {
            left: grid.fetch(x - 1, y),
            right: grid.fetch(x + 1, y),
            bottom: grid.fetch(x, y - 1),
            top: grid.fetch(x, y + 1),
        }
    }
}

/// Injection weight at distance `d` from a pointer with radius `r`
#[inline]
#[must_use]
pub fn falloff(d: f32, r: f32) -> f32 {
    if d < r {
        (-4.0 * d * d / (r * r)).exp()
    } else {
        0.0
    }
}

/// `dissipation · bilinear(source, c − Δt · velocity(c))`
#[must_use]
pub fn advect(velocity: &Grid<'_>, source: &Grid<'_>, x: isize, y: isize, p: &ParameterBlock) -> Cell {
    let v = velocity.fetch(x, y);
    let back_x = x as f32 - p.time_step * v[0];
    let back_y = y as f32 - p.time_step * v[1];
    let sampled = source.bilinear(back_x, back_y);
    [p.dissipation * sampled[0], p.dissipation * sampled[1]]
}

fn injection_weights(x: isize, y: isize, p: &ParameterBlock) -> impl Iterator<Item = (f32, [f32; 2])> + '_ {
    let (cx, cy) = (x as f32, y as f32);
    p.active_points().map(move |(position, previous)| {
        let distance = ((cx - position.x).powi(2) + (cy - position.y).powi(2)).sqrt();
        let weight = falloff(distance, p.ink_radius);
        (weight, [position.x - previous.x, position.y - previous.y])
    })
}

/// Adds `(p − q) · w` for each active pointer
#[must_use]
pub fn inject_force_vector(dest: &Grid<'_>, x: isize, y: isize, p: &ParameterBlock) -> Cell {
    let mut out = dest.fetch(x, y);
    for (w, impulse) in injection_weights(x, y, p) {
        out[0] += impulse[0] * w;
        out[1] += impulse[1] * w;
    }
    out
}

/// Adds `impulse_scalar · Σ w` to the first component
#[must_use]
pub fn inject_force_scalar(dest: &Grid<'_>, x: isize, y: isize, p: &ParameterBlock) -> Cell {
    let mut out = dest.fetch(x, y);
    let total: f32 = injection_weights(x, y, p).map(|(w, _)| w).sum();
    out[0] += p.impulse_scalar * total;
    out
}

/// `0.5 · ((R.x − L.x) + (T.y − B.y))`
#[must_use]
pub fn divergence(velocity: &Grid<'_>, x: isize, y: isize) -> Cell {
    let around = Stencil::around(velocity, x, y);
    [0.5 * ((around.right[0] - around.left[0]) + (around.top[1] - around.bottom[1])), 0.0]
}

/// `(L + R + B + T + α · b) / 4` with `α = −cell_size²`
#[must_use]
pub fn pressure_jacobi(
    pressure: &Grid<'_>,
    divergence: &Grid<'_>,
    x: isize,
    y: isize,
    p: &ParameterBlock,
) -> Cell {
    let around = Stencil::around(pressure, x, y);
    let alpha = -(p.cell_size * p.cell_size);
    let rhs = divergence.fetch(x, y)[0];
    [
        (around.left[0] + around.right[0] + around.bottom[0] + around.top[0] + alpha * rhs) * 0.25,
        0.0,
    ]
}

/// `0.5 · ((R.y − L.y) − (T.x − B.x))`
#[must_use]
pub fn vorticity(velocity: &Grid<'_>, x: isize, y: isize) -> Cell {
    let around = Stencil::around(velocity, x, y);
    [0.5 * ((around.right[1] - around.left[1]) - (around.top[0] - around.bottom[0])), 0.0]
}

/// Pushes velocity along the gradient of `|ω|`, scaled by `Δt · ε`
#[must_use]
pub fn vorticity_confinement(
    velocity: &Grid<'_>,
    vorticity: &Grid<'_>,
    x: isize,
    y: isize,
    p: &ParameterBlock,
) -> Cell {
    let around = Stencil::around(vorticity, x, y);
    let eta_x = 0.5 * (around.right[0].abs() - around.left[0].abs());
    let eta_y = 0.5 * (around.top[0].abs() - around.bottom[0].abs());
    let length = (eta_x * eta_x + eta_y * eta_y).sqrt() + 1e-5;
    let (nx, ny) = (eta_x / length, eta_y / length);

    let omega = vorticity.fetch(x, y)[0];
    let v = velocity.fetch(x, y);
    let scale = p.time_step * p.vorticity_strength;
    [v[0] + scale * ny * omega, v[1] - scale * nx * omega]
}

/// `v − 0.5 · (p_R − p_L, p_T − p_B)`
#[must_use]
pub fn gradient_subtract(pressure: &Grid<'_>, velocity: &Grid<'_>, x: isize, y: isize) -> Cell {
    let around = Stencil::around(pressure, x, y);
    let v = velocity.fetch(x, y);
    [
        v[0] - 0.5 * (around.right[0] - around.left[0]),
        v[1] - 0.5 * (around.top[0] - around.bottom[0]),
    ]
}

/// Evaluate a field kernel at one cell.
///
/// `sources` are bound in the order the kernel expects. Returns `None` for
/// the visualize kernels, which write the surface instead.
#[must_use]
pub fn field_cell(
    kernel: Kernel,
    sources: &[Grid<'_>],
    x: isize,
    y: isize,
    p: &ParameterBlock,
) -> Option<Cell> {
    let cell = match (kernel, sources) {
        (Kernel::Advect, [velocity, source]) => advect(velocity, source, x, y, p),
        (Kernel::InjectForceVector, [dest]) => inject_force_vector(dest, x, y, p),
        (Kernel::InjectForceScalar, [dest]) => inject_force_scalar(dest, x, y, p),
        (Kernel::Divergence, [velocity]) => divergence(velocity, x, y),
        (Kernel::PressureJacobi, [pressure, b]) => pressure_jacobi(pressure, b, x, y, p),
        (Kernel::Vorticity, [velocity]) => vorticity(velocity, x, y),
        (Kernel::VorticityConfinement, [velocity, omega]) => {
            vorticity_confinement(velocity, omega, x, y, p)
        }
        (Kernel::GradientSubtract, [pressure, velocity]) => {
            gradient_subtract(pressure, velocity, x, y)
        }
        _ => return None,
    };
    Some(cell)
}

/// Hue/saturation/value to RGB, all in `[0, 1]`
#[must_use]
pub fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [f32; 3] {
    let channel = |n: f32| {
        let k = (n + hue * 6.0) % 6.0;
        value - value * saturation * k.min(4.0 - k).clamp(0.0, 1.0)
    };
    [channel(5.0), channel(3.0), channel(1.0)]
}

/// Pack RGBA in `[0, 1]` into a little-endian RGBA8 word
#[must_use]
pub fn pack_rgba(rgba: [f32; 4]) -> u32 {
    rgba.iter().enumerate().fold(0u32, |acc, (i, c)| {
        let byte = (0.5 + 255.0 * c.clamp(0.0, 1.0)).floor() as u32;
        acc | (byte << (8 * i))
    })
}

/// Direction as hue, `clamp(|v| · gain)` as brightness
#[must_use]
pub fn visualize_vector(v: Cell, gain: f32) -> u32 {
    let angle = v[1].atan2(v[0]) / TAU;
    let hue = angle - angle.floor();
    let magnitude = (v[0] * v[0] + v[1] * v[1]).sqrt();
    let brightness = (magnitude * gain).clamp(0.0, 1.0);
    let [r, g, b] = hsv_to_rgb(hue, 1.0, brightness);
    pack_rgba([r, g, b, 1.0])
}

/// Grey for positive values, blue for negative ones
#[must_use]
pub fn visualize_scalar(v: Cell, gain: f32) -> u32 {
    let t = (v[0] * gain).clamp(-1.0, 1.0);
    if t >= 0.0 {
        pack_rgba([t, t, t, 1.0])
    } else {
        pack_rgba([0.0, 0.0, -t, 1.0])
    }
}

/// Evaluate a visualize kernel for one cell value.
///
/// Returns `None` for kernels that write fields.
#[must_use]
pub fn surface_pixel(kernel: Kernel, value: Cell, p: &ParameterBlock) -> Option<u32> {
    match kernel {
        Kernel::VisualizeVector => Some(visualize_vector(value, p.visualize_scale)),
        Kernel::VisualizeScalar => Some(visualize_scalar(value, p.visualize_scale)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::core_types::Vec2;
    use crate::interaction::InteractionSample;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    const W: usize = 8;
    const H: usize = 6;

    fn params() -> ParameterBlock {
        ParameterBlock::new(W as u32, H as u32, &SimulationConfig::default())
    }

    fn grid_from(f: impl Fn(usize, usize) -> Cell) -> Vec<Cell> {
        (0..H).flat_map(|y| (0..W).map(move |x| (x, y))).map(|(x, y)| f(x, y)).collect()
    }

    fn every_cell() -> impl Iterator<Item = (isize, isize)> {
        (0..H as isize).flat_map(|y| (0..W as isize).map(move |x| (x, y)))
    }

    #[test]
    fn test_fetch_clamps_to_edge() {
        let cells = grid_from(|x, y| [x as f32, y as f32]);
        let grid = Grid::new(&cells, W, H);
        assert_eq!(grid.fetch(-3, 2), [0.0, 2.0]);
        assert_eq!(grid.fetch(100, -1), [7.0, 0.0]);
        assert_eq!(grid.fetch(3, 100), [3.0, 5.0]);
    }

    #[test]
    fn test_bilinear_interpolates_linear_field() {
        let cells = grid_from(|x, y| [x as f32 * 2.0, y as f32]);
        let grid = Grid::new(&cells, W, H);
        let s = grid.bilinear(2.25, 3.5);
        assert_relative_eq!(s[0], 4.5, epsilon = 1e-6);
        assert_relative_eq!(s[1], 3.5, epsilon = 1e-6);
        assert_eq!(grid.bilinear(-5.0, 100.0), grid.fetch(0, H as isize - 1));
    }

    #[test]
    fn test_divergence_of_constant_field_is_zero() {
        let cells = vec![[3.5, -1.25]; W * H];
        let grid = Grid::new(&cells, W, H);
        for (x, y) in every_cell() {
            assert_eq!(divergence(&grid, x, y), [0.0, 0.0]);
            assert_eq!(vorticity(&grid, x, y), [0.0, 0.0]);
        }
    }

    #[test]
    fn test_jacobi_zero_input_is_fixed_point() {
        let zeros = vec![[0.0, 0.0]; W * H];
        let grid = Grid::new(&zeros, W, H);
        let p = params();
        for (x, y) in every_cell() {
            assert_eq!(pressure_jacobi(&grid, &grid, x, y, &p), [0.0, 0.0]);
        }
    }

    #[test]
    fn test_jacobi_uses_negative_cell_size_squared() {
        let zeros = vec![[0.0, 0.0]; W * H];
        let ones = vec![[1.0, 0.0]; W * H];
        let mut p = params();
        p.cell_size = 2.0;
        let out = pressure_jacobi(&Grid::new(&zeros, W, H), &Grid::new(&ones, W, H), 3, 3, &p);
        assert_relative_eq!(out[0], -1.0);
    }

    #[test]
    fn test_advect_zero_velocity_only_dissipates() {
        let zeros = vec![[0.0, 0.0]; W * H];
        let density = grid_from(|x, y| [(x + y) as f32, 0.0]);
        let p = params();
        let velocity = Grid::new(&zeros, W, H);
        let source = Grid::new(&density, W, H);
        for (x, y) in every_cell() {
            let out = advect(&velocity, &source, x, y, &p);
            assert_relative_eq!(out[0], p.dissipation * (x + y) as f32);
        }
    }

    #[test]
    fn test_advect_follows_velocity_backwards() {
        let velocity = vec![[1.0, 0.0]; W * H];
        let density = grid_from(|x, _| [x as f32, 0.0]);
        let mut p = params();
        p.dissipation = 1.0;
        let out = advect(&Grid::new(&velocity, W, H), &Grid::new(&density, W, H), 4, 2, &p);
        assert_relative_eq!(out[0], 3.0);
    }

    #[test]
    fn test_falloff_compact_support() {
        assert_eq!(falloff(0.0, 10.0), 1.0);
        assert_relative_eq!(falloff(5.0, 10.0), (-1.0f32).exp());
        assert_eq!(falloff(10.0, 10.0), 0.0);
        assert_eq!(falloff(11.0, 10.0), 0.0);
    }

    #[test]
    fn test_inject_force_adds_impulse() {
        let zeros = vec![[0.0, 0.0]; W * H];
        let grid = Grid::new(&zeros, W, H);
        let mut p = params();
        p.ink_radius = 2.0;
        let sample = InteractionSample::single(Vec2::new(3.0, 3.0), Some(Vec2::new(2.0, 3.0)));
        assert!(p.write_sample(&sample));

        assert_eq!(inject_force_vector(&grid, 3, 3, &p), [1.0, 0.0]);
        let near = inject_force_vector(&grid, 4, 3, &p);
        assert_relative_eq!(near[0], (-1.0f32).exp());
        assert_eq!(inject_force_vector(&grid, 6, 3, &p), [0.0, 0.0]);

        assert_relative_eq!(inject_force_scalar(&grid, 3, 3, &p)[0], 0.8);
        assert_eq!(inject_force_scalar(&grid, 3, 3, &p)[1], 0.0);
    }

    #[test]
    fn test_gradient_subtract_removes_linear_pressure() {
        let pressure = grid_from(|x, _| [x as f32, 0.0]);
        let velocity = vec![[2.0, 0.5]; W * H];
        let out = gradient_subtract(&Grid::new(&pressure, W, H), &Grid::new(&velocity, W, H), 3, 3);
        assert_eq!(out, [1.0, 0.5]);
    }

    #[test]
    fn test_confinement_without_vorticity_is_identity() {
        let velocity = vec![[0.25, -0.5]; W * H];
        let zeros = vec![[0.0, 0.0]; W * H];
        let p = params();
        let out = vorticity_confinement(&Grid::new(&velocity, W, H), &Grid::new(&zeros, W, H), 2, 2, &p);
        assert_eq!(out, [0.25, -0.5]);
    }

    #[test]
    fn test_field_cell_rejects_surface_kernels() {
        let zeros = vec![[0.0, 0.0]; W * H];
        let grid = Grid::new(&zeros, W, H);
        let p = params();
        assert!(field_cell(Kernel::VisualizeScalar, &[grid], 0, 0, &p).is_none());
        assert!(field_cell(Kernel::Divergence, &[grid], 0, 0, &p).is_some());
        // Wrong arity is not evaluated
        assert!(field_cell(Kernel::Advect, &[grid], 0, 0, &p).is_none());
    }

    #[test]
    fn test_visualize_scalar_colours() {
        assert_eq!(visualize_scalar([1.0, 0.0], 1.0), 0xFFFF_FFFF);
        assert_eq!(visualize_scalar([0.0, 0.0], 1.0), 0xFF00_0000);
        assert_eq!(visualize_scalar([-2.0, 0.0], 1.0), 0xFFFF_0000);
    }

    #[test]
    fn test_visualize_vector_hue() {
        // +x is hue 0 (red), brightness saturates
        assert_eq!(visualize_vector([5.0, 0.0], 1.0), 0xFF00_00FF);
        // zero vector is black
        assert_eq!(visualize_vector([0.0, 0.0], 1.0), 0xFF00_0000);
        // a third of the way round is green
        let green = visualize_vector([-0.5, 0.866_025_4], 1.0);
        assert_eq!(green & 0x0000_FF00, 0x0000_FF00);
    }

    #[test]
    fn test_hsv_primaries() {
        let cases = [
            ((0.0, 1.0, 1.0), [1.0, 0.0, 0.0]),
            ((1.0 / 3.0, 1.0, 1.0), [0.0, 1.0, 0.0]),
            ((2.0 / 3.0, 1.0, 1.0), [0.0, 0.0, 1.0]),
            ((0.5, 0.0, 0.25), [0.25, 0.25, 0.25]),
        ];
        for ((h, s, v), expected) in cases {
            let rgb = hsv_to_rgb(h, s, v);
            for (got, want) in rgb.iter().zip(expected) {
                assert_abs_diff_eq!(*got, want, epsilon = 1e-5);
            }
        }
    }
}

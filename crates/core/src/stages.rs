//! Stage descriptors and the per-frame plan
//!
//! A frame is a fixed, ordered list of [`Stage`]s. Each stage names a
//! [`Kernel`], the fields it reads and where it writes. Executing a stage
//! binds the active buffers of its source fields, dispatches the kernel into
//! the write target of its destination field and then swaps that field.

use std::fmt;

use crate::backend::{BufferHandle, ComputeBackend, DispatchTarget, ParamSlot};
use crate::error::BackendError;
use crate::field::{FieldKind, FieldLayout, FluidFields};

/// Per-cell compute kernels of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Semi-Lagrangian advection of a field through the velocity field
    Advect,
    /// Add pointer impulses to a vector field
    InjectForceVector,
    /// Add dye to a scalar field around each pointer
    InjectForceScalar,
    /// Central-difference divergence of velocity
    Divergence,
    /// One Jacobi relaxation step of the pressure Poisson equation
    PressureJacobi,
    /// Curl of velocity
    Vorticity,
    /// Re-inject small-scale rotation lost to numerical dissipation
    VorticityConfinement,
    /// Subtract the pressure gradient from velocity
    GradientSubtract,
    /// Map direction to hue and magnitude to brightness
    VisualizeVector,
    /// Map signed values to grey (positive) and blue (negative)
    VisualizeScalar,
}

impl Kernel {
    /// Every kernel
    pub const ALL: [Self; 10] = [
        Self::Advect,
        Self::InjectForceVector,
        Self::InjectForceScalar,
        Self::Divergence,
        Self::PressureJacobi,
        Self::Vorticity,
        Self::VorticityConfinement,
        Self::GradientSubtract,
        Self::VisualizeVector,
        Self::VisualizeScalar,
    ];

    /// Shader entry point name (also used in logs)
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Advect => "advect",
            Self::InjectForceVector => "inject_force_vector",
            Self::InjectForceScalar => "inject_force_scalar",
            Self::Divergence => "divergence",
            Self::PressureJacobi => "pressure_jacobi",
            Self::Vorticity => "vorticity",
            Self::VorticityConfinement => "vorticity_confinement",
            Self::GradientSubtract => "gradient_subtract",
            Self::VisualizeVector => "visualize_vector",
            Self::VisualizeScalar => "visualize_scalar",
        }
    }

    /// Number of source buffers the kernel reads
    #[must_use]
    pub const fn source_count(self) -> usize {
        match self {
            Self::Advect
            | Self::PressureJacobi
            | Self::VorticityConfinement
            | Self::GradientSubtract => 2,
            Self::InjectForceVector
            | Self::InjectForceScalar
            | Self::Divergence
            | Self::Vorticity
            | Self::VisualizeVector
            | Self::VisualizeScalar => 1,
        }
    }

    /// `true` for kernels that write the presentation surface
    #[must_use]
    pub const fn writes_surface(self) -> bool {
        matches!(self, Self::VisualizeVector | Self::VisualizeScalar)
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Field shown on the presentation surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum View {
    /// Dye density
    #[default]
    Density,
    /// Pressure
    Pressure,
    /// Velocity
    Velocity,
    /// Vorticity
    Vorticity,
}

impl View {
    /// Next view in the cycle density → pressure → velocity → vorticity → density
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Density => Self::Pressure,
            Self::Pressure => Self::Velocity,
            Self::Velocity => Self::Vorticity,
            Self::Vorticity => Self::Density,
        }
    }

    /// Position in the cycle (0..=3)
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Density => 0,
            Self::Pressure => 1,
            Self::Velocity => 2,
            Self::Vorticity => 3,
        }
    }

    /// Field this view displays
    #[must_use]
    pub const fn field(self) -> FieldKind {
        match self {
            Self::Density => FieldKind::Density,
            Self::Pressure => FieldKind::Pressure,
            Self::Velocity => FieldKind::Velocity,
            Self::Vorticity => FieldKind::Vorticity,
        }
    }

    /// Visualizer matching the displayed field's layout
    #[must_use]
    pub const fn visualizer(self) -> Kernel {
        match self.field().layout() {
            FieldLayout::Vector2 => Kernel::VisualizeVector,
            FieldLayout::Scalar => Kernel::VisualizeScalar,
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field().label())
    }
}

/// Where a stage writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Write target of a field, swapped afterwards
    Field(FieldKind),
    /// Presentation surface
    Surface,
}

/// One kernel dispatch in the frame plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// Kernel to run
    pub kernel: Kernel,
    /// Fields whose active buffers are bound as sources, in binding order
    pub sources: &'static [FieldKind],
    /// Output
    pub destination: Destination,
}

impl Stage {
    const fn new(kernel: Kernel, sources: &'static [FieldKind], destination: FieldKind) -> Self {
        Self {
            kernel,
            sources,
            destination: Destination::Field(destination),
        }
    }
}

const ADVECT_VELOCITY: Stage = Stage::new(
    Kernel::Advect,
    &[FieldKind::Velocity, FieldKind::Velocity],
    FieldKind::Velocity,
);
const ADVECT_DENSITY: Stage = Stage::new(
    Kernel::Advect,
    &[FieldKind::Velocity, FieldKind::Density],
    FieldKind::Density,
);
const INJECT_VELOCITY: Stage = Stage::new(
    Kernel::InjectForceVector,
    &[FieldKind::Velocity],
    FieldKind::Velocity,
);
const INJECT_DENSITY: Stage = Stage::new(
    Kernel::InjectForceScalar,
    &[FieldKind::Density],
    FieldKind::Density,
);
const VORTICITY: Stage = Stage::new(
    Kernel::Vorticity,
    &[FieldKind::Velocity],
    FieldKind::Vorticity,
);
const CONFINEMENT: Stage = Stage::new(
    Kernel::VorticityConfinement,
    &[FieldKind::Velocity, FieldKind::Vorticity],
    FieldKind::Velocity,
);
const DIVERGENCE: Stage = Stage::new(
    Kernel::Divergence,
    &[FieldKind::Velocity],
    FieldKind::Divergence,
);
const JACOBI: Stage = Stage::new(
    Kernel::PressureJacobi,
    &[FieldKind::Pressure, FieldKind::Divergence],
    FieldKind::Pressure,
);
const GRADIENT_SUBTRACT: Stage = Stage::new(
    Kernel::GradientSubtract,
    &[FieldKind::Pressure, FieldKind::Velocity],
    FieldKind::Velocity,
);

const fn visualize(view: View) -> Stage {
    let sources: &'static [FieldKind] = match view {
        View::Density => &[FieldKind::Density],
        View::Pressure => &[FieldKind::Pressure],
        View::Velocity => &[FieldKind::Velocity],
        View::Vorticity => &[FieldKind::Vorticity],
    };
    Stage {
        kernel: view.visualizer(),
        sources,
        destination: Destination::Surface,
    }
}

/// Ordered stages of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    stages: Vec<Stage>,
}

impl FramePlan {
    /// Build the plan for one frame.
    ///
    /// Order: advect velocity, advect density, inject force (only while a
    /// pointer is active), vorticity, confinement, divergence, Jacobi ×
    /// `pressure_iterations`, gradient subtraction, visualize.
    #[must_use]
    pub fn build(pointer_active: bool, pressure_iterations: u32, view: View) -> Self {
        let mut stages = Vec::with_capacity(pressure_iterations as usize + 9);
        stages.push(ADVECT_VELOCITY);
        stages.push(ADVECT_DENSITY);
        if pointer_active {
            stages.push(INJECT_VELOCITY);
            stages.push(INJECT_DENSITY);
        }
        stages.push(VORTICITY);
        stages.push(CONFINEMENT);
        stages.push(DIVERGENCE);
        stages.extend(std::iter::repeat_n(JACOBI, pressure_iterations as usize));
        stages.push(GRADIENT_SUBTRACT);
        stages.push(visualize(view));
        Self { stages }
    }

    /// Stages in execution order
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// `true` for an empty plan (never produced by [`FramePlan::build`])
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Dispatch one stage and swap its destination field.
///
/// The destination is only swapped when the dispatch was accepted.
///
/// # Errors
///
/// Returns the backend's dispatch error unchanged.
pub fn apply_stage(
    backend: &dyn ComputeBackend,
    fields: &mut FluidFields,
    stage: &Stage,
    params: ParamSlot,
) -> Result<(), BackendError> {
    let mut bound = [BufferHandle(0); 2];
    for (slot, kind) in bound.iter_mut().zip(stage.sources) {
        *slot = fields.get(*kind).read();
    }
    let sources = &bound[..stage.sources.len().min(bound.len())];

    match stage.destination {
        Destination::Field(kind) => {
            let target = fields.get(kind).write_target();
            backend.dispatch_kernel(
                stage.kernel,
                sources,
                Some(params),
                DispatchTarget::Buffer(target),
            )?;
            fields.get_mut(kind).swap();
        }
        Destination::Surface => {
            backend.dispatch_kernel(stage.kernel, sources, Some(params), DispatchTarget::Surface)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernels(plan: &FramePlan) -> Vec<Kernel> {
        plan.stages().iter().map(|s| s.kernel).collect()
    }

    #[test]
    fn test_plan_order_with_pointer() {
        let plan = FramePlan::build(true, 2, View::Density);
        assert_eq!(
            kernels(&plan),
            vec![
                Kernel::Advect,
                Kernel::Advect,
                Kernel::InjectForceVector,
                Kernel::InjectForceScalar,
                Kernel::Vorticity,
                Kernel::VorticityConfinement,
                Kernel::Divergence,
                Kernel::PressureJacobi,
                Kernel::PressureJacobi,
                Kernel::GradientSubtract,
                Kernel::VisualizeScalar,
            ]
        );
        assert_eq!(plan.stages()[0].destination, Destination::Field(FieldKind::Velocity));
        assert_eq!(plan.stages()[1].destination, Destination::Field(FieldKind::Density));
        assert_eq!(plan.stages()[10].destination, Destination::Surface);
    }

    #[test]
    fn test_plan_without_pointer_skips_injection() {
        let plan = FramePlan::build(false, 40, View::Velocity);
        assert_eq!(plan.len(), 2 + 3 + 40 + 2);
        assert!(!kernels(&plan)
            .iter()
            .any(|k| matches!(k, Kernel::InjectForceVector | Kernel::InjectForceScalar)));
        assert_eq!(
            plan.stages().last().map(|s| s.kernel),
            Some(Kernel::VisualizeVector)
        );
    }

    #[test]
    fn test_zero_iterations_has_no_jacobi() {
        let plan = FramePlan::build(false, 0, View::Density);
        assert!(!kernels(&plan).contains(&Kernel::PressureJacobi));
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_stage_sources_match_kernel_arity() {
        for view in [View::Density, View::Pressure, View::Velocity, View::Vorticity] {
            for stage in FramePlan::build(true, 1, view).stages() {
                assert_eq!(stage.sources.len(), stage.kernel.source_count(), "{stage:?}");
                assert_eq!(
                    stage.kernel.writes_surface(),
                    stage.destination == Destination::Surface
                );
            }
        }
    }

    #[test]
    fn test_view_cycle_and_visualizer() {
        let mut view = View::default();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push((view.index(), view.visualizer()));
            view = view.next();
        }
        assert_eq!(view, View::Density);
        assert_eq!(
            seen,
            vec![
                (0, Kernel::VisualizeScalar),
                (1, Kernel::VisualizeScalar),
                (2, Kernel::VisualizeVector),
                (3, Kernel::VisualizeScalar),
            ]
        );
    }

    #[test]
    fn test_kernel_display() {
        assert_eq!(Kernel::VorticityConfinement.to_string(), "vorticity_confinement");
        assert_eq!(View::Pressure.to_string(), "pressure");
    }
}

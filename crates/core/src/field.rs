//! Double-buffered simulation fields
//!
//! A [`Field`] owns two backend buffers of identical size. One is active (the
//! one stages read) and the other is the write target; [`Field::swap`] flips
//! which is which after a stage has written the target. Every cell holds two
//! `f32` components in row-major order (`y * width + x`). Scalar fields use
//! the first component only.

use crate::backend::{BufferHandle, ComputeBackend};
use crate::config::Precision;
use crate::error::BackendError;

/// Number of components a field stores per cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldLayout {
    /// One meaningful component (density, pressure, divergence, vorticity)
    Scalar,
    /// Two components (velocity)
    Vector2,
}

/// Size, layout and precision of one field buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    /// Debug label forwarded to the backend
    pub label: &'static str,
    /// Grid width in cells
    pub width: u32,
    /// Grid height in cells
    pub height: u32,
    /// Component layout
    pub layout: FieldLayout,
    /// Storage precision
    pub precision: Precision,
}

impl FieldDescriptor {
    /// Number of cells in the grid
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A ping-pong pair of buffers
#[derive(Debug)]
pub struct Field {
    descriptor: FieldDescriptor,
    buffers: [BufferHandle; 2],
    active: usize,
}

impl Field {
    /// Allocate both buffers on the backend, zero-initialised.
    ///
    /// # Errors
    ///
    /// Returns the backend error if either allocation fails; a buffer that
    /// was already created is released again.
    pub fn create(
        backend: &dyn ComputeBackend,
        descriptor: FieldDescriptor,
    ) -> Result<Self, BackendError> {
        let first = backend.create_field(&descriptor)?;
        let second = match backend.create_field(&descriptor) {
            Ok(handle) => handle,
            Err(e) => {
                backend.destroy_field(first);
                return Err(e);
            }
        };
        Ok(Self::from_buffers(descriptor, [first, second]))
    }

    /// Wrap two existing buffers; the first becomes active.
    #[must_use]
    pub fn from_buffers(descriptor: FieldDescriptor, buffers: [BufferHandle; 2]) -> Self {
        Self {
            descriptor,
            buffers,
            active: 0,
        }
    }

    /// Handle of the active buffer (the one stages read)
    #[inline]
    #[must_use]
    pub fn read(&self) -> BufferHandle {
        self.buffers[self.active]
    }

    /// Handle of the inactive buffer (the one the next stage writes)
    #[inline]
    #[must_use]
    pub fn write_target(&self) -> BufferHandle {
        self.buffers[1 - self.active]
    }

    /// Make the write target active.
    #[inline]
    pub fn swap(&mut self) {
        self.active = 1 - self.active;
    }

    /// Index (0 or 1) of the active buffer
    #[must_use]
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Size, layout and precision
    #[must_use]
    pub fn descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    /// Grid `(width, height)` in cells
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.descriptor.width, self.descriptor.height)
    }

    /// Component layout
    #[must_use]
    pub fn layout(&self) -> FieldLayout {
        self.descriptor.layout
    }

    /// Release both buffers.
    pub fn destroy(self, backend: &dyn ComputeBackend) {
        for handle in self.buffers {
            backend.destroy_field(handle);
        }
    }
}

/// The five fields of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Velocity (vector)
    Velocity,
    /// Dye density (scalar)
    Density,
    /// Velocity divergence (scalar)
    Divergence,
    /// Curl of velocity (scalar)
    Vorticity,
    /// Pressure (scalar)
    Pressure,
}

impl FieldKind {
    /// All kinds in allocation order
    pub const ALL: [Self; 5] = [
        Self::Velocity,
        Self::Density,
        Self::Divergence,
        Self::Vorticity,
        Self::Pressure,
    ];

    /// Component layout of this field
    #[must_use]
    pub const fn layout(self) -> FieldLayout {
        match self {
            Self::Velocity => FieldLayout::Vector2,
            Self::Density | Self::Divergence | Self::Vorticity | Self::Pressure => {
                FieldLayout::Scalar
            }
        }
    }

    /// Debug label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Velocity => "velocity",
            Self::Density => "density",
            Self::Divergence => "divergence",
            Self::Vorticity => "vorticity",
            Self::Pressure => "pressure",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Velocity => 0,
            Self::Density => 1,
            Self::Divergence => 2,
            Self::Vorticity => 3,
            Self::Pressure => 4,
        }
    }
}

/// All five fields of one simulation, indexed by [`FieldKind`]
#[derive(Debug)]
pub struct FluidFields {
    // Indexed by `FieldKind::index`
    fields: Vec<Field>,
}

impl FluidFields {
    /// Allocate every field at the given grid size.
    ///
    /// # Errors
    ///
    /// Returns the first allocation error; fields created before it are
    /// released.
    pub fn create(
        backend: &dyn ComputeBackend,
        width: u32,
        height: u32,
        precision: Precision,
    ) -> Result<Self, BackendError> {
        let mut fields = Vec::with_capacity(FieldKind::ALL.len());
        for kind in FieldKind::ALL {
            let descriptor = FieldDescriptor {
                label: kind.label(),
                width,
                height,
                layout: kind.layout(),
                precision,
            };
            match Field::create(backend, descriptor) {
                Ok(field) => fields.push(field),
                Err(e) => {
                    for field in fields {
                        field.destroy(backend);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { fields })
    }

    /// Field of the given kind
    #[must_use]
    pub fn get(&self, kind: FieldKind) -> &Field {
        &self.fields[kind.index()]
    }

    /// Mutable field of the given kind
    pub fn get_mut(&mut self, kind: FieldKind) -> &mut Field {
        &mut self.fields[kind.index()]
    }

    /// Grid `(width, height)` shared by all fields
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.fields[0].dimensions()
    }

    /// Release every buffer.
    pub fn destroy(self, backend: &dyn ComputeBackend) {
        for field in self.fields {
            field.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn descriptor() -> FieldDescriptor {
        FieldDescriptor {
            label: "test",
            width: 4,
            height: 3,
            layout: FieldLayout::Scalar,
            precision: Precision::Float32,
        }
    }

    #[test]
    fn test_swap_is_its_own_inverse() {
        let mut field = Field::from_buffers(descriptor(), [BufferHandle(7), BufferHandle(9)]);
        let read = field.read();
        let write = field.write_target();
        assert_ne!(read, write);

        field.swap();
        assert_eq!(field.read(), write);
        assert_eq!(field.write_target(), read);

        field.swap();
        assert_eq!(field.read(), read);
        assert_eq!(field.write_target(), write);
        assert_eq!(field.active_index(), 0);
    }

    #[test]
    fn test_create_allocates_two_buffers() {
        let backend = CpuBackend::new();
        let field = Field::create(&backend, descriptor()).unwrap();
        assert_ne!(field.read(), field.write_target());
        assert_eq!(field.dimensions(), (4, 3));
        assert_eq!(field.descriptor().cell_count(), 12);

        let data = backend.read_field(field.read()).unwrap();
        assert_eq!(data.len(), 12);
        assert!(data.iter().all(|c| *c == [0.0, 0.0]));

        let (a, b) = (field.read(), field.write_target());
        field.destroy(&backend);
        assert!(backend.read_field(a).is_err());
        assert!(backend.read_field(b).is_err());
    }

    #[test]
    fn test_fluid_fields_layouts() {
        let backend = CpuBackend::new();
        let fields = FluidFields::create(&backend, 8, 8, Precision::Float16).unwrap();
        assert_eq!(fields.get(FieldKind::Velocity).layout(), FieldLayout::Vector2);
        for kind in [
            FieldKind::Density,
            FieldKind::Divergence,
            FieldKind::Vorticity,
            FieldKind::Pressure,
        ] {
            assert_eq!(fields.get(kind).layout(), FieldLayout::Scalar);
            assert_eq!(fields.get(kind).descriptor().label, kind.label());
        }
        assert_eq!(fields.dimensions(), (8, 8));
        fields.destroy(&backend);
    }
}

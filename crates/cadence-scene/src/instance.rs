//! Placed mesh occurrences with lazily refreshed transforms.

use cadence_core::{compose_transform, MaterialId, Mesh};
use glam::{Mat4, Quat, Vec3};

use crate::geometry_batch::BatchReservation;

/// One placed occurrence of a mesh inside a geometry batch.
///
/// Setters only mark the transform stale. The transform is recomputed on the
/// next draw and copied to each frame slot's storage the first time that
/// slot is drawn after the change.
#[derive(Clone, Debug)]
pub struct Instance {
    position: Vec3,
    size: Vec3,
    rotation: Quat,
    transform: Mat4,
    stale: bool,
    copied: Vec<bool>,
    material: MaterialId,
    index_count: u32,
    reservation: BatchReservation,
}

impl Instance {
    /// Create an instance whose transform is already present in every
    /// slot's storage.
    pub(crate) fn new(mesh: &Mesh, reservation: BatchReservation, frames_in_flight: usize) -> Self {
        Self {
            position: mesh.position,
            size: mesh.size,
            rotation: mesh.rotation,
            transform: compose_transform(mesh.position, mesh.size, mesh.rotation),
            stale: false,
            copied: vec![true; frames_in_flight],
            material: mesh.material,
            index_count: mesh.index_count(),
            reservation,
        }
    }

    pub const fn position(&self) -> Vec3 {
        self.position
    }

    pub const fn size(&self) -> Vec3 {
        self.size
    }

    pub const fn rotation(&self) -> Quat {
        self.rotation
    }

    pub const fn material(&self) -> MaterialId {
        self.material
    }

    pub const fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Where the mesh lives inside its batch.
    pub const fn reservation(&self) -> BatchReservation {
        self.reservation
    }

    /// Last computed transform. May lag behind the setters until the next draw.
    pub const fn transform(&self) -> Mat4 {
        self.transform
    }

    /// Whether a setter ran since the transform was last computed.
    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    /// Whether `slot`'s storage holds the latest transform.
    pub fn is_copied(&self, slot: usize) -> bool {
        self.copied.get(slot).copied().unwrap_or(false)
    }

    /// Move the instance. Setting the current value does nothing.
    pub fn set_position(&mut self, position: Vec3) {
        if self.position != position {
            self.position = position;
            self.invalidate();
        }
    }

    /// Scale the instance. Setting the current value does nothing.
    pub fn set_size(&mut self, size: Vec3) {
        if self.size != size {
            self.size = size;
            self.invalidate();
        }
    }

    /// Rotate the instance. Setting the current value does nothing.
    pub fn set_rotation(&mut self, rotation: Quat) {
        if self.rotation != rotation {
            self.rotation = rotation;
            self.invalidate();
        }
    }

    fn invalidate(&mut self) {
        self.stale = true;
        self.copied.fill(false);
    }

    /// Transform to write into `slot`'s storage, if that slot is behind.
    ///
    /// Recomputes the transform at most once per change.
    pub(crate) fn take_pending_copy(&mut self, slot: usize) -> Option<Mat4> {
        if self.stale {
            self.transform = compose_transform(self.position, self.size, self.rotation);
            self.stale = false;
        }

        match self.copied.get_mut(slot) {
            Some(copied) if !*copied => {
                *copied = true;
                Some(self.transform)
            }
            _ => None,
        }
    }
}

//! Mesh and material types shared by the GPU layers.

use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3};

use crate::error::{Error, Result};

/// Identifier of a material registered with the material registry.
///
/// Material 0 is always the default material.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MaterialId(pub u32);

impl MaterialId {
    /// The default material, created together with the registry.
    pub const DEFAULT: Self = Self(0);

    /// Index of the material inside the registry.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single mesh vertex as laid out in the shared vertex buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub normal: [f32; 3],
}

impl Vertex {
    /// Size of one vertex in bytes.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub const fn new(pos: [f32; 3], color: [f32; 3], normal: [f32; 3]) -> Self {
        Self { pos, color, normal }
    }
}

/// Byte footprint of a mesh inside a geometry batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshFootprint {
    /// Bytes of vertex data.
    pub vertex_bytes: u64,
    /// Bytes of index data.
    pub index_bytes: u64,
}

impl MeshFootprint {
    pub const fn new(vertex_bytes: u64, index_bytes: u64) -> Self {
        Self {
            vertex_bytes,
            index_bytes,
        }
    }
}

/// CPU-side mesh data plus its initial placement in the world.
///
/// Indices are local to the mesh (they start at 0); the batch that stores
/// the mesh supplies the base vertex at draw time.
#[derive(Clone, Debug)]
pub struct Mesh {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    /// Initial world position.
    pub position: Vec3,
    /// Initial per-axis scale.
    pub size: Vec3,
    /// Initial rotation.
    pub rotation: Quat,
    /// Material used to draw the mesh.
    pub material: MaterialId,
}

impl Mesh {
    /// Create a triangle-list mesh.
    ///
    /// Fails if either array is empty, if the index count is not a multiple
    /// of three, or if any index points past the vertex array.
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self> {
        if vertices.is_empty() {
            return Err(Error::InvalidMesh("mesh has no vertices".to_string()));
        }
        if indices.is_empty() {
            return Err(Error::InvalidMesh("mesh has no indices".to_string()));
        }
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidMesh(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(Error::InvalidMesh(format!(
                "index {bad} out of range for {} vertices",
                vertices.len()
            )));
        }

        Ok(Self {
            vertices,
            indices,
            position: Vec3::ZERO,
            size: Vec3::ONE,
            rotation: Quat::IDENTITY,
            material: MaterialId::DEFAULT,
        })
    }

    /// Set the initial world position.
    #[must_use]
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Set the initial scale.
    #[must_use]
    pub fn with_size(mut self, size: Vec3) -> Self {
        self.size = size;
        self
    }

    /// Set the initial rotation.
    #[must_use]
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the material.
    #[must_use]
    pub fn with_material(mut self, material: MaterialId) -> Self {
        self.material = material;
        self
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Number of indices, as passed to an indexed draw.
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    /// Vertex data as raw bytes.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index data as raw bytes.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Bytes this mesh occupies in a batch's vertex and index buffers.
    pub fn footprint(&self) -> MeshFootprint {
        MeshFootprint::new(
            self.vertices.len() as u64 * Vertex::SIZE,
            self.indices.len() as u64 * std::mem::size_of::<u32>() as u64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Vec<Vertex> {
        vec![
            Vertex::new([0.0, 0.0, 0.0], [1.0; 3], [0.0, 0.0, 1.0]),
            Vertex::new([1.0, 0.0, 0.0], [1.0; 3], [0.0, 0.0, 1.0]),
            Vertex::new([0.0, 1.0, 0.0], [1.0; 3], [0.0, 0.0, 1.0]),
        ]
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(Vertex::SIZE, 36);
    }

    #[test]
    fn footprint_counts_bytes() {
        let mesh = Mesh::new(triangle(), vec![0, 1, 2]).unwrap();
        assert_eq!(mesh.footprint(), MeshFootprint::new(108, 12));
        assert_eq!(mesh.vertex_bytes().len(), 108);
        assert_eq!(mesh.index_bytes().len(), 12);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let err = Mesh::new(triangle(), vec![0, 1, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidMesh(_)));
    }

    #[test]
    fn rejects_partial_triangle() {
        assert!(Mesh::new(triangle(), vec![0, 1]).is_err());
        assert!(Mesh::new(Vec::new(), vec![0, 1, 2]).is_err());
        assert!(Mesh::new(triangle(), Vec::new()).is_err());
    }

    #[test]
    fn builder_sets_placement() {
        let mesh = Mesh::new(triangle(), vec![0, 1, 2])
            .unwrap()
            .with_position(Vec3::X)
            .with_size(Vec3::splat(3.0))
            .with_material(MaterialId(4));
        assert_eq!(mesh.position, Vec3::X);
        assert_eq!(mesh.size, Vec3::splat(3.0));
        assert_eq!(mesh.material, MaterialId(4));
        assert_eq!(mesh.rotation, Quat::IDENTITY);
    }
}

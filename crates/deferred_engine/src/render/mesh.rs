//! GPU meshes
//!
//! A [`Mesh`] owns its vertex and index buffers on a device and optionally
//! shares a [`Material`]. Meshes are referenced, never owned, by the render
//! lists handed to renderers.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::Vec3;
use crate::render::gfx::{BufferUsage, GfxError, GfxResult, GraphicsDevice, MeshBuffers};
use crate::render::material::Material;
use crate::render::pipeline::{VertexFormat, VertexLayout};

/// Interleaved vertex consumed by both renderers
///
/// `#[repr(C)]` with only `f32` fields, so the byte layout is the field order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Position in 3D space
    pub position: [f32; 3],
    /// Vertex colour
    pub colour: [f32; 4],
    /// Texture coordinates
    pub tex_coord: [f32; 2],
    /// Normal vector
    pub normal: [f32; 3],
    /// Tangent vector for normal mapping
    pub tangent: [f32; 3],
}

impl Vertex {
    /// Create a white vertex without tangent
    pub fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            colour: [1.0; 4],
            tex_coord,
            normal,
            tangent: [0.0; 3],
        }
    }

    /// Input layout matching the field order, locations 0 to 4
    pub fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Self>() as u32)
            .attribute(0, VertexFormat::Float3, 0)
            .attribute(1, VertexFormat::Float4, 12)
            .attribute(2, VertexFormat::Float2, 28)
            .attribute(3, VertexFormat::Float3, 36)
            .attribute(4, VertexFormat::Float3, 48)
    }
}

/// Geometry resident on a device
#[derive(Debug)]
pub struct Mesh {
    buffers: MeshBuffers,
    bounding_radius: f32,
    material: Option<Arc<Material>>,
}

impl Mesh {
    /// Upload vertices and 32-bit indices
    pub fn upload(device: &mut dyn GraphicsDevice, vertices: &[Vertex], indices: &[u32]) -> GfxResult<Self> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(GfxError::InvalidDescription("mesh needs vertices and indices".into()));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(GfxError::InvalidDescription(format!(
                "index {bad} out of range for {} vertices",
                vertices.len()
            )));
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);

        let vertex_buffer = device.create_buffer(BufferUsage::Vertex, vertex_bytes.len() as u64)?;
        device.write_buffer(vertex_buffer, 0, vertex_bytes)?;
        let index_buffer = device.create_buffer(BufferUsage::Index, index_bytes.len() as u64)?;
        device.write_buffer(index_buffer, 0, index_bytes)?;

        let bounding_radius = vertices
            .iter()
            .map(|v| Vec3::from(v.position).norm())
            .fold(0.0_f32, f32::max);

        Ok(Self {
            buffers: MeshBuffers {
                vertex_buffer,
                index_buffer,
                index_count: indices.len() as u32,
            },
            bounding_radius,
            material: None,
        })
    }

    /// Two-triangle quad covering clip space, used by full-screen passes
    pub fn screen_quad(device: &mut dyn GraphicsDevice) -> GfxResult<Self> {
        let normal = [0.0, 0.0, 1.0];
        let vertices = [
            Vertex::new([-1.0, -1.0, 0.0], normal, [0.0, 0.0]),
            Vertex::new([1.0, -1.0, 0.0], normal, [1.0, 0.0]),
            Vertex::new([1.0, 1.0, 0.0], normal, [1.0, 1.0]),
            Vertex::new([-1.0, 1.0, 0.0], normal, [0.0, 1.0]),
        ];
        Self::upload(device, &vertices, &[0, 1, 2, 2, 3, 0])
    }

    /// Unit cube centred on the origin
    pub fn cube(device: &mut dyn GraphicsDevice) -> GfxResult<Self> {
        let faces: [([f32; 3], [[f32; 3]; 4]); 6] = [
            ([0.0, 0.0, 1.0], [[-1.0, -1.0, 1.0], [1.0, -1.0, 1.0], [1.0, 1.0, 1.0], [-1.0, 1.0, 1.0]]),
            ([0.0, 0.0, -1.0], [[1.0, -1.0, -1.0], [-1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [1.0, 1.0, -1.0]]),
            ([-1.0, 0.0, 0.0], [[-1.0, -1.0, -1.0], [-1.0, -1.0, 1.0], [-1.0, 1.0, 1.0], [-1.0, 1.0, -1.0]]),
            ([1.0, 0.0, 0.0], [[1.0, -1.0, 1.0], [1.0, -1.0, -1.0], [1.0, 1.0, -1.0], [1.0, 1.0, 1.0]]),
            ([0.0, 1.0, 0.0], [[-1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, -1.0], [-1.0, 1.0, -1.0]]),
            ([0.0, -1.0, 0.0], [[-1.0, -1.0, -1.0], [1.0, -1.0, -1.0], [1.0, -1.0, 1.0], [-1.0, -1.0, 1.0]]),
        ];
        let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, corners) in faces {
            let base = vertices.len() as u32;
            for (corner, uv) in corners.iter().zip(uvs) {
                vertices.push(Vertex::new(*corner, normal, uv));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
        Self::upload(device, &vertices, &indices)
    }

    /// Share a material with this mesh
    pub fn with_material(mut self, material: Arc<Material>) -> Self {
        self.material = Some(material);
        self
    }

    /// Buffers to draw from
    pub fn buffers(&self) -> &MeshBuffers {
        &self.buffers
    }

    /// Radius of the bounding sphere around the local origin
    pub fn bounding_radius(&self) -> f32 {
        self.bounding_radius
    }

    /// Material, if any
    pub fn material(&self) -> Option<&Arc<Material>> {
        self.material.as_ref()
    }

    /// Release the GPU buffers
    pub fn destroy(self, device: &mut dyn GraphicsDevice) -> GfxResult<()> {
        device.destroy_buffer(self.buffers.vertex_buffer)?;
        device.destroy_buffer(self.buffers.index_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessConfig;
    use crate::render::backends::headless::HeadlessDevice;
    use crate::render::gfx::Extent2D;
    use approx::assert_relative_eq;

    #[test]
    fn test_vertex_layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.stride as usize, std::mem::size_of::<Vertex>());
        assert_eq!(layout.stride, 60);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_upload_and_destroy() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(8, 8));
        let mesh = Mesh::cube(&mut device).unwrap();
        assert_eq!(mesh.buffers().index_count, 36);
        assert_relative_eq!(mesh.bounding_radius(), 3.0_f32.sqrt(), epsilon = 1e-6);
        assert_eq!(device.live_objects().buffers, 2);

        let indices = device.buffer_contents(mesh.buffers().index_buffer).unwrap();
        assert_eq!(indices.len(), 36 * 4);

        mesh.destroy(&mut device).unwrap();
        assert_eq!(device.live_objects().buffers, 0);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default(), Extent2D::new(8, 8));
        let v = Vertex::new([0.0; 3], [0.0, 0.0, 1.0], [0.0; 2]);
        assert!(Mesh::upload(&mut device, &[v], &[0, 1, 0]).is_err());
        assert_eq!(device.live_objects().buffers, 0);
    }
}

//! Mesh data and its GPU counterpart

use crate::backend::traits::RenderDevice;
use crate::backend::types::ConstantBufferData;
use crate::error::{RhiError, RhiResult};
use crate::handle::*;
use crate::rhi::Rhi;
use crate::IndexWidth;
use glam::{Mat4, Vec2, Vec3};
use slotmap::Key;

/// Triangle mesh in system memory, one array per vertex attribute
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl MeshData {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn push_vertex(&mut self, position: Vec3, normal: Vec3, uv: Vec2) {
        self.positions.push(position);
        self.normals.push(normal);
        self.uvs.push(uv);
    }

    /// Single triangle facing -Z, clockwise as seen from a camera looking down +Z
    pub fn triangle() -> Self {
        let mut mesh = MeshData::new("triangle");
        mesh.push_vertex(Vec3::new(0.0, 0.5, 0.0), -Vec3::Z, Vec2::new(0.5, 0.0));
        mesh.push_vertex(Vec3::new(0.5, -0.5, 0.0), -Vec3::Z, Vec2::new(1.0, 1.0));
        mesh.push_vertex(Vec3::new(-0.5, -0.5, 0.0), -Vec3::Z, Vec2::new(0.0, 1.0));
        mesh.indices.extend_from_slice(&[0, 1, 2]);
        mesh
    }

    /// Unit cube centered at the origin.
    ///
    /// Faces are clockwise seen from outside in the left-handed view space
    /// the engine renders with.
    pub fn cube() -> Self {
        let mut mesh = MeshData::new("cube");

        let faces = [
            // Front face
            [
                (Vec3::new(-0.5, -0.5, 0.5), Vec3::Z, Vec2::new(0.0, 1.0)),
                (Vec3::new(0.5, -0.5, 0.5), Vec3::Z, Vec2::new(1.0, 1.0)),
                (Vec3::new(0.5, 0.5, 0.5), Vec3::Z, Vec2::new(1.0, 0.0)),
                (Vec3::new(-0.5, 0.5, 0.5), Vec3::Z, Vec2::new(0.0, 0.0)),
            ],
            // Back face
            [
                (Vec3::new(0.5, -0.5, -0.5), -Vec3::Z, Vec2::new(0.0, 1.0)),
                (Vec3::new(-0.5, -0.5, -0.5), -Vec3::Z, Vec2::new(1.0, 1.0)),
                (Vec3::new(-0.5, 0.5, -0.5), -Vec3::Z, Vec2::new(1.0, 0.0)),
                (Vec3::new(0.5, 0.5, -0.5), -Vec3::Z, Vec2::new(0.0, 0.0)),
            ],
            // Right face
            [
                (Vec3::new(0.5, -0.5, 0.5), Vec3::X, Vec2::new(0.0, 1.0)),
                (Vec3::new(0.5, -0.5, -0.5), Vec3::X, Vec2::new(1.0, 1.0)),
                (Vec3::new(0.5, 0.5, -0.5), Vec3::X, Vec2::new(1.0, 0.0)),
                (Vec3::new(0.5, 0.5, 0.5), Vec3::X, Vec2::new(0.0, 0.0)),
            ],
            // Left face
            [
                (Vec3::new(-0.5, -0.5, -0.5), -Vec3::X, Vec2::new(0.0, 1.0)),
                (Vec3::new(-0.5, -0.5, 0.5), -Vec3::X, Vec2::new(1.0, 1.0)),
                (Vec3::new(-0.5, 0.5, 0.5), -Vec3::X, Vec2::new(1.0, 0.0)),
                (Vec3::new(-0.5, 0.5, -0.5), -Vec3::X, Vec2::new(0.0, 0.0)),
            ],
            // Top face
            [
                (Vec3::new(-0.5, 0.5, 0.5), Vec3::Y, Vec2::new(0.0, 1.0)),
                (Vec3::new(0.5, 0.5, 0.5), Vec3::Y, Vec2::new(1.0, 1.0)),
                (Vec3::new(0.5, 0.5, -0.5), Vec3::Y, Vec2::new(1.0, 0.0)),
                (Vec3::new(-0.5, 0.5, -0.5), Vec3::Y, Vec2::new(0.0, 0.0)),
            ],
            // Bottom face
            [
                (Vec3::new(-0.5, -0.5, -0.5), -Vec3::Y, Vec2::new(0.0, 1.0)),
                (Vec3::new(0.5, -0.5, -0.5), -Vec3::Y, Vec2::new(1.0, 1.0)),
                (Vec3::new(0.5, -0.5, 0.5), -Vec3::Y, Vec2::new(1.0, 0.0)),
                (Vec3::new(-0.5, -0.5, 0.5), -Vec3::Y, Vec2::new(0.0, 0.0)),
            ],
        ];

        for (face, corners) in faces.into_iter().enumerate() {
            for (position, normal, uv) in corners {
                mesh.push_vertex(position, normal, uv);
            }
            let base = face as u32 * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }
}

/// Most vertices a mesh may have with 16-bit indices
pub const MAX_U16_VERTICES: u64 = 65_535;

/// A mesh uploaded through the RHI.
///
/// Holds handles only; the RHI owns the buffers and texture behind them.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub name: String,
    pub position_buffer: VertexBufferHandle,
    pub normal_buffer: VertexBufferHandle,
    pub uv_buffer: VertexBufferHandle,
    pub index_buffer: IndexBufferHandle,
    pub constant_buffer: ConstantBufferHandle,
    pub diffuse_texture: Texture2DHandle,
    pub face_count: u32,
    pub model: Mat4,
}

impl Mesh {
    /// Default placement, one unit in front of the origin
    pub fn default_model() -> Mat4 {
        Mat4::from_translation(Vec3::new(0.0, 0.0, 1.0))
    }

    /// Create the vertex streams, index buffer and constant buffer for `data`
    pub fn upload<D: RenderDevice>(
        rhi: &mut Rhi<D>,
        data: &MeshData,
        diffuse_texture: Texture2DHandle,
    ) -> RhiResult<Self> {
        let vertex_count = data.vertex_count();
        if data.normals.len() != vertex_count || data.uvs.len() != vertex_count {
            return Err(RhiError::creation(
                "mesh",
                format!(
                    "{}: attribute counts differ ({} positions, {} normals, {} uvs)",
                    data.name,
                    vertex_count,
                    data.normals.len(),
                    data.uvs.len()
                ),
            ));
        }
        if data.indices.len() % 3 != 0 {
            return Err(RhiError::creation(
                "mesh",
                format!(
                    "{}: index count {} is not a whole number of triangles",
                    data.name,
                    data.indices.len()
                ),
            ));
        }
        let width = rhi.config().index_width;
        if width == IndexWidth::U16 && vertex_count as u64 > MAX_U16_VERTICES {
            return Err(RhiError::IndexOverflow {
                index: vertex_count as u64 - 1,
                max: MAX_U16_VERTICES - 1,
            });
        }

        let mut mesh = Self {
            name: data.name.clone(),
            position_buffer: VertexBufferHandle::default(),
            normal_buffer: VertexBufferHandle::default(),
            uv_buffer: VertexBufferHandle::default(),
            index_buffer: IndexBufferHandle::default(),
            constant_buffer: ConstantBufferHandle::default(),
            diffuse_texture,
            face_count: data.triangle_count() as u32,
            model: Self::default_model(),
        };
        if let Err(e) = mesh.create_buffers(rhi, data) {
            // Buffers created before the failure would otherwise stay registered
            mesh.release_created(rhi);
            return Err(e);
        }

        log::debug!(
            "Uploaded mesh {} ({} vertices, {} faces)",
            data.name,
            vertex_count,
            data.triangle_count()
        );
        Ok(mesh)
    }

    fn create_buffers<D: RenderDevice>(
        &mut self,
        rhi: &mut Rhi<D>,
        data: &MeshData,
    ) -> RhiResult<()> {
        self.position_buffer = rhi.create_vertex_buffer(&data.positions)?;
        self.normal_buffer = rhi.create_vertex_buffer(&data.normals)?;
        self.uv_buffer = rhi.create_vertex_buffer(&data.uvs)?;
        self.index_buffer = rhi.create_index_buffer(&data.indices)?;
        self.constant_buffer =
            rhi.create_constant_buffer(std::mem::size_of::<ConstantBufferData>() as u64)?;
        Ok(())
    }

    /// Release whichever buffers exist; null handles are skipped
    fn release_created<D: RenderDevice>(&self, rhi: &mut Rhi<D>) {
        for buffer in [self.position_buffer, self.normal_buffer, self.uv_buffer] {
            if !buffer.is_null() {
                let _ = rhi.release_vertex_buffer(buffer);
            }
        }
        if !self.index_buffer.is_null() {
            let _ = rhi.release_index_buffer(self.index_buffer);
        }
        if !self.constant_buffer.is_null() {
            let _ = rhi.release_constant_buffer(self.constant_buffer);
        }
    }

    /// Return the mesh's buffers to the RHI
    pub fn release<D: RenderDevice>(&self, rhi: &mut Rhi<D>) -> RhiResult<()> {
        rhi.release_vertex_buffer(self.position_buffer)?;
        rhi.release_vertex_buffer(self.normal_buffer)?;
        rhi.release_vertex_buffer(self.uv_buffer)?;
        rhi.release_index_buffer(self.index_buffer)?;
        rhi.release_constant_buffer(self.constant_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;
    use crate::window::Window;
    use crate::RhiConfig;

    fn recording_rhi() -> Rhi<RecordingDevice> {
        Rhi::init(&Window::headless(32, 32), RhiConfig::default()).unwrap()
    }

    fn flat_mesh(vertex_count: usize) -> MeshData {
        let mut data = MeshData::new("flat");
        data.positions = vec![Vec3::ZERO; vertex_count];
        data.normals = vec![Vec3::Z; vertex_count];
        data.uvs = vec![Vec2::ZERO; vertex_count];
        data.indices = vec![0, 1, (vertex_count - 1) as u32];
        data
    }

    #[test]
    fn test_16_bit_vertex_limit_boundary() {
        let mut rhi = recording_rhi();
        let debug = rhi.debug_texture().unwrap();

        let mesh = Mesh::upload(&mut rhi, &flat_mesh(65_535), debug).unwrap();
        assert_eq!(rhi.index_count(mesh.index_buffer).unwrap(), 3);

        assert_eq!(
            Mesh::upload(&mut rhi, &flat_mesh(65_536), debug).unwrap_err(),
            RhiError::IndexOverflow {
                index: 65_535,
                max: 65_534
            }
        );
    }

    #[test]
    fn test_32_bit_indices_lift_vertex_limit() {
        let config = RhiConfig {
            index_width: IndexWidth::U32,
            ..Default::default()
        };
        let mut rhi: Rhi<RecordingDevice> =
            Rhi::init(&Window::headless(32, 32), config).unwrap();
        let debug = rhi.debug_texture().unwrap();
        assert!(Mesh::upload(&mut rhi, &flat_mesh(65_536), debug).is_ok());
    }

    #[test]
    fn test_failed_upload_releases_created_buffers() {
        let mut rhi = recording_rhi();
        let monitor = rhi.device().monitor();
        let debug = rhi.debug_texture().unwrap();
        let live = rhi.live_object_count();

        // Vertex buffers are created before the index buffer rejects 70000
        let mut data = MeshData::triangle();
        data.indices = vec![0, 1, 70_000];
        assert!(matches!(
            Mesh::upload(&mut rhi, &data, debug),
            Err(RhiError::IndexOverflow { index: 70_000, .. })
        ));

        assert_eq!(rhi.live_object_count(), live);
        assert_eq!(monitor.live_objects(), live);
    }

    #[test]
    fn test_cube_counts() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.normals.len(), 24);
        assert_eq!(cube.uvs.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        assert!(cube.indices.iter().all(|&i| (i as usize) < cube.vertex_count()));
    }

    #[test]
    fn test_cube_winding_agrees_with_normals() {
        let cube = MeshData::cube();
        for triangle in cube.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|k| cube.positions[triangle[k] as usize]);
            let normal = cube.normals[triangle[0] as usize];
            assert!((b - a).cross(c - a).dot(normal) > 0.0);
        }
    }

    #[test]
    fn test_triangle_winding_matches_cube() {
        let tri = MeshData::triangle();
        let [a, b, c] = [0, 1, 2].map(|k| tri.positions[k]);
        assert!((b - a).cross(c - a).dot(tri.normals[0]) > 0.0);
    }

    #[test]
    fn test_default_model_translates_forward() {
        let p = Mesh::default_model().transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::new(0.0, 0.0, 1.0));
    }
}

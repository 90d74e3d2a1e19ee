//! Frame controller
//!
//! `Engine` owns the RHI, the uploaded meshes and the texture cache, and
//! drives one Update/Render cycle per frame:
//! geometry (every mesh) -> lighting (ambient, then one directional light) -> present.

use crate::backend::traits::RenderDevice;
use crate::backend::types::ConstantBufferData;
use crate::error::{RhiError, RhiResult};
use crate::handle::Texture2DHandle;
use crate::resources::{Mesh, MeshData, TextureMap};
use crate::rhi::Rhi;
use crate::window::Window;
use crate::RhiConfig;
use glam::{IVec4, Mat4, Vec2, Vec3, Vec4};
use std::path::Path;
use winit::keyboard::KeyCode;

/// What the geometry pass writes to the G-buffer color target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderMode {
    /// Diffuse texture
    SolidColour = 0,
    #[default]
    Normals = 1,
    UVs = 2,
    Depth = 3,
}

impl RenderMode {
    /// Next mode, wrapping after `Depth`
    pub fn next(self) -> Self {
        match self {
            RenderMode::SolidColour => RenderMode::Normals,
            RenderMode::Normals => RenderMode::UVs,
            RenderMode::UVs => RenderMode::Depth,
            RenderMode::Depth => RenderMode::SolidColour,
        }
    }
}

/// Vertical field of view of the projection
pub const FIELD_OF_VIEW_DEGREES: f32 = 45.0;
pub const NEAR_PLANE: f32 = 0.01;
pub const FAR_PLANE: f32 = 100.0;

/// One directional light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub color: Vec4,
    /// (yaw, pitch) in radians
    pub angles: Vec2,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            color: Vec4::new(1.0, 1.0, 1.0, 1.0),
            angles: Vec2::new(0.5, 0.8),
        }
    }
}

pub struct Engine<D: RenderDevice> {
    meshes: Vec<Mesh>,
    texture_map: TextureMap,
    render_mode: RenderMode,
    view: Mat4,
    projection: Mat4,
    pub ambient: Vec4,
    pub light: DirectionalLight,
    rhi: Rhi<D>,
}

impl<D: RenderDevice> Engine<D> {
    /// Bring up the RHI on `window`
    pub fn new(window: &Window, config: RhiConfig) -> RhiResult<Self> {
        Ok(Self::with_rhi(Rhi::init(window, config)?))
    }

    pub fn with_rhi(rhi: Rhi<D>) -> Self {
        let (width, height) = rhi.size();
        Self {
            meshes: Vec::new(),
            texture_map: TextureMap::new(),
            render_mode: RenderMode::default(),
            view: Mat4::look_at_lh(Vec3::new(0.0, 0.0, -1.0), Vec3::new(0.0, 0.0, 1.0), Vec3::Y),
            projection: projection(width, height),
            ambient: Vec4::new(0.2, 0.2, 0.2, 1.0),
            light: DirectionalLight::default(),
            rhi,
        }
    }

    pub fn rhi(&self) -> &Rhi<D> {
        &self.rhi
    }

    pub fn rhi_mut(&mut self) -> &mut Rhi<D> {
        &mut self.rhi
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    pub fn meshes_mut(&mut self) -> &mut [Mesh] {
        &mut self.meshes
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        self.render_mode = mode;
    }

    pub fn cycle_render_mode(&mut self) -> RenderMode {
        self.render_mode = self.render_mode.next();
        log::info!("Render mode: {:?}", self.render_mode);
        self.render_mode
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn set_view(&mut self, view: Mat4) {
        self.view = view;
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    /// Texture handle for `path`, or the debug texture when it cannot be loaded
    pub fn texture_or_debug(&mut self, path: impl AsRef<Path>) -> RhiResult<Texture2DHandle> {
        let path = path.as_ref();
        match self.texture_map.get_texture_2d_from_path(&mut self.rhi, path) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                log::warn!("Using debug texture for {}: {}", path.display(), e);
                self.rhi
                    .debug_texture()
                    .ok_or(RhiError::InvalidHandle("debug texture"))
            }
        }
    }

    /// Upload `data` textured with `diffuse`, or the debug texture when `None`
    pub fn add_mesh(
        &mut self,
        data: &MeshData,
        diffuse: Option<Texture2DHandle>,
    ) -> RhiResult<usize> {
        let diffuse = match diffuse {
            Some(handle) => handle,
            None => self
                .rhi
                .debug_texture()
                .ok_or(RhiError::InvalidHandle("debug texture"))?,
        };
        let mesh = Mesh::upload(&mut self.rhi, data, diffuse)?;
        self.meshes.push(mesh);
        Ok(self.meshes.len() - 1)
    }

    /// Forward a key press; `R` cycles the render mode
    pub fn handle_key(&mut self, key: KeyCode) {
        if key == KeyCode::KeyR {
            self.cycle_render_mode();
        }
    }

    /// Write every mesh's constants for this frame
    pub fn update(&mut self, _delta_time: f32) -> RhiResult<()> {
        let view_projection = self.projection * self.view;
        let render_mode = IVec4::splat(self.render_mode as i32);

        for mesh in &self.meshes {
            let constants = ConstantBufferData {
                mvp: view_projection * mesh.model,
                render_mode,
            };
            self.rhi.update_constant_buffer(mesh.constant_buffer, &constants)?;
        }
        Ok(())
    }

    /// Run the passes and present. A failed frame is abandoned so the next
    /// one starts clean.
    pub fn render(&mut self) -> RhiResult<()> {
        let result = self.render_passes();
        if result.is_err() {
            self.rhi.abandon_frame();
        }
        result
    }

    fn render_passes(&mut self) -> RhiResult<()> {
        self.rhi.begin_geometry_pass()?;
        for mesh in &self.meshes {
            self.rhi.draw_mesh(mesh)?;
        }

        self.rhi.begin_lighting_pass()?;
        self.rhi.draw_ambient(self.ambient)?;
        self.rhi
            .draw_directional_light(self.light.color, self.light.angles)?;

        self.rhi.present()
    }

    /// Follow a window resize and rebuild the projection for the new aspect
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.rhi.handle_window_resize(width, height)?;
        let (width, height) = self.rhi.size();
        self.projection = projection(width, height);
        Ok(())
    }
}

/// Left-handed perspective with depth in [0, 1]
pub fn projection(width: u32, height: u32) -> Mat4 {
    let aspect = width.max(1) as f32 / height.max(1) as f32;
    Mat4::perspective_lh(FIELD_OF_VIEW_DEGREES.to_radians(), aspect, NEAR_PLANE, FAR_PLANE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;

    #[test]
    fn test_render_mode_cycles_through_all() {
        let mut mode = RenderMode::default();
        assert_eq!(mode, RenderMode::Normals);
        let mut seen = Vec::new();
        for _ in 0..4 {
            mode = mode.next();
            seen.push(mode as i32);
        }
        assert_eq!(seen, vec![2, 3, 0, 1]);
    }

    #[test]
    fn test_projection_maps_near_and_far_to_unit_depth() {
        let proj = projection(800, 600);
        let near = proj.project_point3(Vec3::new(0.0, 0.0, NEAR_PLANE));
        let far = proj.project_point3(Vec3::new(0.0, 0.0, FAR_PLANE));
        assert!(near.z.abs() < 1e-5);
        assert!((far.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_key_r_cycles_mode() {
        let mut engine: Engine<RecordingDevice> =
            Engine::new(&Window::headless(64, 64), RhiConfig::default()).unwrap();
        engine.handle_key(KeyCode::KeyR);
        assert_eq!(engine.render_mode(), RenderMode::UVs);
        engine.handle_key(KeyCode::KeyW);
        assert_eq!(engine.render_mode(), RenderMode::UVs);
    }

    #[test]
    fn test_update_writes_one_constant_buffer_per_mesh() {
        let mut engine: Engine<RecordingDevice> =
            Engine::new(&Window::headless(64, 64), RhiConfig::default()).unwrap();
        engine.add_mesh(&MeshData::cube(), None).unwrap();
        engine.add_mesh(&MeshData::triangle(), None).unwrap();

        let monitor = engine.rhi().device().monitor();
        monitor.take_commands();
        engine.update(0.016).unwrap();

        let writes = monitor
            .commands()
            .into_iter()
            .filter(|c| matches!(c, crate::backend::Command::WriteBuffer { len: 80, .. }))
            .count();
        assert_eq!(writes, 2);
    }

    #[test]
    fn test_failed_frame_is_abandoned() {
        let mut engine: Engine<RecordingDevice> =
            Engine::new(&Window::headless(64, 64), RhiConfig::default()).unwrap();
        engine.add_mesh(&MeshData::cube(), None).unwrap();
        let buffer = engine.meshes()[0].position_buffer;
        engine.rhi_mut().release_vertex_buffer(buffer).unwrap();

        assert!(engine.render().is_err());
        assert_eq!(engine.rhi().pass_state(), crate::PassState::Idle);
    }
}

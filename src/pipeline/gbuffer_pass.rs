//! Geometry pass
//!
//! Renders meshes into the G-buffer (MRT):
//! - Color: diffuse texture, or the debug view selected by the render mode
//! - Normal: surface normal encoded to [0, 1]
//! - Depth buffer

use crate::backend::traits::RenderDevice;
use crate::backend::types::*;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::PassState;
use crate::resources::Mesh;
use crate::rhi::{lookup, Rhi};

/// Clear color of the G-buffer color target
pub const GBUFFER_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.25, 1.0];

/// One stream per attribute: positions, normals, texture coordinates
pub const GEOMETRY_LAYOUT: [InputElement; 3] = [
    InputElement::new("POSITION", VertexFormat::Float32x3, 0),
    InputElement::new("NORMAL", VertexFormat::Float32x3, 1),
    InputElement::new("TEXCOORD", VertexFormat::Float32x2, 2),
];

impl<D: RenderDevice> Rhi<D> {
    /// Start a frame: clear the G-buffer and depth, bind them, and set up the
    /// geometry program.
    pub fn begin_geometry_pass(&mut self) -> RhiResult<()> {
        let from = self.pass_state;
        self.transition(PassState::GeometryPass)?;
        self.bind_geometry_targets().inspect_err(|_| self.pass_state = from)
    }

    fn bind_geometry_targets(&mut self) -> RhiResult<()> {
        let passes = self
            .passes
            .as_ref()
            .ok_or(RhiError::InvalidHandle("pass resources"))?;
        let program = lookup(&self.shaders, passes.geometry, "geometry shader")?;
        let gbuffer = self.gbuffer.ok_or(RhiError::InvalidHandle("G-buffer"))?;
        let color = lookup(&self.render_targets, gbuffer.color, "G-buffer color")?;
        let normal = lookup(&self.render_targets, gbuffer.normal, "G-buffer normal")?;
        let depth = self
            .depth
            .as_ref()
            .ok_or(RhiError::InvalidHandle("depth buffer"))?;

        let device = &mut self.device;
        device.clear_depth_stencil_view(&depth.dsv, 1.0);
        device.clear_render_target_view(&color.rtv, GBUFFER_CLEAR_COLOR);
        // Every pixel that matters is rewritten by the geometry
        device.discard_view(&normal.rtv);

        device.set_render_targets(&[&color.rtv, &normal.rtv], Some(&depth.dsv));
        device.set_blend_state(None);
        device.set_input_layout(&program.layout);
        device.set_primitive_topology(PrimitiveTopology::TriangleList);
        device.set_vertex_shader(&program.vertex);
        device.set_pixel_shader(&program.pixel);
        Ok(())
    }

    /// Draw one mesh into the G-buffer.
    ///
    /// Every handle the mesh holds is resolved, and the face count checked
    /// against the index buffer, before anything is bound, so a bad mesh fails
    /// the call without a partial draw.
    pub fn draw_mesh(&mut self, mesh: &Mesh) -> RhiResult<()> {
        self.expect_state(PassState::GeometryPass, "draw_mesh")?;

        let positions = lookup(&self.vertex_buffers, mesh.position_buffer, "position buffer")?;
        let normals = lookup(&self.vertex_buffers, mesh.normal_buffer, "normal buffer")?;
        let uvs = lookup(&self.vertex_buffers, mesh.uv_buffer, "uv buffer")?;
        let indices = lookup(&self.index_buffers, mesh.index_buffer, "index buffer")?;
        let constants = lookup(&self.constant_buffers, mesh.constant_buffer, "constant buffer")?;
        let diffuse = lookup(&self.textures, mesh.diffuse_texture, "texture")?;

        let index_count = mesh
            .face_count
            .checked_mul(3)
            .filter(|&count| count <= indices.count)
            .ok_or(RhiError::DrawOutOfRange {
                requested: mesh.face_count as u64 * 3,
                available: indices.count,
            })?;

        let device = &mut self.device;
        device.set_vertex_buffer(0, &positions.buffer, positions.stride);
        device.set_vertex_buffer(1, &normals.buffer, normals.stride);
        device.set_vertex_buffer(2, &uvs.buffer, uvs.stride);
        device.set_index_buffer(&indices.buffer, indices.format);
        device.set_constant_buffer(ShaderStage::Vertex, 0, &constants.buffer);
        device.set_constant_buffer(ShaderStage::Pixel, 0, &constants.buffer);
        device.set_shader_resources(0, &[Some(&diffuse.srv)]);
        device.set_sampler(0, &diffuse.sampler);
        device.draw_indexed(index_count);
        Ok(())
    }
}

/// Geometry shader. Bindings follow the fixed slot table of the device:
/// 0 = vertex b0, 1 = pixel b0, 2 = t0, 3 = t1, 4 = s0.
pub const GEOMETRY_SHADER: &str = r#"
// Geometry pass: fills the G-buffer

struct MeshConstants {
    mvp: mat4x4<f32>,
    render_mode: vec4<i32>,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

struct GBufferOutput {
    @location(0) color: vec4<f32>,
    @location(1) normal: vec4<f32>,
}

@group(0) @binding(0) var<uniform> vs_constants: MeshConstants;
@group(0) @binding(1) var<uniform> ps_constants: MeshConstants;
@group(0) @binding(2) var diffuse_texture: texture_2d<f32>;
@group(0) @binding(4) var diffuse_sampler: sampler;

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    output.clip_position = vs_constants.mvp * vec4<f32>(input.position, 1.0);
    output.normal = input.normal;
    output.uv = input.uv;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> GBufferOutput {
    var output: GBufferOutput;

    // Sample in uniform control flow
    let diffuse = textureSample(diffuse_texture, diffuse_sampler, input.uv);
    let encoded_normal = normalize(input.normal) * 0.5 + 0.5;

    switch ps_constants.render_mode.x {
        // normals
        case 1: {
            output.color = vec4<f32>(encoded_normal, 1.0);
        }
        // uvs
        case 2: {
            output.color = vec4<f32>(input.uv, 0.0, 1.0);
        }
        // depth
        case 3: {
            output.color = vec4<f32>(vec3<f32>(input.clip_position.z), 1.0);
        }
        default: {
            output.color = diffuse;
        }
    }

    output.normal = vec4<f32>(encoded_normal, 1.0);
    return output;
}
"#;

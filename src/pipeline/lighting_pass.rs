//! Lighting pass
//!
//! Fullscreen quads read the G-buffer and accumulate light into the back
//! buffer: one ambient term, then additive directional lights.

use crate::backend::traits::RenderDevice;
use crate::backend::types::*;
use crate::error::{RhiError, RhiResult};
use crate::handle::{ConstantBufferHandle, ShaderHandle};
use crate::pipeline::{PassState, QUAD_INDEX_COUNT};
use crate::rhi::{lookup, Rhi};
use glam::{Vec2, Vec3, Vec4};

/// Clear color of the back buffer
pub const BACK_BUFFER_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Quad streams: clip-space positions and texture coordinates
pub const QUAD_LAYOUT: [InputElement; 2] = [
    InputElement::new("POSITION", VertexFormat::Float32x2, 0),
    InputElement::new("TEXCOORD", VertexFormat::Float32x2, 1),
];

/// Unit vector towards a light at `angles` = (yaw, pitch) in radians.
///
/// Yaw rotates around +Y starting from +Z, pitch lifts towards +Y.
pub fn direction_from_angles(angles: Vec2) -> Vec3 {
    let (yaw, pitch) = (angles.x, angles.y);
    Vec3::new(pitch.cos() * yaw.sin(), pitch.sin(), pitch.cos() * yaw.cos())
}

impl<D: RenderDevice> Rhi<D> {
    /// Bind the back buffer for writing and the G-buffer for reading
    pub fn begin_lighting_pass(&mut self) -> RhiResult<()> {
        let from = self.pass_state;
        self.transition(PassState::LightingPass)?;
        self.bind_lighting_targets().inspect_err(|_| self.pass_state = from)
    }

    fn bind_lighting_targets(&mut self) -> RhiResult<()> {
        let passes = self
            .passes
            .as_ref()
            .ok_or(RhiError::InvalidHandle("pass resources"))?;
        let sampler = lookup(&self.samplers, passes.gbuffer_sampler, "sampler")?;
        let gbuffer = self.gbuffer.ok_or(RhiError::InvalidHandle("G-buffer"))?;
        let color = lookup(&self.render_targets, gbuffer.color, "G-buffer color")?;
        let normal = lookup(&self.render_targets, gbuffer.normal, "G-buffer normal")?;
        let back_buffer = self
            .back_buffer
            .as_ref()
            .ok_or(RhiError::InvalidHandle("back buffer"))?;

        let device = &mut self.device;
        device.clear_render_target_view(&back_buffer.rtv, BACK_BUFFER_CLEAR_COLOR);
        // Unbinds the G-buffer as output before it is bound as input
        device.set_render_targets(&[&back_buffer.rtv], None);
        device.set_sampler(0, sampler);
        device.set_shader_resources(0, &[Some(&color.srv), Some(&normal.srv)]);
        Ok(())
    }

    /// Fill the back buffer with the G-buffer color scaled by `color`
    pub fn draw_ambient(&mut self, color: Vec4) -> RhiResult<()> {
        self.expect_state(PassState::LightingPass, "draw_ambient")?;
        let (program, cb) = {
            let passes = self.pass_resources()?;
            (passes.ambient, passes.ambient_cb)
        };
        self.draw_light_quad(program, cb, None, bytemuck::bytes_of(&AmbientUniform { color }))
    }

    /// Add a directional light of `color` arriving from `angles` = (yaw, pitch)
    pub fn draw_directional_light(&mut self, color: Vec4, angles: Vec2) -> RhiResult<()> {
        self.expect_state(PassState::LightingPass, "draw_directional_light")?;
        let (program, cb) = {
            let passes = self.pass_resources()?;
            (passes.directional, passes.light_cb)
        };
        let uniform = DirectionalLightUniform {
            color,
            direction: direction_from_angles(angles).extend(0.0),
        };
        self.draw_light_quad(
            program,
            cb,
            Some(BlendState::additive()),
            bytemuck::bytes_of(&uniform),
        )
    }

    fn draw_light_quad(
        &mut self,
        program: ShaderHandle,
        constants: ConstantBufferHandle,
        blend: Option<BlendState>,
        data: &[u8],
    ) -> RhiResult<()> {
        let passes = self
            .passes
            .as_ref()
            .ok_or(RhiError::InvalidHandle("pass resources"))?;
        let program = lookup(&self.shaders, program, "light shader")?;
        let positions = lookup(&self.vertex_buffers, passes.quad.positions, "quad positions")?;
        let uvs = lookup(&self.vertex_buffers, passes.quad.uvs, "quad uvs")?;
        let indices = lookup(&self.index_buffers, passes.quad.indices, "quad indices")?;
        let constants = lookup(&self.constant_buffers, constants, "light constants")?;

        let device = &mut self.device;
        device.write_buffer(&constants.buffer, data)?;
        device.set_blend_state(blend);
        device.set_input_layout(&program.layout);
        device.set_primitive_topology(PrimitiveTopology::TriangleList);
        device.set_vertex_shader(&program.vertex);
        device.set_pixel_shader(&program.pixel);
        device.set_vertex_buffer(0, &positions.buffer, positions.stride);
        device.set_vertex_buffer(1, &uvs.buffer, uvs.stride);
        device.set_index_buffer(&indices.buffer, indices.format);
        device.set_constant_buffer(ShaderStage::Pixel, 0, &constants.buffer);
        device.draw_indexed(QUAD_INDEX_COUNT);
        Ok(())
    }
}

/// Ambient light: G-buffer color times the ambient color
pub const AMBIENT_SHADER: &str = r#"
struct AmbientConstants {
    color: vec4<f32>,
}

struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(1) var<uniform> ambient: AmbientConstants;
@group(0) @binding(2) var gbuffer_color: texture_2d<f32>;
@group(0) @binding(4) var gbuffer_sampler: sampler;

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    output.clip_position = vec4<f32>(input.position, 0.0, 1.0);
    output.uv = input.uv;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let albedo = textureSample(gbuffer_color, gbuffer_sampler, input.uv);
    return vec4<f32>(albedo.rgb * ambient.color.rgb, 1.0);
}
"#;

/// Directional light: Lambert term from the encoded G-buffer normal
pub const DIRECTIONAL_SHADER: &str = r#"
struct LightConstants {
    color: vec4<f32>,
    // xyz = direction towards the light
    direction: vec4<f32>,
}

struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@group(0) @binding(1) var<uniform> light: LightConstants;
@group(0) @binding(2) var gbuffer_color: texture_2d<f32>;
@group(0) @binding(3) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(4) var gbuffer_sampler: sampler;

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    output.clip_position = vec4<f32>(input.position, 0.0, 1.0);
    output.uv = input.uv;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let albedo = textureSample(gbuffer_color, gbuffer_sampler, input.uv);
    let encoded = textureSample(gbuffer_normal, gbuffer_sampler, input.uv);
    let normal = normalize(encoded.xyz * 2.0 - 1.0);
    let n_dot_l = max(dot(normal, normalize(light.direction.xyz)), 0.0);
    return vec4<f32>(albedo.rgb * light.color.rgb * n_dot_l, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_angles() {
        let forward = direction_from_angles(Vec2::ZERO);
        assert!(forward.abs_diff_eq(Vec3::Z, 1e-6));

        let up = direction_from_angles(Vec2::new(0.0, std::f32::consts::FRAC_PI_2));
        assert!(up.abs_diff_eq(Vec3::Y, 1e-6));

        let right = direction_from_angles(Vec2::new(std::f32::consts::FRAC_PI_2, 0.0));
        assert!(right.abs_diff_eq(Vec3::X, 1e-6));
    }

    #[test]
    fn test_direction_is_unit_length() {
        for (yaw, pitch) in [(0.3, 1.1), (-2.0, 0.4), (4.0, -0.7)] {
            let dir = direction_from_angles(Vec2::new(yaw, pitch));
            assert!((dir.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_quad_layout_strides() {
        assert!(QUAD_LAYOUT.iter().all(|e| e.stride() == 8));
    }
}

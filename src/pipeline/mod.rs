//! Deferred pass pipeline
//!
//! A frame runs two passes in a fixed order:
//! 1. Geometry pass - meshes render into the G-buffer (color, normal, depth)
//! 2. Lighting pass - fullscreen quads read the G-buffer and accumulate
//!    light into the back buffer
//!
//! then presents. `PassState` enforces the order; a call that does not fit
//! the current state fails without touching the device.

pub mod gbuffer_pass;
pub mod lighting_pass;

use crate::backend::traits::RenderDevice;
use crate::backend::types::{
    AmbientUniform, DirectionalLightUniform, SamplerDescriptor, ShaderSource,
};
use crate::error::{RhiError, RhiResult};
use crate::handle::*;
use crate::rhi::Rhi;
use glam::Vec2;

/// Position of the frame within the pass sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassState {
    /// No frame started yet
    Idle,
    /// G-buffer bound, meshes may be drawn
    GeometryPass,
    /// Back buffer bound, G-buffer readable, lights may be drawn
    LightingPass,
    /// Frame handed to the swap chain; behaves like `Idle` for the next frame
    Presented,
}

impl PassState {
    /// Whether moving from `self` to `to` is allowed
    pub fn can_transition(self, to: PassState) -> bool {
        use PassState::*;
        matches!(
            (self, to),
            (Idle | Presented, GeometryPass)
                | (Idle | Presented | GeometryPass, LightingPass)
                | (LightingPass, Presented)
        )
    }

    /// Between the start of a pass and present
    pub fn in_frame(self) -> bool {
        matches!(self, PassState::GeometryPass | PassState::LightingPass)
    }
}

/// Fullscreen quad streams shared by every lighting draw
pub(crate) struct FullscreenQuad {
    pub positions: VertexBufferHandle,
    pub uvs: VertexBufferHandle,
    pub indices: IndexBufferHandle,
}

/// Objects the passes use every frame, created once at init
pub(crate) struct PassResources {
    pub geometry: ShaderHandle,
    pub ambient: ShaderHandle,
    pub directional: ShaderHandle,
    pub quad: FullscreenQuad,
    pub gbuffer_sampler: SamplerHandle,
    pub ambient_cb: ConstantBufferHandle,
    pub light_cb: ConstantBufferHandle,
    pub debug_texture: Texture2DHandle,
}

const QUAD_POSITIONS: [Vec2; 4] = [
    Vec2::new(-1.0, -1.0),
    Vec2::new(-1.0, 1.0),
    Vec2::new(1.0, -1.0),
    Vec2::new(1.0, 1.0),
];

const QUAD_UVS: [Vec2; 4] = [
    Vec2::new(0.0, 1.0),
    Vec2::new(0.0, 0.0),
    Vec2::new(1.0, 1.0),
    Vec2::new(1.0, 0.0),
];

const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 1, 3];

/// Number of indices drawn per fullscreen quad
pub const QUAD_INDEX_COUNT: u32 = QUAD_INDICES.len() as u32;

fn program<'a>(label: &'a str, wgsl: &'a str) -> (ShaderSource<'a>, ShaderSource<'a>) {
    (
        ShaderSource {
            label,
            wgsl,
            entry_point: "vs_main",
        },
        ShaderSource {
            label,
            wgsl,
            entry_point: "fs_main",
        },
    )
}

impl<D: RenderDevice> Rhi<D> {
    pub(crate) fn create_pass_resources(&mut self) -> RhiResult<()> {
        let (vs, ps) = program("geometry", gbuffer_pass::GEOMETRY_SHADER);
        let geometry = self.create_shader(&vs, &ps, &gbuffer_pass::GEOMETRY_LAYOUT)?;

        let (vs, ps) = program("ambient", lighting_pass::AMBIENT_SHADER);
        let ambient = self.create_shader(&vs, &ps, &lighting_pass::QUAD_LAYOUT)?;

        let (vs, ps) = program("directional", lighting_pass::DIRECTIONAL_SHADER);
        let directional = self.create_shader(&vs, &ps, &lighting_pass::QUAD_LAYOUT)?;

        let quad = FullscreenQuad {
            positions: self.create_vertex_buffer(&QUAD_POSITIONS)?,
            uvs: self.create_vertex_buffer(&QUAD_UVS)?,
            indices: self.create_index_buffer(&QUAD_INDICES)?,
        };

        let gbuffer_sampler = self.create_sampler(&SamplerDescriptor {
            label: Some("GBuffer Sampler".into()),
            ..Default::default()
        })?;
        let ambient_cb = self.create_constant_buffer(std::mem::size_of::<AmbientUniform>() as u64)?;
        let light_cb =
            self.create_constant_buffer(std::mem::size_of::<DirectionalLightUniform>() as u64)?;
        let debug_texture = self.create_debug_texture_2d()?;

        self.passes = Some(PassResources {
            geometry,
            ambient,
            directional,
            quad,
            gbuffer_sampler,
            ambient_cb,
            light_cb,
            debug_texture,
        });
        Ok(())
    }

    pub(crate) fn pass_resources(&self) -> RhiResult<&PassResources> {
        self.passes
            .as_ref()
            .ok_or(RhiError::InvalidHandle("pass resources"))
    }

    /// Move to `to`, or fail leaving the state unchanged
    pub(crate) fn transition(&mut self, to: PassState) -> RhiResult<()> {
        if !self.pass_state.can_transition(to) {
            log::error!("Invalid pass transition {:?} -> {:?}", self.pass_state, to);
            return Err(RhiError::InvalidPassTransition {
                from: self.pass_state,
                to,
            });
        }
        log::trace!("Pass {:?} -> {:?}", self.pass_state, to);
        self.pass_state = to;
        Ok(())
    }

    pub(crate) fn expect_state(&self, state: PassState, operation: &'static str) -> RhiResult<()> {
        if self.pass_state == state {
            Ok(())
        } else {
            Err(RhiError::PassMismatch {
                operation,
                state: self.pass_state,
            })
        }
    }

    /// Null the G-buffer shader resource slots so the targets can be bound
    /// for writing again
    pub(crate) fn unbind_shader_resources(&mut self) {
        self.device.set_shader_resources(0, &[None, None]);
    }

    /// Drop a frame in progress and return to `Idle`. Does nothing between
    /// frames.
    pub fn abandon_frame(&mut self) {
        if self.pass_state.in_frame() {
            log::warn!("Abandoning frame during {:?}", self.pass_state);
            self.unbind_shader_resources();
            self.pass_state = PassState::Idle;
        }
    }

    /// Present the back buffer and end the frame.
    ///
    /// The G-buffer inputs are unbound afterwards whether or not presenting
    /// succeeded.
    pub fn present(&mut self) -> RhiResult<()> {
        let result = self
            .transition(PassState::Presented)
            .and_then(|()| self.device.present());
        if let Err(e) = &result {
            log::warn!("Present failed: {}", e);
        }
        self.unbind_shader_resources();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PassState::*;

    #[test]
    fn test_frame_order_is_allowed() {
        assert!(Idle.can_transition(GeometryPass));
        assert!(GeometryPass.can_transition(LightingPass));
        assert!(LightingPass.can_transition(Presented));
        assert!(Presented.can_transition(GeometryPass));
    }

    #[test]
    fn test_lighting_without_geometry_is_allowed() {
        assert!(Idle.can_transition(LightingPass));
        assert!(Presented.can_transition(LightingPass));
    }

    #[test]
    fn test_out_of_order_is_rejected() {
        assert!(!Idle.can_transition(Presented));
        assert!(!GeometryPass.can_transition(Presented));
        assert!(!GeometryPass.can_transition(GeometryPass));
        assert!(!LightingPass.can_transition(GeometryPass));
        assert!(!LightingPass.can_transition(LightingPass));
        assert!(!Presented.can_transition(Presented));
    }

    #[test]
    fn test_quad_covers_clip_space() {
        for index in QUAD_INDICES {
            let p = QUAD_POSITIONS[index as usize];
            assert_eq!(p.abs(), Vec2::ONE);
        }
        // uv origin at the top-left corner
        assert_eq!(QUAD_UVS[1], Vec2::ZERO);
        assert_eq!(QUAD_POSITIONS[1], Vec2::new(-1.0, 1.0));
    }
}

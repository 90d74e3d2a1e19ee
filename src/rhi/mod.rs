//! The render hardware interface
//!
//! `Rhi<D>` owns the device and one typed pool per resource kind. Collaborators
//! hold handles into these pools; they never own device objects. Releasing a
//! pool entry drops the device objects behind it, and every handle that named
//! it stops resolving.

pub mod bootstrap;
pub mod factory;
pub mod targets;

use crate::backend::traits::RenderDevice;
use crate::backend::types::{IndexFormat, Viewport};
use crate::error::{RhiError, RhiResult};
use crate::handle::*;
use crate::pipeline::{PassResources, PassState};
use crate::RhiConfig;
use slotmap::{Key, SlotMap};

pub(crate) struct GpuVertexBuffer<D: RenderDevice> {
    pub buffer: D::Buffer,
    pub stride: u32,
    pub count: u32,
}

pub(crate) struct GpuIndexBuffer<D: RenderDevice> {
    pub buffer: D::Buffer,
    pub format: IndexFormat,
    pub count: u32,
}

pub(crate) struct GpuConstantBuffer<D: RenderDevice> {
    pub buffer: D::Buffer,
    pub size: u64,
}

/// Sampled texture: texture, shader view and its own sampler
pub(crate) struct GpuTexture<D: RenderDevice> {
    #[allow(dead_code)]
    pub texture: D::Texture,
    pub srv: D::ShaderResourceView,
    pub sampler: D::Sampler,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
}

/// Offscreen target usable as render target and as shader input
pub(crate) struct GpuRenderTarget<D: RenderDevice> {
    #[allow(dead_code)]
    pub texture: D::Texture,
    pub rtv: D::RenderTargetView,
    pub srv: D::ShaderResourceView,
    pub width: u32,
    pub height: u32,
}

/// Vertex/pixel shader pair and the input layout feeding it
pub(crate) struct ShaderProgram<D: RenderDevice> {
    pub vertex: D::VertexShader,
    pub pixel: D::PixelShader,
    pub layout: D::InputLayout,
}

pub(crate) struct BackBuffer<D: RenderDevice> {
    #[allow(dead_code)]
    pub texture: D::Texture,
    pub rtv: D::RenderTargetView,
}

pub(crate) struct DepthTarget<D: RenderDevice> {
    #[allow(dead_code)]
    pub texture: D::Texture,
    pub dsv: D::DepthStencilView,
}

/// The paired G-buffer targets, always recreated together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GBuffer {
    pub color: RenderTargetHandle,
    pub normal: RenderTargetHandle,
}

/// Size and mip count of a sampled texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
}

/// Resolve a handle or fail with `InvalidHandle`
pub(crate) fn lookup<'a, K: Key, V>(
    pool: &'a SlotMap<K, V>,
    key: K,
    kind: &'static str,
) -> RhiResult<&'a V> {
    pool.get(key).ok_or(RhiError::InvalidHandle(kind))
}

/// Render hardware interface over device `D`
pub struct Rhi<D: RenderDevice> {
    pub(crate) config: RhiConfig,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) viewport: Viewport,
    pub(crate) pass_state: PassState,

    pub(crate) vertex_buffers: SlotMap<VertexBufferHandle, GpuVertexBuffer<D>>,
    pub(crate) index_buffers: SlotMap<IndexBufferHandle, GpuIndexBuffer<D>>,
    pub(crate) constant_buffers: SlotMap<ConstantBufferHandle, GpuConstantBuffer<D>>,
    pub(crate) textures: SlotMap<Texture2DHandle, GpuTexture<D>>,
    pub(crate) render_targets: SlotMap<RenderTargetHandle, GpuRenderTarget<D>>,
    pub(crate) samplers: SlotMap<SamplerHandle, D::Sampler>,
    pub(crate) shaders: SlotMap<ShaderHandle, ShaderProgram<D>>,

    pub(crate) back_buffer: Option<BackBuffer<D>>,
    pub(crate) depth: Option<DepthTarget<D>>,
    pub(crate) gbuffer: Option<GBuffer>,
    pub(crate) passes: Option<PassResources>,

    pub(crate) device: D,
}

impl<D: RenderDevice> Rhi<D> {
    /// The underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &RhiConfig {
        &self.config
    }

    /// Current back buffer size
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Viewport set by the last back buffer recreation
    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn pass_state(&self) -> PassState {
        self.pass_state
    }

    /// Current G-buffer targets, if created
    pub fn gbuffer(&self) -> Option<GBuffer> {
        self.gbuffer
    }

    /// Texture shown when a mesh has no usable diffuse texture
    pub fn debug_texture(&self) -> Option<Texture2DHandle> {
        self.passes.as_ref().map(|p| p.debug_texture)
    }

    /// Number of device objects currently owned by the RHI
    pub fn live_object_count(&self) -> usize {
        self.vertex_buffers.len()
            + self.index_buffers.len()
            + self.constant_buffers.len()
            + self.textures.len() * 3
            + self.render_targets.len() * 3
            + self.samplers.len()
            + self.shaders.len() * 3
            + self.back_buffer.as_ref().map_or(0, |_| 2)
            + self.depth.as_ref().map_or(0, |_| 2)
    }

    pub fn contains_texture_2d(&self, handle: Texture2DHandle) -> bool {
        self.textures.contains_key(handle)
    }

    pub fn texture_2d_info(&self, handle: Texture2DHandle) -> RhiResult<TextureInfo> {
        let texture = lookup(&self.textures, handle, "texture")?;
        Ok(TextureInfo {
            width: texture.width,
            height: texture.height,
            mip_levels: texture.mip_levels,
        })
    }

    /// Size of an offscreen render target
    pub fn render_target_size(&self, handle: RenderTargetHandle) -> RhiResult<(u32, u32)> {
        let target = lookup(&self.render_targets, handle, "render target")?;
        Ok((target.width, target.height))
    }

    /// Number of indices in an index buffer
    pub fn index_count(&self, handle: IndexBufferHandle) -> RhiResult<u32> {
        Ok(lookup(&self.index_buffers, handle, "index buffer")?.count)
    }

    /// Destroy every object the RHI owns.
    ///
    /// Safe to call repeatedly. Every handle issued before the call stops
    /// resolving. The device itself stays alive until the RHI is dropped.
    pub fn release(&mut self) {
        let before = self.live_object_count();
        self.device.clear_state();

        self.passes = None;
        self.gbuffer = None;
        self.back_buffer = None;
        self.depth = None;

        self.vertex_buffers.clear();
        self.index_buffers.clear();
        self.constant_buffers.clear();
        self.textures.clear();
        self.render_targets.clear();
        self.samplers.clear();
        self.shaders.clear();

        self.pass_state = PassState::Idle;
        if before > 0 {
            log::info!("Released {} device objects", before);
        }
    }

    pub fn release_vertex_buffer(&mut self, handle: VertexBufferHandle) -> RhiResult<()> {
        self.vertex_buffers
            .remove(handle)
            .map(drop)
            .ok_or(RhiError::InvalidHandle("vertex buffer"))
    }

    pub fn release_index_buffer(&mut self, handle: IndexBufferHandle) -> RhiResult<()> {
        self.index_buffers
            .remove(handle)
            .map(drop)
            .ok_or(RhiError::InvalidHandle("index buffer"))
    }

    pub fn release_constant_buffer(&mut self, handle: ConstantBufferHandle) -> RhiResult<()> {
        self.constant_buffers
            .remove(handle)
            .map(drop)
            .ok_or(RhiError::InvalidHandle("constant buffer"))
    }

    pub fn release_texture_2d(&mut self, handle: Texture2DHandle) -> RhiResult<()> {
        self.textures
            .remove(handle)
            .map(drop)
            .ok_or(RhiError::InvalidHandle("texture"))
    }

    pub fn release_render_target(&mut self, handle: RenderTargetHandle) -> RhiResult<()> {
        self.render_targets
            .remove(handle)
            .map(drop)
            .ok_or(RhiError::InvalidHandle("render target"))
    }

    pub fn release_sampler(&mut self, handle: SamplerHandle) -> RhiResult<()> {
        self.samplers
            .remove(handle)
            .map(drop)
            .ok_or(RhiError::InvalidHandle("sampler"))
    }
}

impl<D: RenderDevice> Drop for Rhi<D> {
    fn drop(&mut self) {
        self.release();
    }
}

//! Core device abstraction
//!
//! `RenderDevice` is the seam between the RHI and a concrete GPU API. It
//! models an immediate context: state set through the `set_*` calls stays
//! bound until replaced, and `draw_indexed` consumes whatever is bound at the
//! time of the call. Draws execute in issue order.
//!
//! Device objects are owned by the caller. Dropping one releases it; there is
//! no separate destroy call.

use crate::backend::types::*;
use crate::error::RhiResult;
use crate::window::Window;
use crate::RhiConfig;

/// Main device trait
pub trait RenderDevice: Sized {
    type Buffer;
    type Texture;
    type RenderTargetView;
    type ShaderResourceView;
    type DepthStencilView;
    type Sampler;
    type VertexShader;
    type PixelShader;
    type InputLayout;

    /// Select an adapter, create the logical device and a swap chain for `window`.
    fn create(window: &Window, config: &RhiConfig) -> RhiResult<Self>;

    /// Adapter the device was created on
    fn adapter_info(&self) -> &AdapterInfo;

    /// Feature level negotiated at creation
    fn feature_level(&self) -> FeatureLevel;

    // Resource creation

    /// Create a buffer, optionally with initial contents
    fn create_buffer(
        &mut self,
        desc: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> RhiResult<Self::Buffer>;

    /// Replace the whole contents of a CPU-writable buffer (write-discard)
    fn write_buffer(&mut self, buffer: &Self::Buffer, data: &[u8]) -> RhiResult<()>;

    /// Create a 2D texture. `mips` holds tightly packed data per mip level and
    /// may be empty for render targets.
    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        mips: &[Vec<u8>],
    ) -> RhiResult<Self::Texture>;

    fn create_render_target_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::RenderTargetView>;

    fn create_shader_resource_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::ShaderResourceView>;

    fn create_depth_stencil_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::DepthStencilView>;

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> RhiResult<Self::Sampler>;

    fn create_vertex_shader(&mut self, source: &ShaderSource) -> RhiResult<Self::VertexShader>;

    fn create_pixel_shader(&mut self, source: &ShaderSource) -> RhiResult<Self::PixelShader>;

    /// Describe how vertex streams feed `shader`
    fn create_input_layout(
        &mut self,
        elements: &[InputElement],
        shader: &Self::VertexShader,
    ) -> RhiResult<Self::InputLayout>;

    // Swap chain

    /// Fetch the swap chain's back buffer
    fn back_buffer(&mut self) -> RhiResult<Self::Texture>;

    /// Width and height of a texture created by this device. For the back
    /// buffer this is the swap chain size after any clamping to device limits.
    fn texture_dimensions(&self, texture: &Self::Texture) -> (u32, u32);

    /// Resize the swap chain buffers. Every back buffer reference must have
    /// been dropped beforehand.
    fn resize_buffers(&mut self, width: u32, height: u32) -> RhiResult<()>;

    /// Submit outstanding work and present the back buffer
    fn present(&mut self) -> RhiResult<()>;

    // Immediate context

    fn set_depth_stencil_state(&mut self, state: DepthStencilState);

    fn set_rasterizer_state(&mut self, state: RasterizerState);

    fn clear_render_target_view(&mut self, view: &Self::RenderTargetView, color: [f32; 4]);

    /// Mark the contents of a render target as undefined
    fn discard_view(&mut self, view: &Self::RenderTargetView);

    fn clear_depth_stencil_view(&mut self, view: &Self::DepthStencilView, depth: f32);

    fn set_render_targets(
        &mut self,
        colors: &[&Self::RenderTargetView],
        depth: Option<&Self::DepthStencilView>,
    );

    fn set_viewport(&mut self, viewport: Viewport);

    /// `None` disables blending
    fn set_blend_state(&mut self, blend: Option<BlendState>);

    fn set_input_layout(&mut self, layout: &Self::InputLayout);

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);

    fn set_vertex_shader(&mut self, shader: &Self::VertexShader);

    fn set_pixel_shader(&mut self, shader: &Self::PixelShader);

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &Self::Buffer, stride: u32);

    fn set_index_buffer(&mut self, buffer: &Self::Buffer, format: IndexFormat);

    fn set_constant_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: &Self::Buffer);

    /// Bind shader resource views to consecutive pixel-stage slots. `None` unbinds a slot.
    fn set_shader_resources(
        &mut self,
        start_slot: u32,
        views: &[Option<&Self::ShaderResourceView>],
    );

    fn set_sampler(&mut self, slot: u32, sampler: &Self::Sampler);

    fn draw_indexed(&mut self, index_count: u32);

    /// Unbind everything the context references
    fn clear_state(&mut self);
}

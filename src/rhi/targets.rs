//! Render target management: back buffer, depth buffer and G-buffer.
//!
//! The back buffer view and the depth buffer always match the back buffer the
//! device returns, and the two G-buffer targets always match the back buffer.
//! Resizing recreates all of them; handles to the previous G-buffer stop
//! resolving.

use crate::backend::traits::RenderDevice;
use crate::backend::types::{TextureDescriptor, TextureFormat, TextureUsage, Viewport};
use crate::error::RhiResult;
use crate::handle::RenderTargetHandle;
use crate::rhi::{BackBuffer, DepthTarget, GBuffer, GpuRenderTarget, Rhi};

/// Format of both G-buffer targets
pub const GBUFFER_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
/// Format of the depth buffer
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24PlusStencil8;

impl<D: RenderDevice> Rhi<D> {
    /// Rebuild the back buffer view and depth buffer, then reset the viewport
    /// to cover them. Sizes come from the back buffer the device hands out,
    /// which may be smaller than the window when the device clamped it.
    ///
    /// Nothing is committed unless every object was created. Returns the
    /// back buffer size.
    pub(crate) fn recreate_back_buffer_and_depth(&mut self) -> RhiResult<(u32, u32)> {
        self.back_buffer = None;

        let texture = self.device.back_buffer()?;
        let (width, height) = self.device.texture_dimensions(&texture);
        let rtv = self.device.create_render_target_view(&texture)?;
        let back_buffer = BackBuffer { texture, rtv };

        let desc = TextureDescriptor {
            label: Some("Depth Buffer".into()),
            width,
            height,
            mip_levels: 1,
            format: DEPTH_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT,
        };
        let texture = self.device.create_texture(&desc, &[])?;
        let dsv = self.device.create_depth_stencil_view(&texture)?;

        self.back_buffer = Some(back_buffer);
        self.depth = Some(DepthTarget { texture, dsv });
        self.viewport = Viewport::full(width, height);
        self.device.set_viewport(self.viewport);
        self.width = width;
        self.height = height;

        log::debug!("Back buffer and depth buffer created at {}x{}", width, height);
        Ok((width, height))
    }

    /// Rebuild the color and normal G-buffer targets at `width` x `height`
    pub(crate) fn recreate_offscreen_targets(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if let Some(old) = self.gbuffer.take() {
            self.render_targets.remove(old.color);
            self.render_targets.remove(old.normal);
        }

        let color = self.create_render_target(width, height, "GBuffer Color")?;
        let normal = match self.create_render_target(width, height, "GBuffer Normal") {
            Ok(normal) => normal,
            Err(e) => {
                self.render_targets.remove(color);
                return Err(e);
            }
        };
        self.gbuffer = Some(GBuffer { color, normal });

        log::debug!("G-buffer created at {}x{}", width, height);
        Ok(())
    }

    /// Create an offscreen target that can be rendered to and sampled from
    pub fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        label: &str,
    ) -> RhiResult<RenderTargetHandle> {
        let desc = TextureDescriptor {
            label: Some(label.to_string()),
            width,
            height,
            mip_levels: 1,
            format: GBUFFER_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        };
        let texture = self
            .device
            .create_texture(&desc, &[])
            .inspect_err(|e| log::error!("{}: {}", label, e))?;
        let rtv = self.device.create_render_target_view(&texture)?;
        let srv = self.device.create_shader_resource_view(&texture)?;

        Ok(self.render_targets.insert(GpuRenderTarget {
            texture,
            rtv,
            srv,
            width,
            height,
        }))
    }

    /// Follow a change of the window's client area.
    ///
    /// A zero-sized client area (minimised window) is ignored. A frame in
    /// progress is abandoned: the G-buffer it was drawing into no longer exists.
    pub fn handle_window_resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        if (width, height) == (self.width, self.height) && self.back_buffer.is_some() {
            return Ok(());
        }

        // The G-buffer a frame in progress draws into is about to go away
        self.abandon_frame();

        log::info!("Resizing swap chain to {}x{}", width, height);

        // Every reference to the old back buffer must be gone before the
        // swap chain can resize.
        self.device.set_render_targets(&[], None);
        self.back_buffer = None;

        self.device
            .resize_buffers(width, height)
            .inspect_err(|e| log::error!("ResizeBuffers failed: {}", e))?;

        let (actual_width, actual_height) = self.recreate_back_buffer_and_depth()?;
        if (actual_width, actual_height) != (width, height) {
            log::warn!(
                "Swap chain clamped from {}x{} to {}x{}",
                width,
                height,
                actual_width,
                actual_height
            );
        }
        self.recreate_offscreen_targets(actual_width, actual_height)
    }
}

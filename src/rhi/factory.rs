//! Resource factory: GPU objects from CPU data, returned as handles

use crate::backend::traits::RenderDevice;
use crate::backend::types::*;
use crate::error::{RhiError, RhiResult};
use crate::handle::*;
use crate::resources::CpuTexture;
use crate::rhi::{
    lookup, GpuConstantBuffer, GpuIndexBuffer, GpuTexture, GpuVertexBuffer, Rhi, ShaderProgram,
};
use crate::IndexWidth;
use bytemuck::Pod;

/// Constant buffers are sized in 16 byte registers
const CONSTANT_BUFFER_ALIGNMENT: u64 = 16;

impl<D: RenderDevice> Rhi<D> {
    /// Create an immutable vertex stream from `elements`
    pub fn create_vertex_buffer<T: Pod>(
        &mut self,
        elements: &[T],
    ) -> RhiResult<VertexBufferHandle> {
        if elements.is_empty() {
            log::error!("Refusing to create an empty vertex buffer");
            return Err(RhiError::creation("vertex buffer", "element count is zero"));
        }
        let contents: &[u8] = bytemuck::cast_slice(elements);
        let buffer = self
            .device
            .create_buffer(
                &BufferDescriptor {
                    label: Some("Vertex Buffer".into()),
                    size: contents.len() as u64,
                    usage: BufferUsage::VERTEX,
                },
                Some(contents),
            )
            .inspect_err(|e| log::error!("CreateBuffer (vertex) failed: {}", e))?;

        Ok(self.vertex_buffers.insert(GpuVertexBuffer {
            buffer,
            stride: std::mem::size_of::<T>() as u32,
            count: elements.len() as u32,
        }))
    }

    /// Create an index buffer at the configured index width.
    ///
    /// With 16-bit indices, any index above 65535 fails with `IndexOverflow`
    /// instead of being truncated.
    pub fn create_index_buffer(&mut self, indices: &[u32]) -> RhiResult<IndexBufferHandle> {
        if indices.is_empty() {
            return Err(RhiError::creation("index buffer", "index count is zero"));
        }

        let width = self.config.index_width;
        if let Some(&index) = indices.iter().find(|&&i| i as u64 > width.max_index()) {
            log::error!("Index {} does not fit {:?} indices", index, width);
            return Err(RhiError::IndexOverflow {
                index: index as u64,
                max: width.max_index(),
            });
        }

        let (format, contents): (IndexFormat, Vec<u8>) = match width {
            IndexWidth::U16 => {
                let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
                (IndexFormat::Uint16, bytemuck::cast_slice(&narrow).to_vec())
            }
            IndexWidth::U32 => (IndexFormat::Uint32, bytemuck::cast_slice(indices).to_vec()),
        };

        let buffer = self
            .device
            .create_buffer(
                &BufferDescriptor {
                    label: Some("Index Buffer".into()),
                    size: contents.len() as u64,
                    usage: BufferUsage::INDEX,
                },
                Some(&contents),
            )
            .inspect_err(|e| log::error!("CreateBuffer (index) failed: {}", e))?;

        Ok(self.index_buffers.insert(GpuIndexBuffer {
            buffer,
            format,
            count: indices.len() as u32,
        }))
    }

    /// Create a CPU-writable constant buffer of at least `size` bytes
    pub fn create_constant_buffer(&mut self, size: u64) -> RhiResult<ConstantBufferHandle> {
        if size == 0 {
            return Err(RhiError::creation("constant buffer", "size is zero"));
        }
        let size = size.div_ceil(CONSTANT_BUFFER_ALIGNMENT) * CONSTANT_BUFFER_ALIGNMENT;
        let buffer = self
            .device
            .create_buffer(
                &BufferDescriptor {
                    label: Some("Constant Buffer".into()),
                    size,
                    usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                },
                None,
            )
            .inspect_err(|e| log::error!("CreateBuffer (constant) failed: {}", e))?;

        Ok(self.constant_buffers.insert(GpuConstantBuffer { buffer, size }))
    }

    /// Replace the contents of a constant buffer
    pub fn update_constant_buffer<T: Pod>(
        &mut self,
        handle: ConstantBufferHandle,
        data: &T,
    ) -> RhiResult<()> {
        let constant = lookup(&self.constant_buffers, handle, "constant buffer")?;
        let bytes = bytemuck::bytes_of(data);
        if bytes.len() as u64 > constant.size {
            return Err(RhiError::creation(
                "constant buffer update",
                format!("{} bytes exceed buffer size {}", bytes.len(), constant.size),
            ));
        }
        self.device.write_buffer(&constant.buffer, bytes)
    }

    /// Upload `texture` with a full mip chain, a shader view and a sampler
    pub fn create_texture_2d(&mut self, texture: &CpuTexture) -> RhiResult<Texture2DHandle> {
        let mips = texture.mip_chain();
        let mip_levels = mips.len() as u32;
        let desc = TextureDescriptor {
            label: Some(texture.name.clone()),
            width: texture.width,
            height: texture.height,
            mip_levels,
            format: texture.format,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        };

        let gpu_texture = self
            .device
            .create_texture(&desc, &mips)
            .inspect_err(|e| log::error!("CreateTexture2D {} failed: {}", texture.name, e))?;
        let srv = self.device.create_shader_resource_view(&gpu_texture)?;
        let sampler = self.device.create_sampler(&SamplerDescriptor::default())?;

        log::debug!(
            "Created texture {} ({}x{}, {} mips)",
            texture.name,
            texture.width,
            texture.height,
            mip_levels
        );

        Ok(self.textures.insert(GpuTexture {
            texture: gpu_texture,
            srv,
            sampler,
            width: texture.width,
            height: texture.height,
            mip_levels,
        }))
    }

    /// The 2x2 magenta texture used in place of missing ones
    pub fn create_debug_texture_2d(&mut self) -> RhiResult<Texture2DHandle> {
        self.create_texture_2d(&CpuTexture::debug())
    }

    /// Create a standalone sampler
    pub fn create_sampler(&mut self, desc: &SamplerDescriptor) -> RhiResult<SamplerHandle> {
        let sampler = self
            .device
            .create_sampler(desc)
            .inspect_err(|e| log::error!("CreateSamplerState failed: {}", e))?;
        Ok(self.samplers.insert(sampler))
    }

    /// Compile a vertex/pixel shader pair and the input layout that feeds it
    pub fn create_shader(
        &mut self,
        vertex: &ShaderSource,
        pixel: &ShaderSource,
        elements: &[InputElement],
    ) -> RhiResult<ShaderHandle> {
        let vs = self
            .device
            .create_vertex_shader(vertex)
            .inspect_err(|e| log::error!("CreateVertexShader {} failed: {}", vertex.label, e))?;
        let ps = self
            .device
            .create_pixel_shader(pixel)
            .inspect_err(|e| log::error!("CreatePixelShader {} failed: {}", pixel.label, e))?;
        let layout = self
            .device
            .create_input_layout(elements, &vs)
            .inspect_err(|e| log::error!("CreateInputLayout {} failed: {}", vertex.label, e))?;

        Ok(self.shaders.insert(ShaderProgram {
            vertex: vs,
            pixel: ps,
            layout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingDevice;
    use crate::window::Window;
    use crate::RhiConfig;
    use glam::Vec3;

    fn rhi(config: RhiConfig) -> Rhi<RecordingDevice> {
        Rhi::init(&Window::headless(64, 64), config).unwrap()
    }

    #[test]
    fn test_empty_vertex_buffer_is_rejected() {
        let mut rhi = rhi(RhiConfig::default());
        let empty: [Vec3; 0] = [];
        assert!(matches!(
            rhi.create_vertex_buffer(&empty),
            Err(RhiError::ResourceCreationFailed { .. })
        ));
    }

    #[test]
    fn test_u16_index_overflow() {
        let mut rhi = rhi(RhiConfig::default());
        assert_eq!(
            rhi.create_index_buffer(&[0, 1, 65_536]),
            Err(RhiError::IndexOverflow {
                index: 65_536,
                max: 65_535
            })
        );
        let handle = rhi.create_index_buffer(&[0, 1, 65_535]).unwrap();
        assert_eq!(rhi.index_count(handle), Ok(3));
    }

    #[test]
    fn test_u32_indices_accept_large_values() {
        let mut rhi = rhi(RhiConfig {
            index_width: IndexWidth::U32,
            ..Default::default()
        });
        let handle = rhi.create_index_buffer(&[0, 1, 70_000]).unwrap();
        assert_eq!(rhi.index_buffers[handle].format, IndexFormat::Uint32);
    }

    #[test]
    fn test_constant_buffer_rounds_to_registers() {
        let mut rhi = rhi(RhiConfig::default());
        let handle = rhi.create_constant_buffer(20).unwrap();
        assert_eq!(rhi.constant_buffers[handle].size, 32);

        let data = ConstantBufferData {
            mvp: glam::Mat4::IDENTITY,
            render_mode: glam::IVec4::ZERO,
        };
        assert!(rhi.update_constant_buffer(handle, &data).is_err());

        let handle = rhi
            .create_constant_buffer(std::mem::size_of::<ConstantBufferData>() as u64)
            .unwrap();
        rhi.update_constant_buffer(handle, &data).unwrap();
    }

    #[test]
    fn test_texture_gets_full_mip_chain() {
        let mut rhi = rhi(RhiConfig::default());
        let cpu = CpuTexture::solid_color(256, 128, [0, 255, 0, 255], "green");
        let handle = rhi.create_texture_2d(&cpu).unwrap();
        let info = rhi.texture_2d_info(handle).unwrap();
        assert_eq!((info.width, info.height, info.mip_levels), (256, 128, 9));
    }

    #[test]
    fn test_released_handle_is_invalid() {
        let mut rhi = rhi(RhiConfig::default());
        let handle = rhi.create_debug_texture_2d().unwrap();
        rhi.release_texture_2d(handle).unwrap();
        assert!(!rhi.contains_texture_2d(handle));
        assert_eq!(
            rhi.texture_2d_info(handle),
            Err(RhiError::InvalidHandle("texture"))
        );
        assert_eq!(
            rhi.release_texture_2d(handle),
            Err(RhiError::InvalidHandle("texture"))
        );
    }
}

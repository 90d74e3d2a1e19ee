//! Recording device for testing without GPU hardware
//!
//! This device performs no GPU work. It keeps a trace of every context call,
//! counts live objects and reports the binding mistakes a debug layer would
//! flag (a texture bound as both shader input and render target, draws with
//! missing state, resizing while back buffer references are alive).

use crate::backend::traits::RenderDevice;
use crate::backend::types::*;
use crate::backend::wgpu_backend::clamp_to_limit;
use crate::error::{RhiError, RhiResult};
use crate::rhi::bootstrap::select_adapter;
use crate::window::Window;
use crate::RhiConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Largest texture edge the recording device accepts, matching wgpu's
/// default `max_texture_dimension_2d`
pub const MAX_TEXTURE_DIMENSION: u32 = 8192;

/// One recorded context call. Objects are identified by their recording id.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    WriteBuffer { buffer: u64, len: usize },
    SetDepthStencilState(DepthStencilState),
    SetRasterizerState(RasterizerState),
    ClearRenderTarget { view: u64, color: [f32; 4] },
    DiscardView { view: u64 },
    ClearDepth { view: u64, depth: f32 },
    SetRenderTargets { colors: Vec<u64>, depth: Option<u64> },
    SetViewport(Viewport),
    SetBlendState(Option<BlendState>),
    SetInputLayout(u64),
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexShader(u64),
    SetPixelShader(u64),
    SetVertexBuffer { slot: u32, buffer: u64, stride: u32 },
    SetIndexBuffer { buffer: u64, format: IndexFormat },
    SetConstantBuffer { stage: ShaderStage, slot: u32, buffer: u64 },
    SetShaderResources { start_slot: u32, views: Vec<Option<u64>> },
    SetSampler { slot: u32, sampler: u64 },
    DrawIndexed { index_count: u32 },
    ResizeBuffers { width: u32, height: u32 },
    Present,
    ClearState,
}

#[derive(Debug, Default)]
struct RecordingLog {
    commands: Vec<Command>,
    validation: Vec<String>,
}

/// Shared view into a recording device that outlives the device itself.
#[derive(Debug, Clone)]
pub struct RecordingMonitor {
    log: Arc<Mutex<RecordingLog>>,
    live: Arc<AtomicUsize>,
}

impl RecordingMonitor {
    /// Every command recorded so far
    pub fn commands(&self) -> Vec<Command> {
        self.log.lock().commands.clone()
    }

    /// Drain the recorded commands
    pub fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.log.lock().commands)
    }

    /// Validation messages raised so far
    pub fn validation_messages(&self) -> Vec<String> {
        self.log.lock().validation.clone()
    }

    /// Number of device objects not yet dropped
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Keeps the live-object counters accurate for the lifetime of one object.
#[derive(Debug)]
struct LiveToken {
    live: Arc<AtomicUsize>,
    back_buffer_refs: Option<Arc<AtomicUsize>>,
}

impl LiveToken {
    fn new(live: &Arc<AtomicUsize>, back_buffer_refs: Option<&Arc<AtomicUsize>>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        if let Some(refs) = back_buffer_refs {
            refs.fetch_add(1, Ordering::AcqRel);
        }
        Self {
            live: Arc::clone(live),
            back_buffer_refs: back_buffer_refs.map(Arc::clone),
        }
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if let Some(refs) = &self.back_buffer_refs {
            refs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A recorded device object
#[derive(Debug)]
pub struct RecordedObject {
    id: u64,
    /// Texture the object refers to; a texture refers to itself
    texture: Option<u64>,
    size: u64,
    width: u32,
    height: u32,
    mip_levels: u32,
    format: Option<TextureFormat>,
    _token: LiveToken,
}

impl RecordedObject {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Byte size for buffers, zero otherwise
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Texture dimensions; views report their texture's dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn format(&self) -> Option<TextureFormat> {
        self.format
    }
}

/// Context state the validator checks against
#[derive(Debug, Default)]
struct BoundState {
    render_targets: Vec<u64>,
    depth_target: Option<u64>,
    shader_resources: HashMap<u32, u64>,
    vertex_shader: Option<u64>,
    pixel_shader: Option<u64>,
    input_layout: Option<u64>,
    index_buffer: bool,
}

/// Recording device
pub struct RecordingDevice {
    adapter: AdapterInfo,
    feature_level: FeatureLevel,
    width: u32,
    height: u32,
    back_buffer_id: Option<u64>,
    next_id: u64,
    bound: BoundState,
    monitor: RecordingMonitor,
    back_buffer_refs: Arc<AtomicUsize>,
}

impl RecordingDevice {
    /// Adapters reported when none are given explicitly
    pub fn default_adapters() -> Vec<AdapterInfo> {
        vec![
            AdapterInfo {
                name: "Recording Integrated Adapter".into(),
                vendor: 0x8086,
                device: 1,
            },
            AdapterInfo {
                name: "Recording Discrete Adapter".into(),
                vendor: 0x10DE,
                device: 2,
            },
        ]
    }

    /// Create a device choosing among the given adapters
    pub fn create_with_adapters(
        window: &Window,
        config: &RhiConfig,
        adapters: Vec<AdapterInfo>,
    ) -> RhiResult<Self> {
        let index = select_adapter(&adapters, &config.preferred_vendor_ids)?;
        let adapter = adapters[index].clone();
        log::info!(
            "RecordingDevice: selected adapter {} (vendor {:#06x})",
            adapter.name,
            adapter.vendor
        );

        let feature_level = config.feature_levels.first().copied().ok_or_else(|| {
            RhiError::DeviceCreationFailed("no feature level requested".into())
        })?;

        let (width, height) = window.dimensions();
        if width == 0 || height == 0 {
            return Err(RhiError::SwapChainCreationFailed(format!(
                "window size {}x{} is empty",
                width, height
            )));
        }

        let (width, height) = clamp_to_limit(width, height, MAX_TEXTURE_DIMENSION);

        Ok(Self {
            adapter,
            feature_level,
            width,
            height,
            back_buffer_id: None,
            next_id: 1,
            bound: BoundState::default(),
            monitor: RecordingMonitor {
                log: Arc::new(Mutex::new(RecordingLog::default())),
                live: Arc::new(AtomicUsize::new(0)),
            },
            back_buffer_refs: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Handle for observing this device from tests
    pub fn monitor(&self) -> RecordingMonitor {
        self.monitor.clone()
    }

    /// Current swap chain size
    pub fn swap_chain_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn record(&self, command: Command) {
        log::trace!("RecordingDevice: {:?}", command);
        self.monitor.log.lock().commands.push(command);
    }

    fn report(&self, message: String) {
        log::warn!("RecordingDevice validation: {}", message);
        self.monitor.log.lock().validation.push(message);
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn object(&mut self, texture: Option<u64>) -> RecordedObject {
        let id = self.allocate();
        self.object_with_id(id, texture)
    }

    fn object_with_id(&mut self, id: u64, texture: Option<u64>) -> RecordedObject {
        let on_back_buffer = texture.is_some() && texture == self.back_buffer_id;
        RecordedObject {
            id,
            texture,
            size: 0,
            width: 0,
            height: 0,
            mip_levels: 0,
            format: None,
            _token: LiveToken::new(
                &self.monitor.live,
                on_back_buffer.then_some(&self.back_buffer_refs),
            ),
        }
    }

    fn view_of(&mut self, texture: &RecordedObject) -> RecordedObject {
        let mut view = self.object(texture.texture);
        view.width = texture.width;
        view.height = texture.height;
        view.mip_levels = texture.mip_levels;
        view.format = texture.format;
        view
    }

    fn check_hazards(&self) {
        for (slot, texture) in &self.bound.shader_resources {
            if self.bound.render_targets.contains(texture) {
                self.report(format!(
                    "texture {} is bound as shader resource t{} while bound as render target",
                    texture, slot
                ));
            }
        }
    }
}

impl RenderDevice for RecordingDevice {
    type Buffer = RecordedObject;
    type Texture = RecordedObject;
    type RenderTargetView = RecordedObject;
    type ShaderResourceView = RecordedObject;
    type DepthStencilView = RecordedObject;
    type Sampler = RecordedObject;
    type VertexShader = RecordedObject;
    type PixelShader = RecordedObject;
    type InputLayout = RecordedObject;

    fn create(window: &Window, config: &RhiConfig) -> RhiResult<Self> {
        Self::create_with_adapters(window, config, Self::default_adapters())
    }

    fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDescriptor,
        contents: Option<&[u8]>,
    ) -> RhiResult<Self::Buffer> {
        if desc.size == 0 {
            return Err(RhiError::creation("buffer", "size is zero"));
        }
        if let Some(data) = contents {
            if data.len() as u64 > desc.size {
                return Err(RhiError::creation(
                    "buffer",
                    format!("{} bytes of contents exceed size {}", data.len(), desc.size),
                ));
            }
        }
        log::trace!(
            "RecordingDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let mut buffer = self.object(None);
        buffer.size = desc.size;
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: &Self::Buffer, data: &[u8]) -> RhiResult<()> {
        if data.len() as u64 > buffer.size {
            return Err(RhiError::creation(
                "buffer write",
                format!("{} bytes exceed buffer size {}", data.len(), buffer.size),
            ));
        }
        self.record(Command::WriteBuffer {
            buffer: buffer.id,
            len: data.len(),
        });
        Ok(())
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        mips: &[Vec<u8>],
    ) -> RhiResult<Self::Texture> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RhiError::creation("texture", "texture has zero extent"));
        }
        if desc.width > MAX_TEXTURE_DIMENSION || desc.height > MAX_TEXTURE_DIMENSION {
            return Err(RhiError::creation(
                "texture",
                format!(
                    "{}x{} exceeds the {} limit",
                    desc.width, desc.height, MAX_TEXTURE_DIMENSION
                ),
            ));
        }
        if !mips.is_empty() && mips.len() as u32 != desc.mip_levels {
            return Err(RhiError::creation(
                "texture",
                format!(
                    "{} mip levels supplied for {} declared",
                    mips.len(),
                    desc.mip_levels
                ),
            ));
        }
        log::trace!(
            "RecordingDevice: creating texture {:?} ({}x{}, {} mips)",
            desc.label,
            desc.width,
            desc.height,
            desc.mip_levels
        );
        let id = self.allocate();
        let mut texture = self.object_with_id(id, Some(id));
        texture.width = desc.width;
        texture.height = desc.height;
        texture.mip_levels = desc.mip_levels;
        texture.format = Some(desc.format);
        Ok(texture)
    }

    fn create_render_target_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::RenderTargetView> {
        Ok(self.view_of(texture))
    }

    fn create_shader_resource_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::ShaderResourceView> {
        Ok(self.view_of(texture))
    }

    fn create_depth_stencil_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::DepthStencilView> {
        if !texture.format.is_some_and(|f| f.is_depth()) {
            return Err(RhiError::creation(
                "depth stencil view",
                "texture format is not a depth format",
            ));
        }
        Ok(self.view_of(texture))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> RhiResult<Self::Sampler> {
        log::trace!("RecordingDevice: creating sampler {:?}", desc.label);
        Ok(self.object(None))
    }

    fn create_vertex_shader(&mut self, source: &ShaderSource) -> RhiResult<Self::VertexShader> {
        if !source.wgsl.contains(source.entry_point) {
            return Err(RhiError::creation(
                "vertex shader",
                format!("{}: entry point {} not found", source.label, source.entry_point),
            ));
        }
        Ok(self.object(None))
    }

    fn create_pixel_shader(&mut self, source: &ShaderSource) -> RhiResult<Self::PixelShader> {
        if !source.wgsl.contains(source.entry_point) {
            return Err(RhiError::creation(
                "pixel shader",
                format!("{}: entry point {} not found", source.label, source.entry_point),
            ));
        }
        Ok(self.object(None))
    }

    fn create_input_layout(
        &mut self,
        elements: &[InputElement],
        _shader: &Self::VertexShader,
    ) -> RhiResult<Self::InputLayout> {
        if elements.is_empty() {
            return Err(RhiError::creation("input layout", "no input elements"));
        }
        Ok(self.object(None))
    }

    fn back_buffer(&mut self) -> RhiResult<Self::Texture> {
        let id = match self.back_buffer_id {
            Some(id) => id,
            None => {
                let id = self.allocate();
                self.back_buffer_id = Some(id);
                id
            }
        };
        let mut texture = self.object_with_id(id, Some(id));
        texture.width = self.width;
        texture.height = self.height;
        texture.mip_levels = 1;
        texture.format = Some(TextureFormat::Rgba8Unorm);
        Ok(texture)
    }

    fn texture_dimensions(&self, texture: &Self::Texture) -> (u32, u32) {
        texture.dimensions()
    }

    fn resize_buffers(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let outstanding = self.back_buffer_refs.load(Ordering::Acquire);
        if outstanding > 0 {
            self.report(format!(
                "resize_buffers called with {} outstanding back buffer references",
                outstanding
            ));
            return Err(RhiError::ResizeFailed(format!(
                "{} back buffer references are still alive",
                outstanding
            )));
        }
        self.record(Command::ResizeBuffers { width, height });
        let (width, height) = clamp_to_limit(width, height, MAX_TEXTURE_DIMENSION);
        self.width = width;
        self.height = height;
        // A resized swap chain hands out a new back buffer
        self.back_buffer_id = None;
        Ok(())
    }

    fn present(&mut self) -> RhiResult<()> {
        self.record(Command::Present);
        Ok(())
    }

    fn set_depth_stencil_state(&mut self, state: DepthStencilState) {
        self.record(Command::SetDepthStencilState(state));
    }

    fn set_rasterizer_state(&mut self, state: RasterizerState) {
        self.record(Command::SetRasterizerState(state));
    }

    fn clear_render_target_view(&mut self, view: &Self::RenderTargetView, color: [f32; 4]) {
        self.record(Command::ClearRenderTarget {
            view: view.id,
            color,
        });
    }

    fn discard_view(&mut self, view: &Self::RenderTargetView) {
        self.record(Command::DiscardView { view: view.id });
    }

    fn clear_depth_stencil_view(&mut self, view: &Self::DepthStencilView, depth: f32) {
        self.record(Command::ClearDepth {
            view: view.id,
            depth,
        });
    }

    fn set_render_targets(
        &mut self,
        colors: &[&Self::RenderTargetView],
        depth: Option<&Self::DepthStencilView>,
    ) {
        let mut sizes = colors
            .iter()
            .map(|v| v.dimensions())
            .chain(depth.map(|d| d.dimensions()));
        if let Some(first) = sizes.next() {
            if let Some(other) = sizes.find(|&size| size != first) {
                self.report(format!(
                    "render targets bound with mismatched sizes {:?} and {:?}",
                    first, other
                ));
            }
        }

        self.bound.render_targets = colors.iter().filter_map(|v| v.texture).collect();
        self.bound.depth_target = depth.and_then(|d| d.texture);
        self.record(Command::SetRenderTargets {
            colors: colors.iter().map(|v| v.id).collect(),
            depth: depth.map(|d| d.id),
        });
        self.check_hazards();
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(Command::SetViewport(viewport));
    }

    fn set_blend_state(&mut self, blend: Option<BlendState>) {
        self.record(Command::SetBlendState(blend));
    }

    fn set_input_layout(&mut self, layout: &Self::InputLayout) {
        self.bound.input_layout = Some(layout.id);
        self.record(Command::SetInputLayout(layout.id));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record(Command::SetPrimitiveTopology(topology));
    }

    fn set_vertex_shader(&mut self, shader: &Self::VertexShader) {
        self.bound.vertex_shader = Some(shader.id);
        self.record(Command::SetVertexShader(shader.id));
    }

    fn set_pixel_shader(&mut self, shader: &Self::PixelShader) {
        self.bound.pixel_shader = Some(shader.id);
        self.record(Command::SetPixelShader(shader.id));
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &Self::Buffer, stride: u32) {
        self.record(Command::SetVertexBuffer {
            slot,
            buffer: buffer.id,
            stride,
        });
    }

    fn set_index_buffer(&mut self, buffer: &Self::Buffer, format: IndexFormat) {
        self.bound.index_buffer = true;
        self.record(Command::SetIndexBuffer {
            buffer: buffer.id,
            format,
        });
    }

    fn set_constant_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: &Self::Buffer) {
        self.record(Command::SetConstantBuffer {
            stage,
            slot,
            buffer: buffer.id,
        });
    }

    fn set_shader_resources(
        &mut self,
        start_slot: u32,
        views: &[Option<&Self::ShaderResourceView>],
    ) {
        for (offset, view) in views.iter().enumerate() {
            let slot = start_slot + offset as u32;
            match view.and_then(|v| v.texture) {
                Some(texture) => {
                    self.bound.shader_resources.insert(slot, texture);
                }
                None => {
                    self.bound.shader_resources.remove(&slot);
                }
            }
        }
        self.record(Command::SetShaderResources {
            start_slot,
            views: views.iter().map(|v| v.map(|v| v.id)).collect(),
        });
        self.check_hazards();
    }

    fn set_sampler(&mut self, slot: u32, sampler: &Self::Sampler) {
        self.record(Command::SetSampler {
            slot,
            sampler: sampler.id,
        });
    }

    fn draw_indexed(&mut self, index_count: u32) {
        if self.bound.render_targets.is_empty() && self.bound.depth_target.is_none() {
            self.report("draw_indexed with no render target bound".into());
        }
        if self.bound.vertex_shader.is_none() || self.bound.pixel_shader.is_none() {
            self.report("draw_indexed with no shader bound".into());
        }
        if self.bound.input_layout.is_none() {
            self.report("draw_indexed with no input layout bound".into());
        }
        if !self.bound.index_buffer {
            self.report("draw_indexed with no index buffer bound".into());
        }
        self.record(Command::DrawIndexed { index_count });
    }

    fn clear_state(&mut self) {
        self.bound = BoundState::default();
        self.record(Command::ClearState);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> RecordingDevice {
        let window = Window::headless(64, 32);
        RecordingDevice::create(&window, &RhiConfig::default()).unwrap()
    }

    #[test]
    fn test_prefers_discrete_vendor() {
        let device = device();
        assert_eq!(device.adapter_info().vendor, 0x10DE);
        assert_eq!(device.feature_level(), FeatureLevel::Full);
    }

    #[test]
    fn test_objects_counted_until_dropped() {
        let mut device = device();
        let monitor = device.monitor();
        let buffer = device
            .create_buffer(
                &BufferDescriptor {
                    label: None,
                    size: 16,
                    usage: BufferUsage::UNIFORM,
                },
                None,
            )
            .unwrap();
        let sampler = device.create_sampler(&SamplerDescriptor::default()).unwrap();
        assert_eq!(monitor.live_objects(), 2);

        drop(buffer);
        drop(sampler);
        assert_eq!(monitor.live_objects(), 0);
    }

    #[test]
    fn test_srv_bound_as_render_target_is_reported() {
        let mut device = device();
        let monitor = device.monitor();
        let texture = device
            .create_texture(
                &TextureDescriptor {
                    width: 4,
                    height: 4,
                    format: TextureFormat::Rgba16Float,
                    usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                    ..Default::default()
                },
                &[],
            )
            .unwrap();
        let rtv = device.create_render_target_view(&texture).unwrap();
        let srv = device.create_shader_resource_view(&texture).unwrap();

        device.set_shader_resources(0, &[Some(&srv)]);
        assert!(monitor.validation_messages().is_empty());

        device.set_render_targets(&[&rtv], None);
        assert_eq!(monitor.validation_messages().len(), 1);
    }

    #[test]
    fn test_resize_with_live_back_buffer_fails() {
        let mut device = device();
        let back_buffer = device.back_buffer().unwrap();
        let rtv = device.create_render_target_view(&back_buffer).unwrap();

        assert!(matches!(
            device.resize_buffers(128, 64),
            Err(RhiError::ResizeFailed(_))
        ));

        drop(rtv);
        drop(back_buffer);
        device.resize_buffers(128, 64).unwrap();
        assert_eq!(device.swap_chain_size(), (128, 64));
    }
}

//! wgpu device implementation
//!
//! wgpu has no immediate context, so this device keeps the bound state on the
//! CPU and turns it into render passes. Draws are batched into a pass until
//! the bound targets change, a clear or buffer write needs ordering, or the
//! frame is presented. Clears issued before a pass opens become the pass's
//! load operations.
//!
//! Every pipeline shares one bind group layout (group 0):
//!
//! | binding | resource                   | bound through                  |
//! |---------|----------------------------|--------------------------------|
//! | 0       | vertex constant buffer     | `set_constant_buffer(Vertex, 0)` |
//! | 1       | pixel constant buffer      | `set_constant_buffer(Pixel, 0)`  |
//! | 2       | `texture_2d<f32>` t0       | `set_shader_resources(0, ..)`    |
//! | 3       | `texture_2d<f32>` t1       | `set_shader_resources(1, ..)`    |
//! | 4       | filtering sampler s0       | `set_sampler(0, ..)`             |
//!
//! Unbound slots read placeholder resources.

mod context;
mod convert;

use crate::backend::traits::RenderDevice;
use crate::backend::types::*;
use crate::error::{RhiError, RhiResult};
use crate::rhi::bootstrap::select_adapter;
use crate::window::Window;
use crate::RhiConfig;
use context::{ContextState, OpenPass, PendingClear, PipelineKey};
use convert::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// GPU buffer
#[derive(Debug, Clone)]
pub struct WgpuBuffer {
    buffer: Arc<wgpu::Buffer>,
    size: u64,
}

impl WgpuBuffer {
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// GPU texture, or the swap chain's current back buffer
#[derive(Debug, Clone)]
pub struct WgpuTexture {
    /// `None` for a surface back buffer, which changes every frame
    texture: Option<Arc<wgpu::Texture>>,
    id: u64,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    back_buffer: Option<Arc<()>>,
}

impl WgpuTexture {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> TextureFormat {
        convert_texture_format_back(self.format)
    }
}

/// Render target, shader resource or depth stencil view
#[derive(Debug, Clone)]
pub struct WgpuView {
    /// `None` resolves to the current surface frame
    view: Option<Arc<wgpu::TextureView>>,
    texture_id: u64,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    #[allow(dead_code)]
    back_buffer: Option<Arc<()>>,
}

#[derive(Debug, Clone)]
pub struct WgpuSampler {
    sampler: Arc<wgpu::Sampler>,
}

/// One stage of a shader program
#[derive(Debug, Clone)]
pub struct WgpuShader {
    module: Arc<wgpu::ShaderModule>,
    entry_point: String,
    id: u64,
}

#[derive(Debug, Clone)]
pub struct WgpuInputLayout {
    elements: Vec<InputElement>,
    id: u64,
}

struct Frame {
    texture: wgpu::SurfaceTexture,
    view: Arc<wgpu::TextureView>,
}

struct SwapChain {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    frame: Option<Frame>,
}

impl SwapChain {
    /// View of the frame being rendered, acquiring one if needed
    fn current_view(&mut self, device: &wgpu::Device) -> RhiResult<Arc<wgpu::TextureView>> {
        if let Some(frame) = &self.frame {
            return Ok(Arc::clone(&frame.view));
        }

        let texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("Surface lost or outdated, reconfiguring");
                self.surface.configure(device, &self.config);
                self.surface
                    .get_current_texture()
                    .map_err(|e| RhiError::PresentFailed(e.to_string()))?
            }
            Err(e) => return Err(RhiError::PresentFailed(e.to_string())),
        };

        let view = Arc::new(
            texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default()),
        );
        self.frame = Some(Frame {
            texture,
            view: Arc::clone(&view),
        });
        Ok(view)
    }
}

/// Back buffer of a device created without a native window
struct Offscreen {
    texture: Arc<wgpu::Texture>,
    width: u32,
    height: u32,
}

impl Offscreen {
    const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Back Buffer"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        Self {
            texture: Arc::new(texture),
            width,
            height,
        }
    }
}

enum Presenter {
    Surface(SwapChain),
    Offscreen(Offscreen),
}

/// Resources read by unbound slots
struct Placeholders {
    uniform: wgpu::Buffer,
    texture_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

impl Placeholders {
    fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Placeholder Uniform"),
            size: 256,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });

        let texture = device.create_texture_with_data(
            queue,
            &wgpu::TextureDescriptor {
                label: Some("Placeholder Texture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[255, 255, 255, 255],
        );

        Self {
            uniform,
            texture_view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
            sampler: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("Placeholder Sampler"),
                ..Default::default()
            }),
        }
    }
}

/// wgpu implementation of [`RenderDevice`]
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: AdapterInfo,
    feature_level: FeatureLevel,
    presenter: Presenter,

    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    placeholders: Placeholders,
    pipelines: HashMap<PipelineKey, Arc<wgpu::RenderPipeline>>,

    state: ContextState,
    pending_clears: HashMap<u64, PendingClear>,
    open_pass: Option<OpenPass>,
    encoder: Option<wgpu::CommandEncoder>,

    back_buffer_id: u64,
    back_buffer_token: Arc<()>,
    next_id: u64,
    frame_error: Option<String>,
    validation: Arc<Mutex<Vec<String>>>,
}

/// Present mode for the swap chain. `RhiConfig::vsync` is the only switch.
pub fn present_mode(vsync: bool) -> wgpu::PresentMode {
    if vsync {
        wgpu::PresentMode::AutoVsync
    } else {
        wgpu::PresentMode::AutoNoVsync
    }
}

/// Fit `width` x `height` inside `max` on both axes, keeping the aspect ratio
pub fn clamp_to_limit(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width > max || height > max {
        let scale = (max as f32 / width as f32).min(max as f32 / height as f32);
        let new_width = ((width as f32 * scale) as u32).clamp(1, max);
        let new_height = ((height as f32 * scale) as u32).clamp(1, max);
        (new_width, new_height)
    } else {
        (width.max(1), height.max(1))
    }
}

impl WgpuDevice {
    /// Async initialization, wrapped by [`RenderDevice::create`]
    pub async fn new_async(window: &Window, config: &RhiConfig) -> RhiResult<Self> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::all());
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let surface = match window.native() {
            Some(native) => Some(
                instance
                    .create_surface(native)
                    .map_err(|e| RhiError::SwapChainCreationFailed(e.to_string()))?,
            ),
            None => None,
        };

        let mut adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(backends)
            .into_iter()
            .filter(|a| surface.as_ref().map_or(true, |s| a.is_surface_supported(s)))
            .collect();
        let infos: Vec<AdapterInfo> = adapters
            .iter()
            .map(|a| {
                let info = a.get_info();
                AdapterInfo {
                    name: info.name,
                    vendor: info.vendor,
                    device: info.device,
                }
            })
            .collect();
        let index = select_adapter(&infos, &config.preferred_vendor_ids)?;
        let adapter = adapters.swap_remove(index);
        let adapter_info = infos[index].clone();

        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter.get_info().backend
        );

        let (device, queue, feature_level) =
            Self::request_device(&adapter, &config.feature_levels).await?;

        let validation = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&validation);
        device.on_uncaptured_error(Box::new(move |error: wgpu::Error| {
            log::error!("wgpu: {}", error);
            sink.lock().push(error.to_string());
        }));

        let (width, height) = window.dimensions();
        if width == 0 || height == 0 {
            return Err(RhiError::SwapChainCreationFailed(format!(
                "window size {}x{} is empty",
                width, height
            )));
        }
        let (width, height) =
            clamp_to_limit(width, height, device.limits().max_texture_dimension_2d);

        let presenter = match surface {
            Some(surface) => Presenter::Surface(Self::configure_surface(
                surface, &adapter, &device, config, width, height,
            )?),
            None => {
                log::info!("No native window, rendering offscreen at {}x{}", width, height);
                Presenter::Offscreen(Offscreen::new(&device, width, height))
            }
        };

        let bind_group_layout = Self::create_bind_group_layout(&device);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("rndr pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let placeholders = Placeholders::new(&device, &queue);

        Ok(Self {
            device,
            queue,
            adapter_info,
            feature_level,
            presenter,
            bind_group_layout,
            pipeline_layout,
            placeholders,
            pipelines: HashMap::new(),
            state: ContextState::default(),
            pending_clears: HashMap::new(),
            open_pass: None,
            encoder: None,
            back_buffer_id: 1,
            back_buffer_token: Arc::new(()),
            next_id: 2,
            frame_error: None,
            validation,
        })
    }

    /// Request a device at the first feature level the adapter accepts
    async fn request_device(
        adapter: &wgpu::Adapter,
        levels: &[FeatureLevel],
    ) -> RhiResult<(wgpu::Device, wgpu::Queue, FeatureLevel)> {
        for level in levels {
            let result = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("rndr device"),
                        required_features: wgpu::Features::empty(),
                        required_limits: level.limits(),
                    },
                    None,
                )
                .await;
            match result {
                Ok((device, queue)) => {
                    log::info!("Device created at feature level {:?}", level);
                    return Ok((device, queue, *level));
                }
                Err(e) => log::warn!("Feature level {:?} rejected: {}", level, e),
            }
        }
        Err(RhiError::DeviceCreationFailed(format!(
            "none of the feature levels {:?} are supported",
            levels
        )))
    }

    fn configure_surface(
        surface: wgpu::Surface<'static>,
        adapter: &wgpu::Adapter,
        device: &wgpu::Device,
        config: &RhiConfig,
        width: u32,
        height: u32,
    ) -> RhiResult<SwapChain> {
        let caps = surface.get_capabilities(adapter);
        let requested = convert_texture_format(config.swap_chain.format);
        let format = [
            requested,
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::Bgra8Unorm,
        ]
        .into_iter()
        .find(|f| caps.formats.contains(f))
        .or_else(|| caps.formats.first().copied())
        .ok_or_else(|| {
            RhiError::SwapChainCreationFailed("surface reports no formats".into())
        })?;

        let present_mode = present_mode(config.vsync);

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: config.swap_chain.buffer_count.clamp(1, 3),
        };
        surface.configure(device, &surface_config);
        log::info!(
            "Swap chain configured: {:?} {}x{} ({:?})",
            format,
            width,
            height,
            present_mode
        );

        Ok(SwapChain {
            surface,
            config: surface_config,
            frame: None,
        })
    }

    fn create_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let uniform = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let texture = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("rndr bind group layout"),
            entries: &[
                uniform(0),
                uniform(1),
                texture(2),
                texture(3),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Errors reported by wgpu validation and binding hazards caught by the device
    pub fn validation_messages(&self) -> Vec<String> {
        self.validation.lock().clone()
    }

    pub(crate) fn report(&self, message: String) {
        log::warn!("WgpuDevice: {}", message);
        self.validation.lock().push(message);
    }

    /// Whether the back buffer is an offscreen texture
    pub fn is_offscreen(&self) -> bool {
        matches!(self.presenter, Presenter::Offscreen(_))
    }

    /// Format of the back buffer
    pub fn back_buffer_format(&self) -> wgpu::TextureFormat {
        match &self.presenter {
            Presenter::Surface(swap_chain) => swap_chain.config.format,
            Presenter::Offscreen(_) => Offscreen::FORMAT,
        }
    }

    fn back_buffer_size(&self) -> (u32, u32) {
        match &self.presenter {
            Presenter::Surface(swap_chain) => (swap_chain.config.width, swap_chain.config.height),
            Presenter::Offscreen(offscreen) => (offscreen.width, offscreen.height),
        }
    }

    /// Submit all outstanding work and copy the offscreen back buffer to the
    /// CPU as tightly packed RGBA8 rows.
    pub fn read_back_buffer(&mut self) -> RhiResult<Vec<u8>> {
        self.flush();

        let Presenter::Offscreen(offscreen) = &self.presenter else {
            return Err(RhiError::creation(
                "readback",
                "the back buffer belongs to a window surface",
            ));
        };
        let (width, height) = (offscreen.width, offscreen.height);
        let unpadded = width * 4;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging Buffer"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &offscreen.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RhiError::creation("readback", e.to_string())),
            Err(e) => return Err(RhiError::creation("readback", e.to_string())),
        }

        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded as usize) {
                pixels.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        staging.unmap();
        Ok(pixels)
    }

    /// Run a wgpu call inside a validation error scope
    fn validated<T>(
        &self,
        kind: &'static str,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> RhiResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(RhiError::creation(kind, error.to_string())),
            None => Ok(value),
        }
    }

    fn create_shader(
        &mut self,
        kind: &'static str,
        source: &ShaderSource,
    ) -> RhiResult<WgpuShader> {
        if !source.wgsl.contains(source.entry_point) {
            return Err(RhiError::creation(
                kind,
                format!("{}: entry point {} not found", source.label, source.entry_point),
            ));
        }
        let module = self.validated(kind, |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(source.label),
                source: wgpu::ShaderSource::Wgsl(source.wgsl.into()),
            })
        })?;
        Ok(WgpuShader {
            module: Arc::new(module),
            entry_point: source.entry_point.to_string(),
            id: self.allocate_id(),
        })
    }

    fn view_of(&self, texture: &WgpuTexture) -> WgpuView {
        WgpuView {
            view: texture.texture.as_ref().map(|t| {
                Arc::new(t.create_view(&wgpu::TextureViewDescriptor::default()))
            }),
            texture_id: texture.id,
            format: texture.format,
            width: texture.width,
            height: texture.height,
            back_buffer: texture.back_buffer.clone(),
        }
    }
}

impl RenderDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Texture = WgpuTexture;
    type RenderTargetView = WgpuView;
    type ShaderResourceView = WgpuView;
    type DepthStencilView = WgpuView;
    type Sampler = WgpuSampler;
    type VertexShader = WgpuShader;
    type PixelShader = WgpuShader;
    type InputLayout = WgpuInputLayout;

    fn create(window: &Window, config: &RhiConfig) -> RhiResult<Self> {
        pollster::block_on(Self::new_async(window, config))
    }

    fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter_info
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
        let usage = convert_buffer_usage(desc.usage);

        let buffer = match contents {
            Some(data) if data.len() as u64 > desc.size => {
                return Err(RhiError::creation(
                    "buffer",
                    format!("{} bytes of contents exceed size {}", data.len(), desc.size),
                ));
            }
            Some(data) => {
                let mut padded = data.to_vec();
                padded.resize(desc.size as usize, 0);
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: desc.label.as_deref(),
                        contents: &padded,
                        usage,
                    })
            }
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: desc.label.as_deref(),
                size: desc.size,
                usage,
                mapped_at_creation: false,
            }),
        };

        Ok(WgpuBuffer {
            buffer: Arc::new(buffer),
            size: desc.size,
        })
    }

    fn write_buffer(&mut self, buffer: &Self::Buffer, data: &[u8]) -> RhiResult<()> {
        if data.len() as u64 > buffer.size {
            return Err(RhiError::creation(
                "buffer write",
                format!("{} bytes exceed buffer size {}", data.len(), buffer.size),
            ));
        }
        // Draws already recorded must read the old contents
        self.flush_pass();
        self.submit();

        let aligned = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if aligned == data.len() as u64 {
            self.queue.write_buffer(&buffer.buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(aligned.min(buffer.size) as usize, 0);
            self.queue.write_buffer(&buffer.buffer, 0, &padded);
        }
        Ok(())
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        mips: &[Vec<u8>],
    ) -> RhiResult<Self::Texture> {
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(RhiError::creation(
                "texture",
                format!("{}x{} is outside 1..={}", desc.width, desc.height, max),
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

        let format = convert_texture_format(desc.format);
        let mut usage = convert_texture_usage(desc.usage);
        if !mips.is_empty() {
            usage |= wgpu::TextureUsages::COPY_DST;
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });

        let bytes_per_pixel = desc.format.bytes_per_pixel();
        for (level, data) in mips.iter().enumerate() {
            let width = (desc.width >> level).max(1);
            let height = (desc.height >> level).max(1);
            let expected = (width * height * bytes_per_pixel) as usize;
            if data.len() != expected {
                return Err(RhiError::creation(
                    "texture",
                    format!("mip {} has {} bytes, expected {}", level, data.len(), expected),
                ));
            }
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: level as u32,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(width * bytes_per_pixel),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
        }

        Ok(WgpuTexture {
            texture: Some(Arc::new(texture)),
            id: self.allocate_id(),
            format,
            width: desc.width,
            height: desc.height,
            back_buffer: None,
        })
    }

    fn create_render_target_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::RenderTargetView> {
        if texture.format.is_depth_stencil_format() {
            return Err(RhiError::creation(
                "render target view",
                "texture has a depth format",
            ));
        }
        Ok(self.view_of(texture))
    }

    fn create_shader_resource_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::ShaderResourceView> {
        if texture.texture.is_none() {
            return Err(RhiError::creation(
                "shader resource view",
                "the surface back buffer cannot be sampled",
            ));
        }
        Ok(self.view_of(texture))
    }

    fn create_depth_stencil_view(
        &mut self,
        texture: &Self::Texture,
    ) -> RhiResult<Self::DepthStencilView> {
        if !texture.format.is_depth_stencil_format() {
            return Err(RhiError::creation(
                "depth stencil view",
                "texture format is not a depth format",
            ));
        }
        Ok(self.view_of(texture))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> RhiResult<Self::Sampler> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: convert_address_mode(desc.address_mode_u),
            address_mode_v: convert_address_mode(desc.address_mode_v),
            address_mode_w: convert_address_mode(desc.address_mode_w),
            mag_filter: convert_filter_mode(desc.mag_filter),
            min_filter: convert_filter_mode(desc.min_filter),
            mipmap_filter: convert_filter_mode(desc.mipmap_filter),
            lod_min_clamp: 0.0,
            lod_max_clamp: desc.lod_max_clamp,
            compare: None,
            anisotropy_clamp: 1,
            border_color: None,
        });
        Ok(WgpuSampler {
            sampler: Arc::new(sampler),
        })
    }

    fn create_vertex_shader(&mut self, source: &ShaderSource) -> RhiResult<Self::VertexShader> {
        self.create_shader("vertex shader", source)
    }

    fn create_pixel_shader(&mut self, source: &ShaderSource) -> RhiResult<Self::PixelShader> {
        self.create_shader("pixel shader", source)
    }

    fn create_input_layout(
        &mut self,
        elements: &[InputElement],
        shader: &Self::VertexShader,
    ) -> RhiResult<Self::InputLayout> {
        if elements.is_empty() {
            return Err(RhiError::creation("input layout", "no input elements"));
        }
        for (i, element) in elements.iter().enumerate() {
            if elements[..i].iter().any(|e| e.slot == element.slot) {
                return Err(RhiError::creation(
                    "input layout",
                    format!(
                        "{} shares slot {} with another element",
                        element.semantic, element.slot
                    ),
                ));
            }
        }
        log::trace!(
            "Input layout for shader {} ({}): {:?}",
            shader.id,
            shader.entry_point,
            elements.iter().map(|e| e.semantic).collect::<Vec<_>>()
        );
        Ok(WgpuInputLayout {
            elements: elements.to_vec(),
            id: self.allocate_id(),
        })
    }

    fn back_buffer(&mut self) -> RhiResult<Self::Texture> {
        let (width, height) = self.back_buffer_size();
        let texture = match &self.presenter {
            Presenter::Surface(_) => None,
            Presenter::Offscreen(offscreen) => Some(Arc::clone(&offscreen.texture)),
        };
        Ok(WgpuTexture {
            texture,
            id: self.back_buffer_id,
            format: self.back_buffer_format(),
            width,
            height,
            back_buffer: Some(Arc::clone(&self.back_buffer_token)),
        })
    }

    fn texture_dimensions(&self, texture: &Self::Texture) -> (u32, u32) {
        texture.dimensions()
    }

    fn resize_buffers(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if width == 0 || height == 0 {
            return Err(RhiError::ResizeFailed(format!("{}x{} is empty", width, height)));
        }
        self.flush();

        let outstanding = Arc::strong_count(&self.back_buffer_token) - 1;
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

        let (width, height) =
            clamp_to_limit(width, height, self.device.limits().max_texture_dimension_2d);
        match &mut self.presenter {
            Presenter::Surface(swap_chain) => {
                swap_chain.frame = None;
                swap_chain.config.width = width;
                swap_chain.config.height = height;
                swap_chain.surface.configure(&self.device, &swap_chain.config);
            }
            Presenter::Offscreen(offscreen) => {
                *offscreen = Offscreen::new(&self.device, width, height);
            }
        }
        self.back_buffer_id = self.allocate_id();
        log::debug!("Swap chain resized to {}x{}", width, height);
        Ok(())
    }

    fn present(&mut self) -> RhiResult<()> {
        self.flush();

        if let Presenter::Surface(swap_chain) = &mut self.presenter {
            if let Some(Frame { texture, view }) = swap_chain.frame.take() {
                drop(view);
                texture.present();
            } else {
                log::trace!("Present with nothing rendered this frame");
            }
        }

        match self.frame_error.take() {
            Some(error) => Err(RhiError::PresentFailed(error)),
            None => Ok(()),
        }
    }

    fn set_depth_stencil_state(&mut self, state: DepthStencilState) {
        self.state.depth_stencil = state;
    }

    fn set_rasterizer_state(&mut self, state: RasterizerState) {
        self.state.rasterizer = state;
    }

    fn clear_render_target_view(&mut self, view: &Self::RenderTargetView, color: [f32; 4]) {
        self.queue_clear(view, PendingClear::color(view, color));
    }

    fn discard_view(&mut self, view: &Self::RenderTargetView) {
        // Contents become undefined; clearing is the cheapest defined choice
        self.queue_clear(view, PendingClear::color(view, [0.0; 4]));
    }

    fn clear_depth_stencil_view(&mut self, view: &Self::DepthStencilView, depth: f32) {
        self.queue_clear(view, PendingClear::depth(view, depth));
    }

    fn set_render_targets(
        &mut self,
        colors: &[&Self::RenderTargetView],
        depth: Option<&Self::DepthStencilView>,
    ) {
        self.state.colors = colors.iter().map(|v| (*v).clone()).collect();
        self.state.depth = depth.cloned();
        if self
            .open_pass
            .as_ref()
            .is_some_and(|pass| !pass.targets_match(&self.state))
        {
            self.flush_pass();
        }
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = Some(viewport);
    }

    fn set_blend_state(&mut self, blend: Option<BlendState>) {
        self.state.blend = blend;
    }

    fn set_input_layout(&mut self, layout: &Self::InputLayout) {
        self.state.input_layout = Some(layout.clone());
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.state.topology = topology;
    }

    fn set_vertex_shader(&mut self, shader: &Self::VertexShader) {
        self.state.vertex_shader = Some(shader.clone());
    }

    fn set_pixel_shader(&mut self, shader: &Self::PixelShader) {
        self.state.pixel_shader = Some(shader.clone());
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &Self::Buffer, stride: u32) {
        self.state.vertex_buffers.insert(slot, (buffer.clone(), stride));
    }

    fn set_index_buffer(&mut self, buffer: &Self::Buffer, format: IndexFormat) {
        self.state.index_buffer = Some((buffer.clone(), format));
    }

    fn set_constant_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: &Self::Buffer) {
        if slot != 0 {
            log::warn!("Constant buffer slot {} is not available, ignoring", slot);
            return;
        }
        match stage {
            ShaderStage::Vertex => self.state.vs_constants = Some(buffer.clone()),
            ShaderStage::Pixel => self.state.ps_constants = Some(buffer.clone()),
        }
    }

    fn set_shader_resources(
        &mut self,
        start_slot: u32,
        views: &[Option<&Self::ShaderResourceView>],
    ) {
        for (offset, view) in views.iter().enumerate() {
            let slot = start_slot as usize + offset;
            match self.state.shader_resources.get_mut(slot) {
                Some(bound) => *bound = view.cloned(),
                None => log::warn!("Shader resource slot t{} is not available, ignoring", slot),
            }
        }
    }

    fn set_sampler(&mut self, slot: u32, sampler: &Self::Sampler) {
        if slot != 0 {
            log::warn!("Sampler slot s{} is not available, ignoring", slot);
            return;
        }
        self.state.sampler = Some(sampler.clone());
    }

    fn draw_indexed(&mut self, index_count: u32) {
        if let Err(e) = self.record_draw(index_count) {
            log::error!("draw_indexed skipped: {}", e);
            self.frame_error.get_or_insert_with(|| e.to_string());
        }
    }

    fn clear_state(&mut self) {
        self.flush_pass();
        self.state = ContextState::default();
    }
}

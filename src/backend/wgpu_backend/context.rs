//! Immediate-context emulation: bound state, pending clears and pass batching

use super::convert::*;
use super::{
    Presenter, WgpuBuffer, WgpuDevice, WgpuInputLayout, WgpuSampler, WgpuShader, WgpuView,
};
use crate::backend::types::*;
use crate::error::{RhiError, RhiResult};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State set through the `set_*` calls
pub(super) struct ContextState {
    pub colors: Vec<WgpuView>,
    pub depth: Option<WgpuView>,
    pub viewport: Option<Viewport>,
    pub blend: Option<BlendState>,
    pub depth_stencil: DepthStencilState,
    pub rasterizer: RasterizerState,
    pub topology: PrimitiveTopology,
    pub input_layout: Option<WgpuInputLayout>,
    pub vertex_shader: Option<WgpuShader>,
    pub pixel_shader: Option<WgpuShader>,
    /// slot -> (buffer, stride)
    pub vertex_buffers: BTreeMap<u32, (WgpuBuffer, u32)>,
    pub index_buffer: Option<(WgpuBuffer, IndexFormat)>,
    pub vs_constants: Option<WgpuBuffer>,
    pub ps_constants: Option<WgpuBuffer>,
    pub shader_resources: [Option<WgpuView>; 2],
    pub sampler: Option<WgpuSampler>,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            colors: Vec::new(),
            depth: None,
            viewport: None,
            blend: None,
            depth_stencil: DepthStencilState::default(),
            rasterizer: RasterizerState::default(),
            topology: PrimitiveTopology::TriangleList,
            input_layout: None,
            vertex_shader: None,
            pixel_shader: None,
            vertex_buffers: BTreeMap::new(),
            index_buffer: None,
            vs_constants: None,
            ps_constants: None,
            shader_resources: [None, None],
            sampler: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ClearOp {
    Color([f32; 4]),
    Depth(f32),
}

/// A clear waiting for the next pass that touches its texture
pub(super) struct PendingClear {
    view: WgpuView,
    op: ClearOp,
}

impl PendingClear {
    pub fn color(view: &WgpuView, color: [f32; 4]) -> Self {
        Self {
            view: view.clone(),
            op: ClearOp::Color(color),
        }
    }

    pub fn depth(view: &WgpuView, depth: f32) -> Self {
        Self {
            view: view.clone(),
            op: ClearOp::Depth(depth),
        }
    }
}

/// Everything a pipeline depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(super) struct PipelineKey {
    vertex_shader: u64,
    pixel_shader: u64,
    input_layout: u64,
    topology: PrimitiveTopology,
    index_format: IndexFormat,
    color_formats: Vec<wgpu::TextureFormat>,
    depth_format: Option<wgpu::TextureFormat>,
    blend: Option<BlendState>,
    depth_stencil: DepthStencilState,
    rasterizer: RasterizerState,
}

struct ColorAttachment {
    view: Arc<wgpu::TextureView>,
    load: wgpu::LoadOp<wgpu::Color>,
}

struct DepthAttachment {
    view: Arc<wgpu::TextureView>,
    depth_load: wgpu::LoadOp<f32>,
    stencil_load: Option<wgpu::LoadOp<u32>>,
}

struct DrawCall {
    pipeline: Arc<wgpu::RenderPipeline>,
    bind_group: Arc<wgpu::BindGroup>,
    vertex_buffers: Vec<(u32, Arc<wgpu::Buffer>)>,
    index_buffer: Arc<wgpu::Buffer>,
    index_format: wgpu::IndexFormat,
    index_count: u32,
    viewport: Viewport,
}

/// Render pass being batched; recorded into the encoder when flushed
pub(super) struct OpenPass {
    color_ids: Vec<u64>,
    depth_id: Option<u64>,
    colors: Vec<ColorAttachment>,
    depth: Option<DepthAttachment>,
    extent: (u32, u32),
    draws: Vec<DrawCall>,
}

impl OpenPass {
    pub fn targets_match(&self, state: &ContextState) -> bool {
        self.depth_id == state.depth.as_ref().map(|d| d.texture_id)
            && self
                .color_ids
                .iter()
                .copied()
                .eq(state.colors.iter().map(|v| v.texture_id))
    }

    fn clear_only(view: Arc<wgpu::TextureView>, format: wgpu::TextureFormat, op: ClearOp) -> Self {
        let mut pass = Self {
            color_ids: Vec::new(),
            depth_id: None,
            colors: Vec::new(),
            depth: None,
            extent: (1, 1),
            draws: Vec::new(),
        };
        match op {
            ClearOp::Color(color) => pass.colors.push(ColorAttachment {
                view,
                load: wgpu::LoadOp::Clear(convert_color(color)),
            }),
            ClearOp::Depth(depth) => {
                pass.depth = Some(DepthAttachment {
                    view,
                    depth_load: wgpu::LoadOp::Clear(depth),
                    stencil_load: format.has_stencil_aspect().then_some(wgpu::LoadOp::Clear(0)),
                })
            }
        }
        pass
    }
}

fn record_pass(encoder: &mut wgpu::CommandEncoder, pass: &OpenPass) {
    let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pass
        .colors
        .iter()
        .map(|attachment| {
            Some(wgpu::RenderPassColorAttachment {
                view: &attachment.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: attachment.load,
                    store: wgpu::StoreOp::Store,
                },
            })
        })
        .collect();

    let depth_stencil_attachment =
        pass.depth
            .as_ref()
            .map(|attachment| wgpu::RenderPassDepthStencilAttachment {
                view: &attachment.view,
                depth_ops: Some(wgpu::Operations {
                    load: attachment.depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: attachment.stencil_load.map(|load| wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                }),
            });

    let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("rndr pass"),
        color_attachments: &color_attachments,
        depth_stencil_attachment,
        timestamp_writes: None,
        occlusion_query_set: None,
    });

    let (width, height) = (pass.extent.0 as f32, pass.extent.1 as f32);
    for draw in &pass.draws {
        // wgpu rejects viewports reaching outside the attachments
        let vp = draw.viewport;
        let x = vp.x.clamp(0.0, width);
        let y = vp.y.clamp(0.0, height);
        let w = vp.width.min(width - x);
        let h = vp.height.min(height - y);
        if w <= 0.0 || h <= 0.0 {
            continue;
        }
        render_pass.set_viewport(x, y, w, h, vp.min_depth, vp.max_depth);

        render_pass.set_pipeline(&draw.pipeline);
        render_pass.set_bind_group(0, &draw.bind_group, &[]);
        for (slot, buffer) in &draw.vertex_buffers {
            render_pass.set_vertex_buffer(*slot, buffer.slice(..));
        }
        render_pass.set_index_buffer(draw.index_buffer.slice(..), draw.index_format);
        render_pass.draw_indexed(0..draw.index_count, 0, 0..1);
    }
}

fn uniform_or<'a>(
    buffer: &'a Option<WgpuBuffer>,
    placeholder: &'a wgpu::Buffer,
) -> &'a wgpu::Buffer {
    buffer.as_ref().map_or(placeholder, |b| b.buffer.as_ref())
}

impl WgpuDevice {
    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        })
    }

    /// Record the open pass, if any, into the encoder
    pub(super) fn flush_pass(&mut self) {
        if let Some(pass) = self.open_pass.take() {
            log::trace!("Recording pass with {} draws", pass.draws.len());
            record_pass(self.encoder(), &pass);
        }
    }

    pub(super) fn submit(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    /// Record and submit everything issued so far, leftover clears included
    pub(super) fn flush(&mut self) {
        self.flush_pass();
        if let Err(e) = self.execute_pending_clears() {
            log::error!("Pending clears failed: {}", e);
            self.frame_error.get_or_insert_with(|| e.to_string());
        }
        self.submit();
    }

    pub(super) fn queue_clear(&mut self, view: &WgpuView, clear: PendingClear) {
        // Draws recorded so far must land before the clear
        self.flush_pass();
        self.pending_clears.insert(view.texture_id, clear);
    }

    fn resolve_view(&mut self, view: &WgpuView) -> RhiResult<Arc<wgpu::TextureView>> {
        if let Some(view) = &view.view {
            return Ok(Arc::clone(view));
        }
        match &mut self.presenter {
            Presenter::Surface(swap_chain) => swap_chain.current_view(&self.device),
            Presenter::Offscreen(_) => Err(RhiError::creation(
                "view",
                "surface back buffer view on an offscreen device",
            )),
        }
    }

    fn execute_pending_clears(&mut self) -> RhiResult<()> {
        let clears: Vec<PendingClear> = self.pending_clears.drain().map(|(_, c)| c).collect();
        for clear in clears {
            let view = self.resolve_view(&clear.view)?;
            let pass = OpenPass::clear_only(view, clear.view.format, clear.op);
            record_pass(self.encoder(), &pass);
        }
        Ok(())
    }

    /// Open a pass on the bound targets. Their pending clears become load
    /// operations; every other pending clear runs first.
    fn begin_pass(&mut self) -> RhiResult<()> {
        let colors = self.state.colors.clone();
        let depth = self.state.depth.clone();

        let mut color_attachments = Vec::with_capacity(colors.len());
        for view in &colors {
            let load = match self.pending_clears.remove(&view.texture_id).map(|c| c.op) {
                Some(ClearOp::Color(color)) => wgpu::LoadOp::Clear(convert_color(color)),
                _ => wgpu::LoadOp::Load,
            };
            color_attachments.push(ColorAttachment {
                view: self.resolve_view(view)?,
                load,
            });
        }

        let depth_attachment = match &depth {
            Some(view) => {
                let (depth_load, stencil_load) =
                    match self.pending_clears.remove(&view.texture_id).map(|c| c.op) {
                        Some(ClearOp::Depth(value)) => {
                            (wgpu::LoadOp::Clear(value), wgpu::LoadOp::Clear(0))
                        }
                        _ => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
                    };
                Some(DepthAttachment {
                    view: self.resolve_view(view)?,
                    depth_load,
                    stencil_load: view.format.has_stencil_aspect().then_some(stencil_load),
                })
            }
            None => None,
        };

        self.execute_pending_clears()?;

        let extent = colors
            .first()
            .or(depth.as_ref())
            .map_or((1, 1), |v| (v.width, v.height));
        self.open_pass = Some(OpenPass {
            color_ids: colors.iter().map(|v| v.texture_id).collect(),
            depth_id: depth.as_ref().map(|d| d.texture_id),
            colors: color_attachments,
            depth: depth_attachment,
            extent,
            draws: Vec::new(),
        });
        Ok(())
    }

    pub(super) fn record_draw(&mut self, index_count: u32) -> RhiResult<()> {
        let state = &self.state;
        let (Some(vs), Some(ps), Some(layout)) = (
            state.vertex_shader.clone(),
            state.pixel_shader.clone(),
            state.input_layout.clone(),
        ) else {
            return Err(RhiError::creation("draw", "shaders or input layout not bound"));
        };
        let (index_buffer, index_format) = state
            .index_buffer
            .clone()
            .ok_or_else(|| RhiError::creation("draw", "no index buffer bound"))?;
        if state.colors.is_empty() && state.depth.is_none() {
            return Err(RhiError::creation("draw", "no render target bound"));
        }

        let mut vertex_buffers = Vec::with_capacity(layout.elements.len());
        for element in &layout.elements {
            let (buffer, stride) = state.vertex_buffers.get(&element.slot).ok_or_else(|| {
                RhiError::creation(
                    "draw",
                    format!("no vertex buffer in slot {} for {}", element.slot, element.semantic),
                )
            })?;
            if *stride as u64 != element.stride() {
                self.report(format!(
                    "slot {} bound with stride {} but {} expects {}",
                    element.slot,
                    stride,
                    element.semantic,
                    element.stride()
                ));
            }
            vertex_buffers.push((element.slot, Arc::clone(&buffer.buffer)));
        }

        let key = PipelineKey {
            vertex_shader: vs.id,
            pixel_shader: ps.id,
            input_layout: layout.id,
            topology: state.topology,
            index_format,
            color_formats: state.colors.iter().map(|v| v.format).collect(),
            depth_format: state.depth.as_ref().map(|d| d.format),
            blend: state.blend,
            depth_stencil: state.depth_stencil,
            rasterizer: state.rasterizer,
        };
        let pipeline = self.pipeline(key, &vs, &ps, &layout)?;
        let bind_group = Arc::new(self.create_bind_group());

        if !self
            .open_pass
            .as_ref()
            .is_some_and(|pass| pass.targets_match(&self.state))
        {
            self.flush_pass();
            self.begin_pass()?;
        }
        let pass = self
            .open_pass
            .as_mut()
            .ok_or_else(|| RhiError::creation("draw", "no pass open"))?;
        let viewport = self
            .state
            .viewport
            .unwrap_or_else(|| Viewport::full(pass.extent.0, pass.extent.1));

        pass.draws.push(DrawCall {
            pipeline,
            bind_group,
            vertex_buffers,
            index_buffer: index_buffer.buffer,
            index_format: convert_index_format(index_format),
            index_count,
            viewport,
        });
        Ok(())
    }

    fn pipeline(
        &mut self,
        key: PipelineKey,
        vs: &WgpuShader,
        ps: &WgpuShader,
        layout: &WgpuInputLayout,
    ) -> RhiResult<Arc<wgpu::RenderPipeline>> {
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(Arc::clone(pipeline));
        }

        // One stream per slot, one attribute per stream
        let max_slot = layout.elements.iter().map(|e| e.slot).max().unwrap_or(0);
        let attributes: Vec<Vec<wgpu::VertexAttribute>> = (0..=max_slot)
            .map(|slot| {
                layout
                    .elements
                    .iter()
                    .filter(|e| e.slot == slot)
                    .map(|e| wgpu::VertexAttribute {
                        format: convert_vertex_format(e.format),
                        offset: 0,
                        shader_location: e.slot,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = attributes
            .iter()
            .enumerate()
            .map(|(slot, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout
                    .elements
                    .iter()
                    .find(|e| e.slot == slot as u32)
                    .map_or(0, |e| e.stride()),
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: attributes.as_slice(),
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .map(|format| {
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend: key.blend.map(convert_blend_state),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let strip = key.topology == PrimitiveTopology::TriangleStrip;
        let primitive = wgpu::PrimitiveState {
            topology: convert_topology(key.topology),
            strip_index_format: strip.then(|| convert_index_format(key.index_format)),
            front_face: convert_front_face(key.rasterizer.front_face),
            cull_mode: convert_cull_mode(key.rasterizer.cull_mode),
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        };

        let depth_stencil = key.depth_format.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: key.depth_stencil.depth_write_enabled,
            depth_compare: convert_compare_function(key.depth_stencil.depth_compare),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let pipeline = self.validated("render pipeline", |device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("rndr pipeline"),
                layout: Some(&self.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vs.module,
                    entry_point: &vs.entry_point,
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &ps.module,
                    entry_point: &ps.entry_point,
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive,
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        })?;

        log::debug!(
            "Created pipeline {} / {} for {:?} (cache size {})",
            vs.entry_point,
            ps.entry_point,
            key.color_formats,
            self.pipelines.len() + 1
        );
        let pipeline = Arc::new(pipeline);
        self.pipelines.insert(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Bind group for the current state. A texture bound as a render target
    /// reads the placeholder instead.
    fn create_bind_group(&self) -> wgpu::BindGroup {
        let state = &self.state;
        let targets: Vec<u64> = state
            .colors
            .iter()
            .map(|v| v.texture_id)
            .chain(state.depth.as_ref().map(|d| d.texture_id))
            .collect();

        let mut textures = [&self.placeholders.texture_view; 2];
        for (slot, bound) in state.shader_resources.iter().enumerate() {
            let Some(view) = bound else { continue };
            if targets.contains(&view.texture_id) {
                self.report(format!(
                    "texture {} is bound as shader resource t{} while bound as render target",
                    view.texture_id, slot
                ));
                continue;
            }
            if let Some(view) = view.view.as_deref() {
                textures[slot] = view;
            }
        }

        let sampler = state
            .sampler
            .as_ref()
            .map_or(&self.placeholders.sampler, |s| s.sampler.as_ref());

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_or(&state.vs_constants, &self.placeholders.uniform)
                        .as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: uniform_or(&state.ps_constants, &self.placeholders.uniform)
                        .as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(textures[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(textures[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }
}

//! Device and adapter bootstrap

use crate::backend::traits::RenderDevice;
use crate::backend::types::{AdapterInfo, DepthStencilState, RasterizerState, Viewport};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::PassState;
use crate::rhi::Rhi;
use crate::window::Window;
use crate::RhiConfig;
use slotmap::SlotMap;

/// Pick the adapter to create the device on.
///
/// The first adapter, in enumeration order, whose vendor appears in
/// `preferred_vendors` wins. Without a match the first enumerated adapter is
/// used. Zero adapters is an error.
pub fn select_adapter(adapters: &[AdapterInfo], preferred_vendors: &[u32]) -> RhiResult<usize> {
    if adapters.is_empty() {
        log::error!("Adapter enumeration returned no adapters");
        return Err(RhiError::NoSuitableAdapter);
    }

    for (index, adapter) in adapters.iter().enumerate() {
        log::debug!(
            "Adapter {}: {} (vendor {:#06x}, device {:#06x})",
            index,
            adapter.name,
            adapter.vendor,
            adapter.device
        );
    }

    let preferred = adapters
        .iter()
        .position(|a| preferred_vendors.contains(&a.vendor));

    Ok(preferred.unwrap_or(0))
}

impl<D: RenderDevice> Rhi<D> {
    /// Create the device and swap chain for `window`, then every object the
    /// passes depend on.
    pub fn init(window: &Window, config: RhiConfig) -> RhiResult<Self> {
        let device = D::create(window, &config)?;
        Self::with_device(device, window.dimensions(), config)
    }

    /// Finish initialisation on an already created device
    pub fn with_device(
        device: D,
        (width, height): (u32, u32),
        config: RhiConfig,
    ) -> RhiResult<Self> {
        log::info!(
            "Initialising RHI on {} at {:?} ({}x{})",
            device.adapter_info().name,
            device.feature_level(),
            width,
            height
        );

        let mut rhi = Self {
            config,
            width,
            height,
            viewport: Viewport::full(width, height),
            pass_state: PassState::Idle,
            vertex_buffers: SlotMap::with_key(),
            index_buffers: SlotMap::with_key(),
            constant_buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            render_targets: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            back_buffer: None,
            depth: None,
            gbuffer: None,
            passes: None,
            device,
        };

        rhi.device.set_depth_stencil_state(DepthStencilState::default());
        rhi.device.set_rasterizer_state(RasterizerState::default());

        let (width, height) = rhi.recreate_back_buffer_and_depth()?;
        rhi.recreate_offscreen_targets(width, height)?;
        rhi.create_pass_resources()?;

        Ok(rhi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str, vendor: u32) -> AdapterInfo {
        AdapterInfo {
            name: name.into(),
            vendor,
            device: 0,
        }
    }

    #[test]
    fn test_zero_adapters_is_an_error() {
        assert_eq!(
            select_adapter(&[], &[0x10DE]),
            Err(RhiError::NoSuitableAdapter)
        );
    }

    #[test]
    fn test_prefers_first_enumerated_discrete_adapter() {
        let adapters = [
            adapter("Intel", 0x8086),
            adapter("AMD", 0x1002),
            adapter("NVIDIA", 0x10DE),
        ];
        // Enumeration order decides between preferred vendors
        assert_eq!(select_adapter(&adapters, &[0x10DE, 0x1002]), Ok(1));
        assert_eq!(select_adapter(&adapters, &[0x1002, 0x10DE]), Ok(1));
        assert_eq!(select_adapter(&adapters, &[0x10DE]), Ok(2));
    }

    #[test]
    fn test_falls_back_to_first_adapter() {
        let adapters = [adapter("Intel", 0x8086), adapter("Software", 0x1414)];
        assert_eq!(select_adapter(&adapters, &[0x10DE, 0x1002]), Ok(0));
    }
}

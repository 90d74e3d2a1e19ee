//! rndr - a minimal render hardware interface with a deferred pipeline
//!
//! The RHI sits above a GPU device and gives the rest of a renderer cheap,
//! typed handles instead of API objects:
//! - **Device bootstrap**: adapter selection, device and swap chain creation
//! - **Resource factory**: buffers, textures, samplers and shaders from CPU data
//! - **Render target manager**: back buffer, depth buffer and G-buffer (re)creation
//! - **Pass pipeline**: geometry pass into the G-buffer, lighting pass into the
//!   back buffer, then present, sequenced by an explicit state machine
//!
//! Two devices implement [`backend::RenderDevice`]: [`backend::WgpuDevice`] on
//! real hardware and [`backend::RecordingDevice`], which records a command
//! trace without touching a GPU.

pub mod backend;
pub mod engine;
pub mod error;
pub mod handle;
pub mod logging;
pub mod pipeline;
pub mod resources;
pub mod rhi;
pub mod window;

pub use backend::types::{ConstantBufferData, FeatureLevel, SwapChainDescriptor};
pub use backend::{RecordingDevice, RenderDevice, WgpuDevice};
pub use engine::{Engine, RenderMode};
pub use error::{RhiError, RhiResult};
pub use handle::*;
pub use pipeline::PassState;
pub use rhi::Rhi;
pub use window::Window;

/// PCI vendor id of NVIDIA
pub const VENDOR_NVIDIA: u32 = 0x10DE;
/// PCI vendor id of AMD
pub const VENDOR_AMD: u32 = 0x1002;

/// Width of indices in index buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexWidth {
    /// 16-bit indices; meshes above 65535 vertices are rejected
    #[default]
    U16,
    /// 32-bit indices
    U32,
}

impl IndexWidth {
    /// Largest index value representable
    pub fn max_index(&self) -> u64 {
        match self {
            IndexWidth::U16 => u16::MAX as u64,
            IndexWidth::U32 => u32::MAX as u64,
        }
    }
}

/// Configuration for initializing the RHI
#[derive(Debug, Clone)]
pub struct RhiConfig {
    /// Enable vsync. Selects the swap chain present mode.
    pub vsync: bool,
    /// Index width for every index buffer
    pub index_width: IndexWidth,
    /// Vendor ids tried first during adapter selection, in order
    pub preferred_vendor_ids: Vec<u32>,
    /// Feature levels requested at device creation, highest first
    pub feature_levels: Vec<FeatureLevel>,
    /// Swap chain parameters
    pub swap_chain: SwapChainDescriptor,
}

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            index_width: IndexWidth::U16,
            preferred_vendor_ids: vec![VENDOR_NVIDIA, VENDOR_AMD],
            feature_levels: vec![
                FeatureLevel::Full,
                FeatureLevel::Downlevel,
                FeatureLevel::WebGl2,
            ],
            swap_chain: SwapChainDescriptor::default(),
        }
    }
}

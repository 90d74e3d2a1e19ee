//! Shared setup for the RHI integration tests.
//!
//! Every test that does not inspect the command trace runs against both
//! devices. The wgpu device renders offscreen and is skipped when the machine
//! has no usable adapter.

use rndr::logging::{init_logging, LoggingConfig};
use rndr::{RecordingDevice, Rhi, RhiConfig, RhiResult, WgpuDevice, Window};

/// Devices under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Command-recording device, always available
    Recording,
    /// wgpu on whatever adapter the machine offers
    Wgpu,
}

impl Backend {
    #[allow(dead_code)]
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Recording => "recording",
            Backend::Wgpu => "wgpu",
        }
    }
}

pub fn setup() {
    init_logging(LoggingConfig::for_tests());
}

/// RHI on the recording device
#[allow(dead_code)]
pub fn recording_rhi(width: u32, height: u32, config: RhiConfig) -> Rhi<RecordingDevice> {
    setup();
    Rhi::init(&Window::headless(width, height), config).expect("recording device never fails")
}

/// RHI on an offscreen wgpu device, or `None` without a GPU
#[allow(dead_code)]
pub fn wgpu_rhi(width: u32, height: u32, config: RhiConfig) -> Option<Rhi<WgpuDevice>> {
    setup();
    let result: RhiResult<Rhi<WgpuDevice>> = Rhi::init(&Window::headless(width, height), config);
    match result {
        Ok(rhi) => Some(rhi),
        Err(e) => {
            eprintln!("wgpu device not available ({}), skipping", e);
            None
        }
    }
}

/// Run `$body` with `$rhi` bound to an RHI on `$backend`.
///
/// The body is expanded once per device type, so it may call generic helpers.
#[macro_export]
macro_rules! with_rhi {
    ($backend:expr, ($width:expr, $height:expr), $config:expr, |$rhi:ident| $body:block) => {
        match $backend {
            $crate::common::Backend::Recording => {
                #[allow(unused_mut)]
                let mut $rhi = $crate::common::recording_rhi($width, $height, $config);
                $body
            }
            $crate::common::Backend::Wgpu => {
                let Some(mut $rhi) = $crate::common::wgpu_rhi($width, $height, $config) else {
                    return;
                };
                $body
            }
        }
    };
}

/// Pixel `(x, y)` of tightly packed RGBA8 rows
#[allow(dead_code)]
pub fn pixel(data: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let offset = ((y * width + x) * 4) as usize;
    [
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]
}

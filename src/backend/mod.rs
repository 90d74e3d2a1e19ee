//! Device abstraction layer
//!
//! Provides the device trait, the types it speaks, a wgpu implementation and
//! a GPU-less recording implementation.

pub mod recording;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use recording::{Command, RecordingDevice, RecordingMonitor};
pub use traits::*;
pub use types::*;
pub use wgpu_backend::WgpuDevice;

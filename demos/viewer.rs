//! Interactive viewer: a textured cube lit by the deferred pipeline.
//!
//! ```bash
//! cargo run --example viewer -- --xres 1280 --yres 720 --texture crate.tga
//! ```
//!
//! `R` cycles the G-buffer view, `Escape` quits.

use clap::Parser;
use glam::{Mat4, Vec3};
use rndr::logging::{init_logging, LoggingConfig};
use rndr::resources::{Mesh, MeshData};
use rndr::window::{self, FrameEvent};
use rndr::{Engine, RhiConfig, WgpuDevice, Window};
use std::path::PathBuf;
use std::time::Instant;
use winit::event_loop::EventLoop;

/// Seconds per full orbit of the camera
const ORBIT_PERIOD: f32 = 12.0;
const ORBIT_RADIUS: f32 = 3.0;

#[derive(Parser, Debug)]
#[command(name = "rndr viewer", about = "Deferred renderer demo", version)]
struct Args {
    /// Client-area width in pixels
    #[arg(long, default_value = "1280")]
    xres: u32,

    /// Client-area height in pixels
    #[arg(long, default_value = "720")]
    yres: u32,

    /// TGA (or any format `image` reads) applied to the cube
    #[arg(long)]
    texture: Option<PathBuf>,

    /// Disable vertical sync
    #[arg(long)]
    no_vsync: bool,
}

fn orbit_view(time: f32) -> Mat4 {
    let target = Mesh::default_model().transform_point3(Vec3::ZERO);
    let angle = time / ORBIT_PERIOD * std::f32::consts::TAU;
    let eye = target + Vec3::new(angle.sin(), 0.5, -angle.cos()) * ORBIT_RADIUS;
    Mat4::look_at_lh(eye, target, Vec3::Y)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingConfig::default());
    let args = Args::parse();

    let event_loop = EventLoop::new()?;
    let window = Window::new(&event_loop, "rndr viewer", args.xres, args.yres)?;

    let config = RhiConfig {
        vsync: !args.no_vsync,
        ..Default::default()
    };
    let mut engine: Engine<WgpuDevice> = Engine::new(&window, config)?;

    let diffuse = match &args.texture {
        Some(path) => engine.texture_or_debug(path)?,
        None => engine
            .rhi()
            .debug_texture()
            .ok_or("debug texture missing")?,
    };
    engine.add_mesh(&MeshData::cube(), Some(diffuse))?;

    let start = Instant::now();
    let mut last = start;

    window::run(event_loop, window, move |_window, event| match event {
        FrameEvent::Resized { width, height } => {
            if let Err(e) = engine.resize(width, height) {
                log::error!("Resize to {}x{} failed: {}", width, height, e);
            }
        }
        FrameEvent::KeyPressed(key) => {
            engine.handle_key(key);
            log::info!("Render mode: {:?}", engine.render_mode());
        }
        FrameEvent::Frame => {
            let now = Instant::now();
            let delta = (now - last).as_secs_f32();
            last = now;

            engine.set_view(orbit_view((now - start).as_secs_f32()));
            if let Err(e) = engine.update(delta).and_then(|()| engine.render()) {
                log::error!("Frame failed: {}", e);
            }
        }
    })?;

    Ok(())
}

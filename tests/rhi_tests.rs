//! Integration tests for the RHI and the deferred pipeline.
//!
//! Tests parameterized over [`Backend`] run on the recording device and on an
//! offscreen wgpu device; the wgpu cases are skipped on machines without an
//! adapter. Tests that inspect the command trace use the recording device only.
//!
//! ```bash
//! cargo test --test rhi_tests
//! ```

mod common;

use common::{pixel, recording_rhi, setup, Backend};
use glam::{Vec2, Vec3, Vec4};
use rndr::backend::types::Viewport;
use rndr::backend::{AdapterInfo, Command, RecordingDevice, RenderDevice};
use rndr::pipeline::gbuffer_pass::GBUFFER_CLEAR_COLOR;
use rndr::pipeline::lighting_pass::BACK_BUFFER_CLEAR_COLOR;
use rndr::resources::{encode_tga, Mesh, MeshData, TextureMap};
use rndr::{Engine, IndexWidth, PassState, RenderMode, RhiConfig, RhiError, WgpuDevice, Window};
use rstest::rstest;

// ============================================================================
// Bootstrap
// ============================================================================

#[test]
fn test_zero_adapters_fails_initialisation() {
    setup();
    let result = RecordingDevice::create_with_adapters(
        &Window::headless(64, 64),
        &RhiConfig::default(),
        Vec::new(),
    );
    assert!(matches!(result, Err(RhiError::NoSuitableAdapter)));
}

#[test]
fn test_first_enumerated_preferred_adapter_is_chosen() {
    setup();
    let adapters = vec![
        AdapterInfo {
            name: "Intel".into(),
            vendor: 0x8086,
            device: 1,
        },
        AdapterInfo {
            name: "AMD".into(),
            vendor: rndr::VENDOR_AMD,
            device: 2,
        },
        AdapterInfo {
            name: "NVIDIA".into(),
            vendor: rndr::VENDOR_NVIDIA,
            device: 3,
        },
    ];
    let window = Window::headless(64, 64);
    let device =
        RecordingDevice::create_with_adapters(&window, &RhiConfig::default(), adapters).unwrap();
    assert_eq!(device.adapter_info().name, "AMD");
}

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_viewport_covers_back_buffer(
    #[case] backend: Backend,
    #[values((800, 600), (1, 1), (1920, 1080))] size: (u32, u32),
) {
    let (width, height) = size;
    with_rhi!(backend, (width, height), RhiConfig::default(), |rhi| {
        assert_eq!(rhi.size(), (width, height));
        let viewport = rhi.viewport();
        assert_eq!(viewport, Viewport::full(width, height));
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));

        let gbuffer = rhi.gbuffer().expect("G-buffer created at init");
        assert_eq!(rhi.render_target_size(gbuffer.color).unwrap(), (width, height));
        assert_eq!(rhi.render_target_size(gbuffer.normal).unwrap(), (width, height));
        assert_eq!(rhi.pass_state(), PassState::Idle);
    });
}

// ============================================================================
// Resource factory
// ============================================================================

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_index_width_limits(#[case] backend: Backend) {
    with_rhi!(backend, (64, 64), RhiConfig::default(), |rhi| {
        let result = rhi.create_index_buffer(&[0, 1, 70_000]);
        assert_eq!(
            result,
            Err(RhiError::IndexOverflow {
                index: 70_000,
                max: 65_535
            })
        );
        let handle = rhi.create_index_buffer(&[0, 1, 65_535]).unwrap();
        assert_eq!(rhi.index_count(handle).unwrap(), 3);
    });

    let config = RhiConfig {
        index_width: IndexWidth::U32,
        ..Default::default()
    };
    with_rhi!(backend, (64, 64), config, |rhi| {
        let handle = rhi.create_index_buffer(&[0, 1, 70_000]).unwrap();
        assert_eq!(rhi.index_count(handle).unwrap(), 3);
    });
}

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_16_bit_indices_cap_mesh_at_65535_vertices(#[case] backend: Backend) {
    fn mesh_with_vertices(count: usize) -> MeshData {
        let mut data = MeshData::new("large");
        data.positions = vec![Vec3::ZERO; count];
        data.normals = vec![Vec3::Z; count];
        data.uvs = vec![Vec2::ZERO; count];
        data.indices = vec![0, 1, (count - 1) as u32];
        data
    }

    with_rhi!(backend, (64, 64), RhiConfig::default(), |rhi| {
        let debug = rhi.debug_texture().unwrap();

        let largest = Mesh::upload(&mut rhi, &mesh_with_vertices(65_535), debug);
        assert!(largest.is_ok(), "{:?}", largest.err());

        let result = Mesh::upload(&mut rhi, &mesh_with_vertices(65_536), debug);
        assert!(matches!(result, Err(RhiError::IndexOverflow { .. })));
    });
}

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_texture_map_returns_cached_handle(#[case] backend: Backend) {
    let path = std::env::temp_dir().join(format!(
        "rndr-rhi-tests-{}-{}.tga",
        backend.name(),
        std::process::id()
    ));
    let pixels = [255u8, 0, 0].repeat(16);
    std::fs::write(&path, encode_tga(4, 4, 24, &pixels)).unwrap();

    with_rhi!(backend, (64, 64), RhiConfig::default(), |rhi| {
        let mut map = TextureMap::new();
        let first = map.get_texture_2d_from_path(&mut rhi, &path).unwrap();
        let live = rhi.live_object_count();
        let second = map.get_texture_2d_from_path(&mut rhi, &path).unwrap();

        assert_eq!(first, second);
        assert_eq!(rhi.live_object_count(), live);
        let info = rhi.texture_2d_info(first).unwrap();
        assert_eq!((info.width, info.height, info.mip_levels), (4, 4, 3));
    });

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_release_is_idempotent_and_leaves_no_objects() {
    let mut rhi = recording_rhi(128, 96, RhiConfig::default());
    let monitor = rhi.device().monitor();

    let debug = rhi.debug_texture().unwrap();

    let mesh = Mesh::upload(&mut rhi, &MeshData::cube(), debug).unwrap();
    assert_eq!(monitor.live_objects(), rhi.live_object_count());

    rhi.release();
    assert_eq!(monitor.live_objects(), 0);
    assert_eq!(rhi.live_object_count(), 0);

    rhi.release();
    assert_eq!(monitor.live_objects(), 0);

    assert_eq!(
        mesh.release(&mut rhi),
        Err(RhiError::InvalidHandle("vertex buffer"))
    );
    assert!(rhi.begin_geometry_pass().is_err());
    assert_eq!(rhi.pass_state(), PassState::Idle);

    drop(rhi);
    assert_eq!(monitor.live_objects(), 0);
}

#[test]
fn test_drop_releases_everything() {
    let rhi = recording_rhi(32, 32, RhiConfig::default());
    let monitor = rhi.device().monitor();
    assert!(monitor.live_objects() > 0);
    drop(rhi);
    assert_eq!(monitor.live_objects(), 0);
}

// ============================================================================
// Pass pipeline
// ============================================================================

fn position(commands: &[Command], predicate: impl Fn(&Command) -> bool) -> usize {
    commands
        .iter()
        .position(predicate)
        .expect("command not recorded")
}

#[test]
fn test_frame_issues_passes_in_order() {
    let rhi = recording_rhi(320, 240, RhiConfig::default());
    let monitor = rhi.device().monitor();
    let mut engine = Engine::with_rhi(rhi);
    engine.add_mesh(&MeshData::triangle(), None).unwrap();
    engine.update(0.0).unwrap();
    monitor.take_commands();

    engine.render().unwrap();
    let commands = monitor.take_commands();

    let clear_depth = position(&commands, |c| {
        matches!(c, Command::ClearDepth { depth, .. } if *depth == 1.0)
    });
    let clear_gbuffer = position(&commands, |c| {
        matches!(c, Command::ClearRenderTarget { color, .. } if *color == GBUFFER_CLEAR_COLOR)
    });
    let bind_gbuffer = position(&commands, |c| {
        matches!(c, Command::SetRenderTargets { colors, depth: Some(_) } if colors.len() == 2)
    });
    let draw_mesh = position(&commands, |c| *c == Command::DrawIndexed { index_count: 3 });
    let clear_back_buffer = position(&commands, |c| {
        matches!(c, Command::ClearRenderTarget { color, .. } if *color == BACK_BUFFER_CLEAR_COLOR)
    });
    let bind_back_buffer = position(&commands, |c| {
        matches!(c, Command::SetRenderTargets { colors, depth: None } if colors.len() == 1)
    });
    let bind_inputs = position(&commands, |c| {
        matches!(
            c,
            Command::SetShaderResources { start_slot: 0, views }
                if views.len() == 2 && views.iter().all(Option::is_some)
        )
    });
    let present = position(&commands, |c| *c == Command::Present);

    assert!(clear_depth < bind_gbuffer);
    assert!(clear_gbuffer < bind_gbuffer);
    assert!(bind_gbuffer < draw_mesh);
    assert!(draw_mesh < clear_back_buffer);
    assert!(clear_back_buffer < bind_back_buffer);
    assert!(bind_back_buffer < bind_inputs);
    assert!(bind_inputs < present);

    let light_draws = commands[bind_inputs..present]
        .iter()
        .filter(|c| matches!(c, Command::DrawIndexed { index_count: 6 }))
        .count();
    assert_eq!(light_draws, 2);

    // G-buffer inputs are unbound once the frame is out
    let unbind = commands[present..].iter().any(|c| {
        matches!(c, Command::SetShaderResources { views, .. } if views.iter().all(Option::is_none))
    });
    assert!(unbind);

    assert!(monitor.validation_messages().is_empty(), "{:?}", monitor.validation_messages());
    assert_eq!(engine.rhi().pass_state(), PassState::Presented);
}

#[test]
fn test_consecutive_frames_never_alias_gbuffer() {
    let rhi = recording_rhi(64, 64, RhiConfig::default());
    let monitor = rhi.device().monitor();
    let mut engine = Engine::with_rhi(rhi);
    engine.add_mesh(&MeshData::cube(), None).unwrap();

    for _ in 0..3 {
        engine.update(0.016).unwrap();
        engine.render().unwrap();
    }
    assert!(monitor.validation_messages().is_empty(), "{:?}", monitor.validation_messages());
}

#[test]
fn test_failed_present_still_unbinds_shader_resources() {
    let mut rhi = recording_rhi(64, 64, RhiConfig::default());
    let monitor = rhi.device().monitor();
    let unbind = Command::SetShaderResources {
        start_slot: 0,
        views: vec![None, None],
    };

    assert!(rhi.present().is_err());
    assert_eq!(monitor.take_commands().last(), Some(&unbind));
    assert_eq!(rhi.pass_state(), PassState::Idle);

    rhi.begin_geometry_pass().unwrap();
    monitor.take_commands();
    assert!(rhi.present().is_err());
    assert_eq!(monitor.take_commands().last(), Some(&unbind));
    assert_eq!(rhi.pass_state(), PassState::GeometryPass);
}

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_out_of_order_calls_are_rejected(#[case] backend: Backend) {
    with_rhi!(backend, (64, 64), RhiConfig::default(), |rhi| {
        assert_eq!(
            rhi.present(),
            Err(RhiError::InvalidPassTransition {
                from: PassState::Idle,
                to: PassState::Presented
            })
        );
        assert_eq!(rhi.pass_state(), PassState::Idle);

        let debug = rhi.debug_texture().unwrap();

        let mesh = Mesh::upload(&mut rhi, &MeshData::triangle(), debug).unwrap();
        assert!(matches!(
            rhi.draw_mesh(&mesh),
            Err(RhiError::PassMismatch { state: PassState::Idle, .. })
        ));
        assert!(matches!(
            rhi.draw_ambient(Vec4::ONE),
            Err(RhiError::PassMismatch { .. })
        ));

        rhi.begin_geometry_pass().unwrap();
        assert!(matches!(
            rhi.begin_geometry_pass(),
            Err(RhiError::InvalidPassTransition { .. })
        ));
        assert!(rhi.present().is_err());
        assert_eq!(rhi.pass_state(), PassState::GeometryPass);

        rhi.begin_lighting_pass().unwrap();
        assert!(matches!(
            rhi.draw_mesh(&mesh),
            Err(RhiError::PassMismatch { state: PassState::LightingPass, .. })
        ));
        assert!(rhi.begin_geometry_pass().is_err());
        rhi.present().unwrap();
        assert_eq!(rhi.pass_state(), PassState::Presented);

        // A presented frame starts the next one like idle
        rhi.begin_geometry_pass().unwrap();
        rhi.abandon_frame();
        assert_eq!(rhi.pass_state(), PassState::Idle);
    });
}

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_draw_with_released_buffer_fails(#[case] backend: Backend) {
    with_rhi!(backend, (64, 64), RhiConfig::default(), |rhi| {
        let debug = rhi.debug_texture().unwrap();
        let mesh = Mesh::upload(&mut rhi, &MeshData::triangle(), debug).unwrap();
        rhi.release_index_buffer(mesh.index_buffer).unwrap();

        rhi.begin_geometry_pass().unwrap();
        assert_eq!(
            rhi.draw_mesh(&mesh),
            Err(RhiError::InvalidHandle("index buffer"))
        );
        assert_eq!(
            rhi.release_index_buffer(mesh.index_buffer),
            Err(RhiError::InvalidHandle("index buffer"))
        );
        rhi.abandon_frame();
    });
}

// ============================================================================
// Resize
// ============================================================================

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_resize_recreates_every_target(#[case] backend: Backend) {
    with_rhi!(backend, (800, 600), RhiConfig::default(), |rhi| {
        let old = rhi.gbuffer().unwrap();

        rhi.handle_window_resize(1920, 1080).unwrap();

        assert_eq!(rhi.size(), (1920, 1080));
        assert_eq!(rhi.viewport(), Viewport::full(1920, 1080));
        assert!(rhi.render_target_size(old.color).is_err());
        assert!(rhi.render_target_size(old.normal).is_err());

        let new = rhi.gbuffer().unwrap();
        assert_eq!(rhi.render_target_size(new.color).unwrap(), (1920, 1080));
        assert_eq!(rhi.render_target_size(new.normal).unwrap(), (1920, 1080));

        // Zero-sized client areas (minimised windows) are ignored
        rhi.handle_window_resize(0, 0).unwrap();
        assert_eq!(rhi.size(), (1920, 1080));
    });
}

#[test]
fn test_resize_mid_frame_abandons_frame() {
    let mut rhi = recording_rhi(320, 240, RhiConfig::default());
    let monitor = rhi.device().monitor();
    rhi.begin_geometry_pass().unwrap();
    rhi.begin_lighting_pass().unwrap();

    rhi.handle_window_resize(640, 480).unwrap();

    assert_eq!(rhi.pass_state(), PassState::Idle);
    assert!(monitor
        .commands()
        .contains(&Command::ResizeBuffers { width: 640, height: 480 }));
    assert!(monitor.validation_messages().is_empty(), "{:?}", monitor.validation_messages());

    rhi.begin_geometry_pass().unwrap();
    rhi.begin_lighting_pass().unwrap();
    rhi.present().unwrap();
}

#[test]
fn test_resize_beyond_device_limit_follows_clamped_back_buffer() {
    let mut rhi = recording_rhi(320, 240, RhiConfig::default());
    let monitor = rhi.device().monitor();
    let max = rndr::backend::recording::MAX_TEXTURE_DIMENSION;

    rhi.handle_window_resize(max * 2, max).unwrap();

    let clamped = (max, max / 2);
    assert_eq!(rhi.device().swap_chain_size(), clamped);
    assert_eq!(rhi.size(), clamped);
    assert_eq!(rhi.viewport(), Viewport::full(clamped.0, clamped.1));
    let gbuffer = rhi.gbuffer().unwrap();
    assert_eq!(rhi.render_target_size(gbuffer.color).unwrap(), clamped);
    assert_eq!(rhi.render_target_size(gbuffer.normal).unwrap(), clamped);

    // Depth and color attachments agree in both passes
    rhi.begin_geometry_pass().unwrap();
    rhi.begin_lighting_pass().unwrap();
    rhi.present().unwrap();
    assert!(monitor.validation_messages().is_empty(), "{:?}", monitor.validation_messages());
}

// ============================================================================
// End to end
// ============================================================================

/// Screen position of the triangle's centroid after the engine's transforms
fn triangle_center_on_screen<D: RenderDevice>(engine: &Engine<D>) -> Vec2 {
    let data = MeshData::triangle();
    let centroid = data.positions.iter().copied().sum::<Vec3>() / 3.0;
    let mvp = engine.projection() * engine.view() * engine.meshes()[0].model;
    let ndc = mvp.project_point3(centroid);
    engine.rhi().viewport().ndc_to_screen(ndc.truncate())
}

#[test]
fn test_triangle_frame_on_recording_device() {
    let rhi = recording_rhi(400, 300, RhiConfig::default());
    let monitor = rhi.device().monitor();
    let mut engine = Engine::with_rhi(rhi);
    engine.add_mesh(&MeshData::triangle(), None).unwrap();

    engine.update(0.0).unwrap();
    engine.render().unwrap();

    let center = triangle_center_on_screen(&engine);
    assert!(center.x > 0.0 && center.x < 400.0);
    assert!(center.y > 0.0 && center.y < 300.0);
    assert!((center.x - 200.0).abs() < 1.0);

    assert!(monitor.commands().contains(&Command::DrawIndexed { index_count: 3 }));
    assert!(monitor.validation_messages().is_empty(), "{:?}", monitor.validation_messages());
}

#[test]
fn test_triangle_frame_on_gpu() {
    let Some(rhi) = common::wgpu_rhi(400, 300, RhiConfig::default()) else {
        return;
    };
    let mut engine: Engine<WgpuDevice> = Engine::with_rhi(rhi);
    engine.set_render_mode(RenderMode::Normals);
    engine.add_mesh(&MeshData::triangle(), None).unwrap();

    engine.update(0.0).unwrap();
    engine.render().unwrap();

    let pixels = engine.rhi_mut().device_mut().read_back_buffer().unwrap();
    assert_eq!(pixels.len(), 400 * 300 * 4);

    // Normals mode: the triangle's color is its encoded normal (0.5, 0.5, 0)
    // under the ambient term; the background is the G-buffer clear color.
    let center = triangle_center_on_screen(&engine);
    let inside = pixel(&pixels, 400, center.x as u32, center.y as u32);
    let corner = pixel(&pixels, 400, 2, 2);
    assert!(inside[0] > 10, "triangle pixel {:?}", inside);
    assert!(corner[0] < 3, "background pixel {:?}", corner);
    assert!(corner[2] > inside[2], "background {:?} triangle {:?}", corner, inside);

    let messages = engine.rhi().device().validation_messages();
    assert!(messages.is_empty(), "{:?}", messages);
}

#[test]
fn test_gpu_resize_then_render() {
    let Some(rhi) = common::wgpu_rhi(128, 128, RhiConfig::default()) else {
        return;
    };
    let mut engine: Engine<WgpuDevice> = Engine::with_rhi(rhi);
    engine.add_mesh(&MeshData::cube(), None).unwrap();
    engine.update(0.0).unwrap();
    engine.render().unwrap();

    engine.resize(256, 64).unwrap();
    engine.update(0.0).unwrap();
    engine.render().unwrap();

    let pixels = engine.rhi_mut().device_mut().read_back_buffer().unwrap();
    assert_eq!(pixels.len(), 256 * 64 * 4);
    let messages = engine.rhi().device().validation_messages();
    assert!(messages.is_empty(), "{:?}", messages);
}

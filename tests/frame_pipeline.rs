//! Frame pipelining, accumulation and presentation.
//!
//! ```bash
//! cargo test --test frame_pipeline
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use common::{cornell_scene, instanced_cubes, mean_abs_difference, small_config, Backend, TestContext};
use progressive_rt::backend::software::SoftwareBackend;
use progressive_rt::backend::RayTracingBackend;
use progressive_rt::{DrawOutcome, FrameScheduler, RenderStats, Renderer};

fn all_zero(backend: &dyn RayTracingBackend, texture: &progressive_rt::resources::Texture) -> bool {
    backend
        .read_texture(texture)
        .unwrap()
        .iter()
        .all(|&byte| byte == 0)
}

/// With N frames in flight the N+1th frame waits for a completion.
#[rstest]
#[case::one(1)]
#[case::three(3)]
fn test_gate_admits_at_most_n_frames(#[case] frames_in_flight: u32) {
    let backend = SoftwareBackend::new().unwrap();
    let scheduler = FrameScheduler::new(&backend, frames_in_flight).unwrap();
    assert_eq!(scheduler.ring().slot_count(), frames_in_flight);

    for _ in 0..frames_in_flight {
        scheduler.begin_frame();
    }
    assert_eq!(scheduler.gate().in_flight(), frames_in_flight);
    assert!(!scheduler.gate().try_acquire_for(Duration::from_millis(20)));

    scheduler.gate().release();
    assert!(scheduler.gate().try_acquire_for(Duration::from_millis(20)));

    for _ in 0..frames_in_flight {
        scheduler.gate().release();
    }
    scheduler.wait_for_idle();
    assert_eq!(scheduler.gate().in_flight(), 0);
}

/// Every frame that was drawn retires through its completion handler.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_every_frame_completes(#[case] backend: Backend) {
    let Some(device) = backend.create() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let stats = Arc::new(RenderStats::new());
    let config = small_config(24, 16);
    let mut surface =
        progressive_rt::OffscreenSurface::new(device.as_ref(), config.width, config.height).unwrap();
    let mut renderer = Renderer::new(device, &cornell_scene(), config, stats.clone()).unwrap();

    renderer.set_frames_to_render(8);
    while renderer.frames_remaining() > 0 {
        assert_eq!(renderer.draw(&mut surface).unwrap(), DrawOutcome::Presented);
    }
    renderer.wait_idle().unwrap();

    assert_eq!(renderer.frame_index(), 8);
    assert_eq!(stats.frames_completed(), 8);
    assert_eq!(stats.frames_encoded(), 8);
    assert!(!renderer.is_busy());
}

/// Resizing reallocates every target at the new size and restarts accumulation.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_resize_resets_frame_counter(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, &cornell_scene(), small_config(100, 100)) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    ctx.render(3);
    assert_eq!(ctx.renderer.frame_index(), 3);

    ctx.renderer.resize(200, 200).unwrap();

    assert_eq!(ctx.renderer.frame_index(), 0);
    assert_eq!(ctx.renderer.display_size(), (200, 200));
    assert_eq!(ctx.renderer.render_size(), (200, 200));
    let accumulation = ctx.renderer.accumulation();
    assert_eq!(accumulation.size(), (200, 200));
    assert_eq!(accumulation.source().size(), (200, 200));
    assert_eq!(accumulation.target().size(), (200, 200));
    assert_eq!(accumulation.seeds().size(), (200, 200));
}

/// Both accumulation targets read as zero right after a scene reset.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_reset_zeroes_accumulation(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, &cornell_scene(), small_config(32, 24)) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    ctx.render(4);
    assert!(ctx.accumulated().iter().any(|&value| value > 0.0));

    ctx.renderer.reset(&instanced_cubes(3)).unwrap();

    assert_eq!(ctx.renderer.frame_index(), 0);
    let accumulation = ctx.renderer.accumulation();
    assert!(all_zero(ctx.backend.as_ref(), accumulation.source()));
    assert!(all_zero(ctx.backend.as_ref(), accumulation.target()));
}

/// A frame without a drawable still accumulates and is not presented.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_missing_surface_is_skipped(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, &cornell_scene(), small_config(16, 16)) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    ctx.surface.set_available(false);
    assert_eq!(
        ctx.renderer.draw(&mut ctx.surface).unwrap(),
        DrawOutcome::Dropped
    );
    ctx.surface.set_available(true);
    assert_eq!(
        ctx.renderer.draw(&mut ctx.surface).unwrap(),
        DrawOutcome::Presented
    );
    ctx.renderer.wait_idle().unwrap();

    assert_eq!(ctx.renderer.frame_index(), 2);
    assert_eq!(ctx.surface.presented_count(), 1);
}

/// The change between consecutive frames shrinks as samples accumulate.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_accumulation_converges(#[case] backend: Backend) {
    let Some(mut ctx) = TestContext::new(backend, &cornell_scene(), small_config(24, 24)) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    ctx.render(1);
    let first = ctx.accumulated();
    ctx.render(1);
    let second = ctx.accumulated();
    let early = mean_abs_difference(&first, &second);

    ctx.render(30);
    let before = ctx.accumulated();
    ctx.render(1);
    let after = ctx.accumulated();
    let late = mean_abs_difference(&before, &after);

    assert!(early > 0.0);
    assert!(
        late < early * 0.25,
        "late change {late} should be well below early change {early}"
    );
    assert!(after.iter().all(|value| value.is_finite() && *value >= 0.0));
}

/// Upscaled output fills the whole display surface.
#[test]
fn test_upscaled_frame_reaches_surface() {
    let Some(mut ctx) = TestContext::new(
        Backend::Software,
        &cornell_scene(),
        small_config(32, 32).with_upscale_factor(4),
    ) else {
        return;
    };
    assert_eq!(ctx.renderer.render_size(), (8, 8));
    ctx.render(4);

    let image = ctx.surface.read_image(ctx.backend.as_ref()).unwrap();
    assert_eq!(image.dimensions(), (32, 32));
    assert!(image.pixels().any(|pixel| pixel.0[..3] != [0, 0, 0]));
}

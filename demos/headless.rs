//! Headless progressive renderer.
//!
//! Renders a grid of Cornell boxes for a fixed number of frames and writes the
//! presented image to a PNG.
//!
//! ```bash
//! cargo run --example headless -- --frames 256 --line-up 3 --output cornell.png
//! cargo run --example headless --features vulkan-backend -- --backend vulkan
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;

use progressive_rt::{
    hoist_cornell_box, BackendType, DrawOutcome, LineUp, OffscreenSurface, RenderStats, Renderer,
    RendererConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Software,
    Vulkan,
}

#[derive(Debug, Parser)]
#[command(about = "Render a Cornell box grid progressively and save the result")]
struct Args {
    #[arg(long, value_enum, default_value_t = Backend::Software)]
    backend: Backend,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Samples per pixel to accumulate
    #[arg(long, default_value_t = 64)]
    frames: u64,

    /// Boxes per side of the grid (1, 2 or 3)
    #[arg(long, default_value_t = 3)]
    line_up: u32,

    /// Replace the short box with a procedural sphere
    #[arg(long)]
    spheres: bool,

    #[arg(long, default_value_t = 1)]
    upscale: u32,

    #[arg(long, default_value_t = 3)]
    frames_in_flight: u32,

    #[arg(long, default_value_t = 3)]
    bounces: u32,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(long, default_value = "progressive.png")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let line_up = match args.line_up {
        1 => LineUp::OneByOne,
        2 => LineUp::TwoByTwo,
        _ => LineUp::ThreeByThree,
    };
    let scene = hoist_cornell_box(line_up, args.spheres, &mut StdRng::seed_from_u64(args.seed));

    let config = RendererConfig::default()
        .with_backend(match args.backend {
            Backend::Software => BackendType::Software,
            Backend::Vulkan => BackendType::Vulkan,
        })
        .with_size(args.width, args.height)
        .with_upscale_factor(args.upscale)
        .with_frames_in_flight(args.frames_in_flight)
        .with_max_bounces(args.bounces)
        .with_seed(args.seed);

    let stats = Arc::new(RenderStats::new());
    let mut renderer = Renderer::from_config(&scene, config, stats.clone())?;
    let mut surface = OffscreenSurface::new(renderer.backend().as_ref(), args.width, args.height)?;

    log::info!(
        "{} BLAS builds, {} instances, {} -> {} bytes after compaction",
        renderer.build_report().blas_builds(),
        renderer.build_report().instance_count,
        renderer.build_report().uncompacted_bytes(),
        renderer.build_report().compacted_bytes()
    );

    let start = Instant::now();
    renderer.set_frames_to_render(args.frames);
    while renderer.draw(&mut surface)? != DrawOutcome::Skipped {
        let frame = renderer.frame_index();
        if frame % 16 == 0 {
            log::info!("frame {frame}/{}", args.frames);
        }
    }
    renderer.wait_idle()?;

    log::info!(
        "{} frames in {:.2?} (gpu avg {:.2?}, encode avg {:.2?})",
        stats.frames_completed(),
        start.elapsed(),
        stats.gpu_time_avg(),
        stats.encode_time_avg()
    );

    let image = surface.read_image(renderer.backend().as_ref())?;
    image.save(&args.output)?;
    log::info!("Wrote {}", args.output.display());
    Ok(())
}

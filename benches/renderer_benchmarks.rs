use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use progressive_rt::backend::software::SoftwareBackend;
use progressive_rt::{
    hoist_cornell_box, AccelerationStructureBuilder, LineUp, NullStatsSink, OffscreenSurface,
    RayTracingBackend, Renderer, RendererConfig, Scene,
};

fn scene(line_up: LineUp) -> Scene {
    hoist_cornell_box(line_up, false, &mut StdRng::seed_from_u64(1))
}

// ---------------------------------------------------------------------------
// Acceleration structures
// ---------------------------------------------------------------------------

fn bench_scene_build(c: &mut Criterion) {
    let backend = SoftwareBackend::new().unwrap();
    for (name, line_up) in [
        ("acceleration_structures_1x1", LineUp::OneByOne),
        ("acceleration_structures_3x3", LineUp::ThreeByThree),
    ] {
        let scene = scene(line_up);
        let geometries: Vec<_> = scene
            .geometries()
            .iter()
            .enumerate()
            .map(|(index, geometry)| geometry.upload(&backend, index).unwrap())
            .collect();
        c.bench_function(name, |b| {
            b.iter(|| {
                let built = AccelerationStructureBuilder::new(&backend)
                    .with_primitive_data(true)
                    .build(&scene, &geometries)
                    .unwrap();
                black_box(built);
            });
        });
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

fn bench_frame(c: &mut Criterion) {
    let backend: Arc<dyn RayTracingBackend> = Arc::new(SoftwareBackend::new().unwrap());
    let config = RendererConfig::default()
        .with_size(64, 64)
        .with_seed(1)
        .with_frames_in_flight(3);
    let mut surface = OffscreenSurface::new(backend.as_ref(), 64, 64).unwrap();
    let mut renderer = Renderer::new(
        Arc::clone(&backend),
        &scene(LineUp::ThreeByThree),
        config,
        Arc::new(NullStatsSink),
    )
    .unwrap();

    c.bench_function("frame_64x64_pipelined", |b| {
        b.iter(|| black_box(renderer.draw(&mut surface).unwrap()));
    });
    renderer.wait_idle().unwrap();

    c.bench_function("frame_64x64_synchronous", |b| {
        b.iter(|| {
            renderer.draw(&mut surface).unwrap();
            renderer.wait_idle().unwrap();
        });
    });
}

criterion_group!(benches, bench_scene_build, bench_frame);
criterion_main!(benches);

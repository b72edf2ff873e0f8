//! Shared fixtures for renderer integration tests.
//!
//! Tests are parameterized with `rstest` over [`Backend`]; a backend that cannot
//! be created on this machine makes the test return early.

#![allow(dead_code)]

use std::sync::Arc;

use glam::{Affine3A, Vec3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use progressive_rt::backend::software::SoftwareBackend;
use progressive_rt::scene::FaceMask;
use progressive_rt::shaders::{AreaLight, GEOMETRY_MASK_TRIANGLE};
use progressive_rt::{
    hoist_cornell_box, Instance, LineUp, NullStatsSink, OffscreenSurface, RayTracingBackend,
    Renderer, RendererConfig, Scene, TriangleMesh, ViewerPose,
};

/// Devices the tests can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// CPU device, always available.
    Software,
    /// Hardware ray queries, when compiled in and a capable GPU is present.
    Vulkan,
}

impl Backend {
    /// Create the device, or `None` when it is unavailable here.
    pub fn create(self) -> Option<Arc<dyn RayTracingBackend>> {
        match self {
            Backend::Software => Some(Arc::new(SoftwareBackend::new().ok()?)),
            #[cfg(feature = "vulkan-backend")]
            Backend::Vulkan => {
                let backend = progressive_rt::backend::vulkan::VulkanBackend::new().ok()?;
                Some(Arc::new(backend))
            }
            #[cfg(not(feature = "vulkan-backend"))]
            Backend::Vulkan => None,
        }
    }
}

/// Small, deterministic configuration: one bounce, fixed seed.
pub fn small_config(width: u32, height: u32) -> RendererConfig {
    RendererConfig::default()
        .with_size(width, height)
        .with_seed(42)
        .with_max_bounces(1)
}

/// One Cornell box made of triangles only, so every backend can load it.
pub fn cornell_scene() -> Scene {
    hoist_cornell_box(LineUp::OneByOne, false, &mut StdRng::seed_from_u64(7))
}

/// One cube mesh placed `count` times along the x axis, lit from above.
pub fn instanced_cubes(count: usize) -> Scene {
    let mut mesh = TriangleMesh::new();
    mesh.add_cube_with_faces(
        FaceMask::ALL,
        Vec3::new(0.8, 0.8, 0.8),
        &Affine3A::from_scale(Vec3::splat(0.8)),
        false,
    );

    let mut scene = Scene::new();
    let cube = scene.add_geometry(mesh);
    for i in 0..count {
        let x = (i as f32 - (count as f32 - 1.0) * 0.5) * 1.5;
        scene.add_instance(Instance::new(
            cube,
            Affine3A::from_translation(Vec3::new(x, 0.0, 0.0)),
            GEOMETRY_MASK_TRIANGLE,
        ));
    }
    scene.add_light(AreaLight::new(
        Vec3::new(0.0, 4.0, 0.0),
        Vec3::NEG_Y,
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 0.0, 1.0),
        Vec3::splat(20.0),
    ));
    scene.set_viewer(ViewerPose::new(
        Vec3::new(0.0, 2.0, 10.0),
        Vec3::ZERO,
        Vec3::Y,
    ));
    scene
}

/// A renderer plus an offscreen surface of the display size.
pub struct TestContext {
    pub backend: Arc<dyn RayTracingBackend>,
    pub renderer: Renderer,
    pub surface: OffscreenSurface,
}

impl TestContext {
    pub fn new(backend: Backend, scene: &Scene, config: RendererConfig) -> Option<Self> {
        let device = backend.create()?;
        let surface = OffscreenSurface::new(device.as_ref(), config.width, config.height).ok()?;
        let renderer = Renderer::new(Arc::clone(&device), scene, config, Arc::new(NullStatsSink))
            .expect("renderer should load the scene");
        Some(Self {
            backend: device,
            renderer,
            surface,
        })
    }

    /// Draw `frames` frames and wait for all of them to retire.
    pub fn render(&mut self, frames: u64) {
        for _ in 0..frames {
            self.renderer
                .draw(&mut self.surface)
                .expect("draw should succeed");
        }
        self.renderer.wait_idle().expect("device should stay healthy");
    }

    /// Latest accumulated estimate as RGB floats.
    pub fn accumulated(&self) -> Vec<f32> {
        let image = self.renderer.capture().expect("capture should succeed");
        image
            .pixels()
            .flat_map(|pixel| [pixel.0[0], pixel.0[1], pixel.0[2]])
            .collect()
    }
}

/// Mean absolute difference between two equally sized images.
pub fn mean_abs_difference(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum();
    sum / a.len().max(1) as f32
}

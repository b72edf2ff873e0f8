//! Acceleration-structure builds through the public renderer API.
//!
//! ```bash
//! cargo test --test acceleration_structures
//! cargo test --test acceleration_structures --features vulkan-backend
//! ```

mod common;

use std::sync::Arc;

use glam::{Affine3A, Vec3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rstest::rstest;

use common::{cornell_scene, instanced_cubes, small_config, Backend};
use progressive_rt::backend::software::SoftwareBackend;
use progressive_rt::scene::FaceMask;
use progressive_rt::shaders::INSTANCE_MASK_ALL;
use progressive_rt::{
    hoist_cornell_box, AccelerationStructureBuilder, BackendError, Instance, LineUp,
    NullStatsSink, RayTracingBackend, Renderer, RendererError, Scene, SceneError, TriangleMesh,
};

/// A lone unit cube gives one 12-triangle bottom-level structure under a
/// single-instance top-level structure.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_unit_cube_builds_single_instance(#[case] backend: Backend) {
    let Some(device) = backend.create() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let mut mesh = TriangleMesh::new();
    mesh.add_cube_with_faces(FaceMask::ALL, Vec3::ONE, &Affine3A::IDENTITY, false);
    let mut scene = Scene::new();
    let cube = scene.add_geometry(mesh);
    scene.add_instance(Instance::new(cube, Affine3A::IDENTITY, INSTANCE_MASK_ALL));

    let renderer = Renderer::new(device, &scene, small_config(16, 16), Arc::new(NullStatsSink))
        .expect("scene should load");

    let report = renderer.build_report();
    assert_eq!(report.instance_count, 1);
    assert_eq!(report.blas_builds(), 1);
    assert_eq!(report.bottom_level[0].primitive_count, 12);
    assert_eq!(report.total_primitives(), 12);

    let instances = renderer.acceleration_structures().instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].mask, INSTANCE_MASK_ALL);
    assert_eq!(instances[0].acceleration_structure_index, 0);
}

/// One geometry placed nine times builds one bottom-level structure and a
/// top-level structure with nine instances.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_instanced_geometry_builds_one_blas(#[case] backend: Backend) {
    let Some(device) = backend.create() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let scene = instanced_cubes(9);
    let renderer = Renderer::new(device, &scene, small_config(32, 32), Arc::new(NullStatsSink))
        .expect("scene should load");

    let report = renderer.build_report();
    assert_eq!(report.blas_builds(), 1);
    assert_eq!(report.instance_count, 9);
    assert_eq!(renderer.acceleration_structures().bottom_level().len(), 1);
    assert_eq!(renderer.acceleration_structures().instances().len(), 9);
    assert!(renderer
        .acceleration_structures()
        .instances()
        .iter()
        .all(|instance| instance.acceleration_structure_index == 0));
}

/// Every compacted structure fits in the storage it was built in.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_compaction_never_grows(#[case] backend: Backend) {
    let Some(device) = backend.create() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let scene = hoist_cornell_box(LineUp::ThreeByThree, false, &mut StdRng::seed_from_u64(3));
    let renderer = Renderer::new(device, &scene, small_config(16, 16), Arc::new(NullStatsSink))
        .expect("scene should load");

    let report = renderer.build_report();
    assert_eq!(report.blas_builds(), 2);
    assert_eq!(report.instance_count, 18);
    for blas in &report.bottom_level {
        assert!(blas.compacted_size > 0);
        assert!(
            blas.compacted_size <= blas.uncompacted_size,
            "geometry {}: compacted {} > uncompacted {}",
            blas.geometry,
            blas.compacted_size,
            blas.uncompacted_size
        );
    }
    assert!(report.compacted_bytes() <= report.uncompacted_bytes());
}

/// Procedural spheres get their own bottom-level structure on a device with
/// intersection functions.
#[test]
fn test_procedural_geometry_on_software() {
    let device: Arc<dyn RayTracingBackend> = Arc::new(SoftwareBackend::new().unwrap());
    let scene = hoist_cornell_box(LineUp::TwoByTwo, true, &mut StdRng::seed_from_u64(3));
    let renderer = Renderer::new(device, &scene, small_config(16, 16), Arc::new(NullStatsSink))
        .unwrap();

    assert_eq!(renderer.build_report().blas_builds(), 3);
    assert_eq!(renderer.build_report().instance_count, 12);
}

/// A device without intersection functions rejects procedural scenes as a
/// scene error, not a device failure.
#[rstest]
#[case::vulkan(Backend::Vulkan)]
fn test_procedural_geometry_rejected_without_intersection_functions(#[case] backend: Backend) {
    let Some(device) = backend.create() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    if device.capabilities().intersection_functions {
        return;
    }
    let scene = hoist_cornell_box(LineUp::OneByOne, true, &mut StdRng::seed_from_u64(3));
    let error = Renderer::new(device, &scene, small_config(16, 16), Arc::new(NullStatsSink))
        .unwrap_err();

    assert!(matches!(
        error,
        RendererError::Scene(SceneError::UnsupportedIntersectionFunction { .. })
    ));
    assert!(!error.is_fatal());
}

/// Running out of device memory while building is fatal.
#[test]
fn test_allocation_failure_aborts_construction() {
    let device: Arc<dyn RayTracingBackend> =
        Arc::new(SoftwareBackend::with_memory_budget(64 * 1024).unwrap());
    let error = Renderer::new(
        device,
        &cornell_scene(),
        small_config(64, 64),
        Arc::new(NullStatsSink),
    )
    .unwrap_err();

    assert_eq!(error, RendererError::Backend(BackendError::OutOfMemory));
    assert!(error.is_fatal());
}

/// A failed build leaves no structures behind.
#[test]
fn test_failed_build_releases_memory() {
    let scene = hoist_cornell_box(LineUp::ThreeByThree, false, &mut StdRng::seed_from_u64(1));
    let upload = |backend: &SoftwareBackend| {
        scene
            .geometries()
            .iter()
            .enumerate()
            .map(|(index, geometry)| geometry.upload(backend, index))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    };

    // Measure an unconstrained build first.
    let unlimited = SoftwareBackend::new().unwrap();
    let geometries = upload(&unlimited);
    let uploaded = unlimited.memory_in_use();
    let built = AccelerationStructureBuilder::new(&unlimited)
        .with_primitive_data(true)
        .build(&scene, &geometries)
        .unwrap();
    let retained = unlimited.memory_in_use();
    assert!(retained > uploaded);
    drop(built);

    let limited = SoftwareBackend::with_memory_budget(uploaded + (retained - uploaded) / 2).unwrap();
    let geometries = upload(&limited);
    let before = limited.memory_in_use();
    let result = AccelerationStructureBuilder::new(&limited)
        .with_primitive_data(true)
        .build(&scene, &geometries);

    assert!(matches!(result, Err(BackendError::OutOfMemory)));
    limited.wait_idle().unwrap();
    assert_eq!(limited.memory_in_use(), before);
}

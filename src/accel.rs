//! Two-level acceleration structure construction.
//!
//! Every geometry gets one bottom-level structure (BLAS), built once and shared by
//! all of its instances. Each BLAS is compacted before use, which needs the
//! compacted size back on the CPU, so the builder blocks on the device once per
//! geometry. A single top-level structure (TLAS) then places every instance.
//!
//! ```text
//! geometry ─▶ sizes ─▶ build + write compacted size ─▶ wait ─▶ copy-and-compact ─┐
//!                                                                               ▼
//! instances ─▶ instance descriptors ─▶ TLAS build over [BLAS; geometry count] ─▶ wait
//! ```

use std::sync::Arc;

use crate::backend::{
    AccelerationStructureDescriptor, AccelerationStructureKind, BackendError, BackendResult,
    BufferDescriptor, BufferUsage, CommandList, InstanceDescriptor, InstanceOptions,
    RayTracingBackend, TopLevelDescriptor,
};
use crate::resources::{AccelerationStructure, Buffer};
use crate::scene::{Scene, UploadedGeometry};

/// Size of the compacted-size readback slot.
const COMPACTED_SIZE_BYTES: u64 = std::mem::size_of::<u64>() as u64;

/// Storage of one bottom-level structure before and after compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BottomLevelReport {
    pub geometry: usize,
    pub primitive_count: u32,
    pub uncompacted_size: u64,
    pub compacted_size: u64,
}

/// What a scene build produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub bottom_level: Vec<BottomLevelReport>,
    pub instance_count: usize,
    pub top_level_size: u64,
}

impl BuildReport {
    /// Number of bottom-level builds issued.
    pub fn blas_builds(&self) -> usize {
        self.bottom_level.len()
    }

    pub fn total_primitives(&self) -> u64 {
        self.bottom_level
            .iter()
            .map(|b| b.primitive_count as u64)
            .sum()
    }

    pub fn uncompacted_bytes(&self) -> u64 {
        self.bottom_level.iter().map(|b| b.uncompacted_size).sum()
    }

    pub fn compacted_bytes(&self) -> u64 {
        self.bottom_level.iter().map(|b| b.compacted_size).sum()
    }
}

/// Acceleration structures of a loaded scene.
///
/// Only handed out once the TLAS build has retired on the device.
pub struct SceneAccelerationStructures {
    bottom_level: Vec<Arc<AccelerationStructure>>,
    top_level: Arc<AccelerationStructure>,
    instance_buffer: Arc<Buffer>,
    instances: Vec<InstanceDescriptor>,
    report: BuildReport,
}

impl SceneAccelerationStructures {
    /// Compacted BLAS, indexed by geometry.
    pub fn bottom_level(&self) -> &[Arc<AccelerationStructure>] {
        &self.bottom_level
    }

    pub fn top_level(&self) -> &Arc<AccelerationStructure> {
        &self.top_level
    }

    /// Instance descriptors as uploaded; also bound to the kernel.
    pub fn instance_buffer(&self) -> &Arc<Buffer> {
        &self.instance_buffer
    }

    pub fn instances(&self) -> &[InstanceDescriptor] {
        &self.instances
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }
}

impl std::fmt::Debug for SceneAccelerationStructures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneAccelerationStructures")
            .field("bottom_level", &self.bottom_level.len())
            .field("instances", &self.instances.len())
            .field("report", &self.report)
            .finish()
    }
}

pub struct AccelerationStructureBuilder<'a> {
    backend: &'a dyn RayTracingBackend,
    embed_primitive_data: bool,
}

impl<'a> AccelerationStructureBuilder<'a> {
    pub fn new(backend: &'a dyn RayTracingBackend) -> Self {
        Self {
            backend,
            embed_primitive_data: false,
        }
    }

    /// Store per-primitive payloads inside the bottom-level structures.
    pub fn with_primitive_data(mut self, embed: bool) -> Self {
        self.embed_primitive_data = embed;
        self
    }

    /// Build one compacted BLAS for `geometry`.
    ///
    /// Blocks until the build has retired so the compacted size can be read. The
    /// uncompacted structure is released once the queued compaction copy retires.
    pub fn build_bottom_level(
        &self,
        index: usize,
        geometry: &UploadedGeometry,
    ) -> BackendResult<(Arc<AccelerationStructure>, BottomLevelReport)> {
        let backend = self.backend;
        let descriptor =
            AccelerationStructureDescriptor::BottomLevel(geometry.descriptor(self.embed_primitive_data));
        let sizes = backend.acceleration_structure_sizes(&descriptor)?;

        let label = format!("blas{index}");
        let uncompacted = backend.create_acceleration_structure(
            AccelerationStructureKind::BottomLevel,
            sizes.acceleration_structure_size,
            Some(&label),
        )?;
        let scratch = backend.create_buffer(
            &BufferDescriptor::new(
                sizes.build_scratch_size,
                BufferUsage::ACCELERATION_STRUCTURE_SCRATCH | BufferUsage::STORAGE,
            )
            .with_label(format!("{label}_scratch")),
        )?;
        let compacted_size_buffer = backend.create_buffer(
            &BufferDescriptor::new(
                COMPACTED_SIZE_BYTES,
                BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            )
            .with_label(format!("{label}_compacted_size")),
        )?;

        let mut commands = CommandList::new(format!("{label}_build"));
        commands.build_acceleration_structure(descriptor, scratch, Arc::clone(&uncompacted));
        commands.write_compacted_size(
            Arc::clone(&uncompacted),
            Arc::clone(&compacted_size_buffer),
            0,
        );
        let submission = backend.submit(commands, None)?;
        backend.wait(submission)?;

        let bytes = backend.read_buffer(&compacted_size_buffer, 0, COMPACTED_SIZE_BYTES)?;
        let compacted_size = bytemuck::pod_read_unaligned::<u64>(&bytes);
        if compacted_size == 0 || compacted_size > uncompacted.size() {
            return Err(BackendError::ExecutionFailed(format!(
                "{label}: compacted size {compacted_size} for {} bytes of storage",
                uncompacted.size()
            )));
        }

        let compacted = backend.create_acceleration_structure(
            AccelerationStructureKind::BottomLevel,
            compacted_size,
            Some(&label),
        )?;
        let report = BottomLevelReport {
            geometry: index,
            primitive_count: geometry.primitive_count(),
            uncompacted_size: uncompacted.size(),
            compacted_size,
        };

        let mut commands = CommandList::new(format!("{label}_compact"));
        commands.copy_and_compact(uncompacted, Arc::clone(&compacted));
        backend.submit(commands, None)?;

        log::debug!(
            "BLAS {}: {} primitives, {} -> {} bytes",
            index,
            report.primitive_count,
            report.uncompacted_size,
            report.compacted_size
        );
        Ok((compacted, report))
    }

    /// One descriptor per scene instance.
    ///
    /// The BLAS index and intersection function table offset are both the
    /// geometry index; instances of geometry without an intersection function
    /// are opaque.
    pub fn instance_descriptors(
        scene: &Scene,
        geometries: &[UploadedGeometry],
    ) -> Vec<InstanceDescriptor> {
        scene
            .instances()
            .iter()
            .map(|instance| {
                let procedural = geometries
                    .get(instance.geometry)
                    .is_some_and(|g| g.intersection_function().is_some());
                let options = if procedural {
                    InstanceOptions::NONE
                } else {
                    InstanceOptions::OPAQUE
                };
                let mut descriptor = InstanceDescriptor::new(
                    &instance.transform,
                    options,
                    instance.mask,
                    instance.geometry as u32,
                );
                descriptor.intersection_function_table_offset = instance.geometry as u32;
                descriptor
            })
            .collect()
    }

    /// Upload `instances` and build the TLAS over `bottom_level`, waiting for it
    /// to retire.
    pub fn build_top_level(
        &self,
        instances: &[InstanceDescriptor],
        bottom_level: &[Arc<AccelerationStructure>],
    ) -> BackendResult<(Arc<AccelerationStructure>, Arc<Buffer>)> {
        let backend = self.backend;
        let bytes: &[u8] = bytemuck::cast_slice(instances);
        let instance_buffer = backend.create_buffer_init(
            &BufferDescriptor::new(
                bytes.len() as u64,
                BufferUsage::ACCELERATION_STRUCTURE_INPUT
                    | BufferUsage::STORAGE
                    | BufferUsage::MAP_WRITE,
            )
            .with_label("instances"),
            bytes,
        )?;

        let descriptor = AccelerationStructureDescriptor::TopLevel(TopLevelDescriptor {
            instance_buffer: Arc::clone(&instance_buffer),
            instance_count: instances.len() as u32,
            bottom_level: bottom_level.to_vec(),
        });
        let sizes = backend.acceleration_structure_sizes(&descriptor)?;
        let top_level = backend.create_acceleration_structure(
            AccelerationStructureKind::TopLevel,
            sizes.acceleration_structure_size,
            Some("tlas"),
        )?;
        let scratch = backend.create_buffer(
            &BufferDescriptor::new(
                sizes.build_scratch_size,
                BufferUsage::ACCELERATION_STRUCTURE_SCRATCH | BufferUsage::STORAGE,
            )
            .with_label("tlas_scratch"),
        )?;

        let mut commands = CommandList::new("tlas_build");
        commands.build_acceleration_structure(descriptor, scratch, Arc::clone(&top_level));
        let submission = backend.submit(commands, None)?;
        backend.wait(submission)?;

        Ok((top_level, instance_buffer))
    }

    /// Build every BLAS, then the TLAS. Nothing is returned unless all builds
    /// succeeded.
    pub fn build(
        &self,
        scene: &Scene,
        geometries: &[UploadedGeometry],
    ) -> BackendResult<SceneAccelerationStructures> {
        let mut bottom_level = Vec::with_capacity(geometries.len());
        let mut report = BuildReport::default();
        for (index, geometry) in geometries.iter().enumerate() {
            let (structure, blas) = self.build_bottom_level(index, geometry)?;
            bottom_level.push(structure);
            report.bottom_level.push(blas);
        }

        let instances = Self::instance_descriptors(scene, geometries);
        let (top_level, instance_buffer) = self.build_top_level(&instances, &bottom_level)?;
        report.instance_count = instances.len();
        report.top_level_size = top_level.size();

        log::debug!(
            "Scene acceleration structures: {} BLAS builds ({} primitives, {} -> {} bytes), TLAS over {} instances ({} bytes)",
            report.blas_builds(),
            report.total_primitives(),
            report.uncompacted_bytes(),
            report.compacted_bytes(),
            report.instance_count,
            report.top_level_size
        );

        Ok(SceneAccelerationStructures {
            bottom_level,
            top_level,
            instance_buffer,
            instances,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::scene::{FaceMask, Geometry, Instance, SphereGeometry, TriangleMesh};
    use crate::shaders::{
        GEOMETRY_MASK_LIGHT, GEOMETRY_MASK_SPHERE, GEOMETRY_MASK_TRIANGLE, RAY_MASK_PRIMARY,
    };
    use glam::{Affine3A, Vec3};

    fn upload(backend: &SoftwareBackend, scene: &Scene) -> Vec<UploadedGeometry> {
        scene
            .geometries()
            .iter()
            .enumerate()
            .map(|(i, g)| g.upload(backend, i).unwrap())
            .collect()
    }

    fn mixed_scene() -> Scene {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(FaceMask::ALL, Vec3::ONE, &Affine3A::IDENTITY, false);
        let mut spheres = SphereGeometry::new();
        spheres.add_sphere(Vec3::ZERO, 0.5, Vec3::ONE);

        let mut scene = Scene::new();
        let cube = scene.add_geometry(mesh);
        let sphere = scene.add_geometry(Geometry::from(spheres));
        scene.add_instance(Instance::new(cube, Affine3A::IDENTITY, GEOMETRY_MASK_TRIANGLE));
        scene.add_instance(Instance::new(
            sphere,
            Affine3A::from_translation(Vec3::X * 3.0),
            GEOMETRY_MASK_SPHERE,
        ));
        scene
    }

    #[test]
    fn compaction_never_grows() {
        let backend = SoftwareBackend::new().unwrap();
        let scene = mixed_scene();
        let geometries = upload(&backend, &scene);

        let structures = AccelerationStructureBuilder::new(&backend)
            .build(&scene, &geometries)
            .unwrap();
        let report = structures.report();

        assert_eq!(report.blas_builds(), 2);
        assert_eq!(report.instance_count, 2);
        for blas in &report.bottom_level {
            assert!(blas.compacted_size <= blas.uncompacted_size, "{blas:?}");
        }
        for (structure, blas) in structures.bottom_level().iter().zip(&report.bottom_level) {
            assert_eq!(structure.size(), blas.compacted_size);
        }
    }

    #[test]
    fn instance_descriptors_reference_geometry() {
        let backend = SoftwareBackend::new().unwrap();
        let scene = mixed_scene();
        let geometries = upload(&backend, &scene);

        let descriptors = AccelerationStructureBuilder::instance_descriptors(&scene, &geometries);

        assert_eq!(descriptors[0].acceleration_structure_index, 0);
        assert!(descriptors[0].is_opaque());
        assert_eq!(descriptors[1].acceleration_structure_index, 1);
        assert_eq!(descriptors[1].intersection_function_table_offset, 1);
        assert!(!descriptors[1].is_opaque());
        assert_eq!(descriptors[1].transform[3], [3.0, 0.0, 0.0]);
    }

    #[test]
    fn built_scene_is_traceable() {
        let backend = SoftwareBackend::new().unwrap();
        let scene = mixed_scene();
        let geometries = upload(&backend, &scene);
        let structures = AccelerationStructureBuilder::new(&backend)
            .with_primitive_data(true)
            .build(&scene, &geometries)
            .unwrap();
        backend.wait_idle().unwrap();

        let hit = backend
            .intersect(
                structures.top_level(),
                Vec3::new(3.0, 0.0, 5.0),
                Vec3::NEG_Z,
                GEOMETRY_MASK_SPHERE,
            )
            .unwrap()
            .expect("ray towards the sphere hits");
        assert_eq!(hit.instance_index, 1);
        assert!((hit.distance - 4.5).abs() < 1e-4);
    }

    #[test]
    fn instance_masks_filter_rays() {
        let backend = SoftwareBackend::new().unwrap();
        let scene = mixed_scene();
        let geometries = upload(&backend, &scene);
        let structures = AccelerationStructureBuilder::new(&backend)
            .with_primitive_data(true)
            .build(&scene, &geometries)
            .unwrap();
        backend.wait_idle().unwrap();

        let trace = |mask: u32| {
            backend
                .intersect(structures.top_level(), Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, mask)
                .unwrap()
        };

        let hit = trace(GEOMETRY_MASK_TRIANGLE).expect("triangle ray sees the cube");
        assert_eq!(hit.instance_index, 0);
        assert_eq!(hit.instance_mask, GEOMETRY_MASK_TRIANGLE);
        assert!((hit.distance - 4.5).abs() < 1e-4);
        assert!(trace(RAY_MASK_PRIMARY).is_some());
        assert!(trace(GEOMETRY_MASK_SPHERE).is_none());
        assert!(trace(GEOMETRY_MASK_LIGHT).is_none());
    }
}

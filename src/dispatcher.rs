//! Per-frame ray-tracing dispatch.
//!
//! Owns the specialized kernel pipeline and everything bound to it that stays
//! fixed between resets: lights, instance descriptors, the TLAS, the resource
//! table and the intersection function table. Each frame it writes the camera
//! into a uniform slot, encodes one dispatch over the render target and swaps
//! the accumulation roles.

use std::sync::Arc;

use glam::Vec3;

use crate::accel::SceneAccelerationStructures;
use crate::accumulation::AccumulationBuffer;
use crate::backend::{
    BackendResult, Binding, BufferDescriptor, BufferUsage, CommandList,
    ComputePipelineDescriptor, DispatchCommand, KernelConstants, RayTracingBackend,
    ResidentResource,
};
use crate::resource_table::ResourceTable;
use crate::resources::{AccelerationStructure, Buffer, ComputePipeline, IntersectionFunctionTable};
use crate::scene::{Scene, UploadedGeometry, ViewerPose};
use crate::scheduler::UniformRing;
use crate::shaders::{
    slot, AreaLight, CameraUniforms, FrameUniforms, RAYTRACING_ENTRY_POINT, RAYTRACING_KERNEL,
    WORKGROUP_SIZE,
};

/// Vertical field of view.
pub const FIELD_OF_VIEW_DEGREES: f32 = 45.0;

/// Camera frame with `right` and `up` pre-scaled to the image plane at unit
/// distance, so a primary ray is `forward + u * right + v * up` for `u, v` in
/// `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraBasis {
    pub position: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    pub forward: Vec3,
}

impl CameraBasis {
    pub fn new(viewer: &ViewerPose, aspect_ratio: f32) -> Self {
        let forward = (viewer.target - viewer.position).normalize();
        let right = forward.cross(viewer.up).normalize();
        let up = right.cross(forward).normalize();

        let image_plane_height = (FIELD_OF_VIEW_DEGREES.to_radians() / 2.0).tan();
        Self {
            position: viewer.position,
            right: right * image_plane_height * aspect_ratio,
            up: up * image_plane_height,
            forward,
        }
    }

    pub fn uniforms(&self) -> CameraUniforms {
        CameraUniforms::new(self.position, self.right, self.up, self.forward)
    }
}

/// Frame index as the kernel sees it. Saturates instead of wrapping, since a
/// kernel frame index of 0 discards the accumulated image.
pub fn kernel_frame_index(frame_index: u64) -> u32 {
    u32::try_from(frame_index).unwrap_or(u32::MAX)
}

pub struct RayTraceDispatcher {
    pipeline: Arc<ComputePipeline>,
    function_table: Option<Arc<IntersectionFunctionTable>>,
    resource_table: Option<Arc<Buffer>>,
    lights: Arc<Buffer>,
    light_count: u32,
    instances: Arc<Buffer>,
    top_level: Arc<AccelerationStructure>,
    resident: Vec<ResidentResource>,
    viewer: ViewerPose,
}

impl RayTraceDispatcher {
    /// Specialize the kernel for a loaded scene.
    ///
    /// With `use_primitive_data` the kernel reads primitive payloads from the
    /// acceleration structures and the resource table is left unbound.
    pub fn new(
        backend: &dyn RayTracingBackend,
        scene: &Scene,
        geometries: &[UploadedGeometry],
        structures: &SceneAccelerationStructures,
        resource_table: &ResourceTable,
        max_bounces: u32,
        use_primitive_data: bool,
    ) -> BackendResult<Self> {
        let functions: Vec<_> = geometries
            .iter()
            .map(UploadedGeometry::intersection_function)
            .collect();
        let use_intersection_functions = functions.iter().any(Option::is_some);
        let mut linked = Vec::new();
        for function in functions.iter().flatten() {
            if !linked.contains(function) {
                linked.push(*function);
            }
        }

        let constants = KernelConstants {
            resources_stride: resource_table.stride() as u32,
            use_intersection_functions,
            use_primitive_data,
            max_bounces,
        };
        let pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("raytracing".into()),
            source: RAYTRACING_KERNEL,
            entry_point: RAYTRACING_ENTRY_POINT,
            workgroup_size: WORKGROUP_SIZE,
            constants,
            intersection_functions: linked,
        })?;

        let table_buffer = (!use_primitive_data).then(|| Arc::clone(resource_table.buffer()));
        let function_table = if use_intersection_functions {
            Some(Arc::new(IntersectionFunctionTable::new(
                backend,
                &pipeline,
                functions,
                table_buffer.clone(),
            )?))
        } else {
            None
        };

        // Buffers cannot be empty; an unlit scene binds one zeroed light.
        let lights: Vec<AreaLight> = if scene.lights().is_empty() {
            vec![AreaLight::default()]
        } else {
            scene.lights().to_vec()
        };
        let light_bytes: &[u8] = bytemuck::cast_slice(&lights);
        let lights_buffer = backend.create_buffer_init(
            &BufferDescriptor::new(
                light_bytes.len() as u64,
                BufferUsage::STORAGE | BufferUsage::MAP_WRITE,
            )
            .with_label("lights"),
            light_bytes,
        )?;

        let mut resident: Vec<ResidentResource> = resource_table.resident_resources().collect();
        resident.extend(
            structures
                .bottom_level()
                .iter()
                .map(|blas| ResidentResource::AccelerationStructure(Arc::clone(blas))),
        );

        log::debug!(
            "Ray-trace pipeline: stride {}, intersection functions {}, primitive data {}, {} bounces",
            constants.resources_stride,
            use_intersection_functions,
            use_primitive_data,
            max_bounces
        );

        Ok(Self {
            pipeline,
            function_table,
            resource_table: table_buffer,
            lights: lights_buffer,
            light_count: scene.lights().len() as u32,
            instances: Arc::clone(structures.instance_buffer()),
            top_level: Arc::clone(structures.top_level()),
            resident,
            viewer: *scene.viewer(),
        })
    }

    pub fn pipeline(&self) -> &Arc<ComputePipeline> {
        &self.pipeline
    }

    pub fn function_table(&self) -> Option<&Arc<IntersectionFunctionTable>> {
        self.function_table.as_ref()
    }

    pub fn viewer(&self) -> &ViewerPose {
        &self.viewer
    }

    /// Uniforms for frame `frame_index` of a `width`×`height` render.
    pub fn frame_uniforms(&self, width: u32, height: u32, frame_index: u32) -> FrameUniforms {
        let aspect_ratio = width as f32 / height as f32;
        FrameUniforms {
            width,
            height,
            frame_index,
            light_count: self.light_count,
            camera: CameraBasis::new(&self.viewer, aspect_ratio).uniforms(),
        }
    }

    /// Write this frame's uniforms, encode the dispatch and swap accumulation
    /// roles.
    pub fn encode(
        &self,
        backend: &dyn RayTracingBackend,
        commands: &mut CommandList,
        ring: &UniformRing,
        frame_index: u64,
        accumulation: &mut AccumulationBuffer,
    ) -> BackendResult<()> {
        let (width, height) = accumulation.size();
        let uniforms = self.frame_uniforms(width, height, kernel_frame_index(frame_index));
        let uniform_binding = ring.write(backend, frame_index, &uniforms)?;

        let mut bindings = vec![
            (slot::UNIFORMS, uniform_binding),
            (slot::INSTANCES, Binding::StorageBuffer(Arc::clone(&self.instances))),
            (slot::LIGHTS, Binding::StorageBuffer(Arc::clone(&self.lights))),
            (
                slot::ACCELERATION_STRUCTURE,
                Binding::AccelerationStructure(Arc::clone(&self.top_level)),
            ),
            (slot::SEEDS, Binding::Texture(Arc::clone(accumulation.seeds()))),
            (
                slot::ACCUMULATION_SOURCE,
                Binding::Texture(Arc::clone(accumulation.source())),
            ),
            (
                slot::ACCUMULATION_TARGET,
                Binding::StorageTexture(Arc::clone(accumulation.target())),
            ),
        ];
        if let Some(table) = &self.resource_table {
            bindings.push((slot::RESOURCES, Binding::StorageBuffer(Arc::clone(table))));
        }
        if let Some(table) = &self.function_table {
            bindings.push((
                slot::INTERSECTION_FUNCTION_TABLE,
                Binding::IntersectionFunctionTable(Arc::clone(table)),
            ));
        }

        commands.dispatch(DispatchCommand {
            pipeline: Arc::clone(&self.pipeline),
            bindings,
            resident: self.resident.clone(),
            grid: [width, height],
        });
        accumulation.swap();
        Ok(())
    }
}

impl std::fmt::Debug for RayTraceDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTraceDispatcher")
            .field("pipeline", &self.pipeline)
            .field("light_count", &self.light_count)
            .field("resident", &self.resident.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Vec3, b: Vec3) {
        assert!((a - b).length() < 1e-5, "{a} != {b}");
    }

    #[test]
    fn basis_is_scaled_by_fov_and_aspect() {
        let viewer = ViewerPose::new(Vec3::new(0.0, 1.0, 10.0), Vec3::new(0.0, 1.0, 0.0), Vec3::Y);
        let basis = CameraBasis::new(&viewer, 2.0);
        let half_height = (22.5f32).to_radians().tan();

        assert_close(basis.forward, Vec3::NEG_Z);
        assert_close(basis.right, Vec3::X * half_height * 2.0);
        assert_close(basis.up, Vec3::Y * half_height);
        assert!((basis.up.length() - 0.414_213_5).abs() < 1e-5);
    }

    #[test]
    fn frame_index_saturates() {
        assert_eq!(kernel_frame_index(0), 0);
        assert_eq!(kernel_frame_index(7), 7);
        assert_eq!(kernel_frame_index(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(kernel_frame_index(u64::from(u32::MAX) + 1), u32::MAX);
        assert_eq!(kernel_frame_index(u64::MAX), u32::MAX);
    }

    #[test]
    fn basis_is_orthogonal_for_tilted_up() {
        let viewer = ViewerPose::new(Vec3::ZERO, Vec3::new(1.0, 0.5, -2.0), Vec3::new(0.1, 1.0, 0.0));
        let basis = CameraBasis::new(&viewer, 1.5);

        assert!(basis.forward.dot(basis.right).abs() < 1e-5);
        assert!(basis.forward.dot(basis.up).abs() < 1e-5);
        assert!(basis.right.dot(basis.up).abs() < 1e-5);
    }
}

//! Acceleration structure inputs for `VK_KHR_acceleration_structure`.
//!
//! Bottom-level primitive payloads are not stored inside Vulkan structures.
//! Instead, a top-level build gathers the payloads of its bottom-level
//! structures into one buffer and points each instance's custom index at the
//! first payload element of its geometry. The kernel reads
//! `primitives[custom_index + primitive_index]`.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::conversion::{RawInstance, MAX_CUSTOM_INDEX};
use super::device::DeviceContext;
use super::{vulkan_acceleration_structure, vulkan_buffer, Payload, VulkanBuffer};
use crate::backend::{
    AccelerationStructureKind, AccelerationStructureSizes, BackendError, BackendResult,
    GeometryDescriptor, IndexFormat, InstanceDescriptor, TopLevelDescriptor,
};
use crate::shaders::Triangle;

pub fn convert_kind(kind: AccelerationStructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

pub fn build_flags() -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
}

/// Geometry description and primitive count of a bottom-level build.
pub fn bottom_level_geometry(
    geometry: &GeometryDescriptor,
) -> BackendResult<(vk::AccelerationStructureGeometryKHR<'static>, u32)> {
    match geometry {
        GeometryDescriptor::Triangles {
            vertex_buffer,
            vertex_stride,
            vertex_count,
            index_buffer,
            index_format,
            triangle_count,
            ..
        } => {
            let index_type = match index_format {
                IndexFormat::Uint16 => vk::IndexType::UINT16,
                IndexFormat::Uint32 => vk::IndexType::UINT32,
            };
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vulkan_buffer(vertex_buffer)?.address(),
                })
                .vertex_stride(*vertex_stride)
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(index_type)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vulkan_buffer(index_buffer)?.address(),
                });
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE);
            Ok((geometry, *triangle_count))
        }
        GeometryDescriptor::BoundingBoxes {
            bounding_box_buffer,
            bounding_box_stride,
            bounding_box_count,
            ..
        } => {
            let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vulkan_buffer(bounding_box_buffer)?.address(),
                })
                .stride(*bounding_box_stride);
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs });
            Ok((geometry, *bounding_box_count))
        }
    }
}

/// Geometry description of a top-level build over packed [`RawInstance`]s.
pub fn top_level_geometry(instances_address: u64) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instances_address,
        });
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
}

/// Storage and scratch sizes reported by the driver.
pub fn build_sizes(
    context: &DeviceContext,
    kind: AccelerationStructureKind,
    geometry: vk::AccelerationStructureGeometryKHR<'static>,
    primitive_count: u32,
) -> AccelerationStructureSizes {
    let geometries = [geometry];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(convert_kind(kind))
        .flags(build_flags())
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);
    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        context.acceleration_structure.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut sizes,
        );
    }
    AccelerationStructureSizes {
        acceleration_structure_size: sizes.acceleration_structure_size,
        build_scratch_size: sizes.build_scratch_size + context.properties.scratch_offset_alignment,
    }
}

/// Host-side preparation of a top-level build.
pub struct GatheredInstances {
    pub instances: Arc<VulkanBuffer>,
    pub payload: Arc<VulkanBuffer>,
    /// `(source, destination offset, bytes)` copies filling `payload`
    pub copies: Vec<(vk::Buffer, u64, u64)>,
}

/// Translate instance descriptors into Vulkan instances and lay out the
/// gathered primitive payload.
pub fn gather_instances(
    context: &Arc<DeviceContext>,
    top: &TopLevelDescriptor,
) -> BackendResult<GatheredInstances> {
    let element_size = std::mem::size_of::<Triangle>() as u64;

    let mut bases = Vec::with_capacity(top.bottom_level.len());
    let mut copies = Vec::new();
    let mut elements: u64 = 0;
    for (index, bottom) in top.bottom_level.iter().enumerate() {
        bases.push(elements);
        let payload = vulkan_acceleration_structure(bottom)?.payload();
        if let Some(Payload::Primitives { buffer, stride, count }) = payload {
            if stride != element_size {
                return Err(BackendError::FeatureNotSupported(format!(
                    "bottom-level structure {index} carries {stride}-byte primitives; \
                     the Vulkan kernel reads only {element_size}-byte triangles"
                )));
            }
            let bytes = u64::from(count) * stride;
            copies.push((vulkan_buffer(&buffer)?.raw(), elements * element_size, bytes));
            elements += u64::from(count);
        }
    }

    let descriptor_bytes = vulkan_buffer(&top.instance_buffer)?.read(
        0,
        u64::from(top.instance_count) * std::mem::size_of::<InstanceDescriptor>() as u64,
    )?;
    let mut raw_instances = Vec::with_capacity(top.instance_count as usize);
    for (i, chunk) in descriptor_bytes
        .chunks_exact(std::mem::size_of::<InstanceDescriptor>())
        .enumerate()
    {
        let descriptor: InstanceDescriptor = bytemuck::pod_read_unaligned(chunk);
        let index = descriptor.acceleration_structure_index as usize;
        let bottom = top.bottom_level.get(index).ok_or_else(|| {
            BackendError::InvalidParameter(format!(
                "instance {i} references bottom-level structure {index} of {}",
                top.bottom_level.len()
            ))
        })?;
        let base = bases[index];
        if base > u64::from(MAX_CUSTOM_INDEX) {
            return Err(BackendError::FeatureNotSupported(format!(
                "instance {i} needs payload offset {base}, above the 24-bit custom index"
            )));
        }
        raw_instances.push(RawInstance::new(
            &descriptor,
            base as u32,
            vulkan_acceleration_structure(bottom)?.address(),
        ));
    }

    let instance_bytes: &[u8] = bytemuck::cast_slice(&raw_instances);
    let instances = VulkanBuffer::new(
        context,
        (instance_bytes.len() as u64).max(std::mem::size_of::<RawInstance>() as u64),
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
        16,
        "tlas_instances",
    )?;
    instances.write(0, instance_bytes)?;

    // Binding 1 must be valid even when no geometry carries a payload.
    let payload = VulkanBuffer::new(
        context,
        elements.max(1) * element_size,
        vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        16,
        "tlas_primitive_payload",
    )?;

    Ok(GatheredInstances {
        instances: Arc::new(instances),
        payload: Arc::new(payload),
        copies,
    })
}

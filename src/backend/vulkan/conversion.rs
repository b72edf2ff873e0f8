//! Conversions between backend types and Vulkan types.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::{BackendError, BufferUsage, InstanceDescriptor, InstanceOptions, TextureFormat, TextureUsage};

/// Convert BufferUsage flags to Vulkan buffer usage flags.
///
/// Every buffer is addressable: bindless tables and acceleration structure
/// inputs are both referenced by device address.
pub fn convert_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut result = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

    if usage.contains(BufferUsage::VERTEX) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        result |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) || usage.contains(BufferUsage::SHADER_ADDRESS) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
        result |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_SCRATCH) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }

    result
}

/// Where a buffer's memory lives.
///
/// Buffers are written from the host at creation unless they are build
/// scratch, so everything else stays host visible.
pub fn buffer_location(usage: BufferUsage) -> MemoryLocation {
    if usage.contains(BufferUsage::MAP_READ) {
        MemoryLocation::GpuToCpu
    } else if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_SCRATCH) {
        MemoryLocation::GpuOnly
    } else {
        MemoryLocation::CpuToGpu
    }
}

pub fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
    }
}

/// Convert TextureUsage flags to Vulkan image usage flags.
///
/// Images are always copy source and destination: they are cleared, blitted
/// and read back through transfer commands.
pub fn convert_texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut result = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;

    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        result |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) {
        result |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        result |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }

    result
}

pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

pub fn color_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

/// Map a Vulkan result code to a backend error.
pub fn vk_error(what: &str, result: vk::Result) -> BackendError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            BackendError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        other => BackendError::ExecutionFailed(format!("{what}: {other:?}")),
    }
}

pub fn allocation_error(what: &str, error: gpu_allocator::AllocationError) -> BackendError {
    match error {
        gpu_allocator::AllocationError::OutOfMemory => BackendError::OutOfMemory,
        other => BackendError::ResourceCreationFailed(format!("{what}: {other}")),
    }
}

/// `VkAccelerationStructureInstanceKHR` as plain data.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawInstance {
    /// Row-major 3×4
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, mask in the high 8
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawInstance>(), 64);

/// Largest value that fits the 24-bit custom index.
pub const MAX_CUSTOM_INDEX: u32 = (1 << 24) - 1;

impl RawInstance {
    pub fn new(descriptor: &InstanceDescriptor, custom_index: u32, blas_address: u64) -> Self {
        let [x, y, z, t] = descriptor.transform;
        let mut transform = [0.0; 12];
        for row in 0..3 {
            transform[row * 4] = x[row];
            transform[row * 4 + 1] = y[row];
            transform[row * 4 + 2] = z[row];
            transform[row * 4 + 3] = t[row];
        }

        let options = descriptor.options();
        let mut flags = vk::GeometryInstanceFlagsKHR::empty();
        if options.contains(InstanceOptions::OPAQUE) {
            flags |= vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE;
        }
        if options.contains(InstanceOptions::NON_OPAQUE) {
            flags |= vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE;
        }
        if options.contains(InstanceOptions::DISABLE_TRIANGLE_CULLING) {
            flags |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;
        }
        if options.contains(InstanceOptions::TRIANGLE_FRONT_FACING_WINDING_COUNTER_CLOCKWISE) {
            flags |= vk::GeometryInstanceFlagsKHR::TRIANGLE_FLIP_FACING;
        }

        Self {
            transform,
            custom_index_and_mask: (custom_index & MAX_CUSTOM_INDEX) | ((descriptor.mask & 0xFF) << 24),
            sbt_offset_and_flags: (descriptor.intersection_function_table_offset & MAX_CUSTOM_INDEX)
                | ((flags.as_raw() & 0xFF) << 24),
            acceleration_structure_reference: blas_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Affine3A, Vec3};

    #[test]
    fn instance_transform_is_row_major() {
        let transform = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let descriptor = InstanceDescriptor::new(&transform, InstanceOptions::OPAQUE, 0x04, 0);
        let raw = RawInstance::new(&descriptor, 7, 0xABCD);

        assert_eq!(raw.transform, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]);
        assert_eq!(raw.custom_index_and_mask, 7 | (0x04 << 24));
        assert_eq!(raw.sbt_offset_and_flags >> 24, vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE.as_raw());
        assert_eq!(raw.acceleration_structure_reference, 0xABCD);
    }

    #[test]
    fn scratch_buffers_are_device_local() {
        assert_eq!(
            buffer_location(BufferUsage::ACCELERATION_STRUCTURE_SCRATCH | BufferUsage::STORAGE),
            MemoryLocation::GpuOnly
        );
        assert_eq!(buffer_location(BufferUsage::MAP_READ | BufferUsage::COPY_DST), MemoryLocation::GpuToCpu);
        assert_eq!(buffer_location(BufferUsage::STORAGE), MemoryLocation::CpuToGpu);
    }
}

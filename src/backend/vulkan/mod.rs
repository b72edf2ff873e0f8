//! Vulkan backend
//!
//! Hardware ray tracing through `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_query`, driven from a compute kernel compiled from WGSL with naga.
//!
//! Per-primitive payloads are emulated: a bottom-level structure remembers the
//! payload buffer it was built with, and each top-level build gathers those
//! buffers into one storage buffer addressed through the instance custom index.

mod accel;
mod conversion;
mod device;
mod queue;
mod recorder;
mod shader;

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use self::conversion::{
    allocation_error, buffer_location, color_subresource_layers, color_subresource_range,
    convert_buffer_usage, convert_texture_format, convert_texture_usage, vk_error,
};
use self::device::{full_barrier, DeviceContext};
use self::queue::Queue;
use crate::backend::{
    AccelerationStructureDescriptor, AccelerationStructureKind, AccelerationStructureSizes,
    BackendError, BackendResult, BufferDescriptor, BufferUsage, CommandList, CompletionHandler,
    ComputePipelineDescriptor, DeviceCapabilities, DeviceLimits, GpuAccelerationStructure,
    GpuBuffer, GpuPipeline, GpuTexture, RayTracingBackend, SubmissionIndex, TextureDescriptor,
};
use crate::resources::{AccelerationStructure, Buffer, ComputePipeline, Texture};
use crate::shaders::{slot, MAX_BOUNCES, WORKGROUP_SIZE};

/// Memory-backed `VkBuffer` with its device address.
pub struct VulkanBuffer {
    context: Arc<DeviceContext>,
    raw: vk::Buffer,
    allocation: Mutex<Option<Allocation>>,
    address: u64,
    size: u64,
}

impl VulkanBuffer {
    fn new(
        context: &Arc<DeviceContext>,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        alignment: u64,
        name: &str,
    ) -> BackendResult<Self> {
        let device = &context.device;
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { device.create_buffer(&info, None) }
            .map_err(|e| vk_error("create buffer", e))?;

        let mut requirements = unsafe { device.get_buffer_memory_requirements(raw) };
        requirements.alignment = requirements.alignment.max(alignment);
        let allocation = context
            .allocator()
            .and_then(|mut allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| allocation_error(name, e))
            })
            .inspect_err(|_| unsafe { device.destroy_buffer(raw, None) })?;

        let bound = unsafe { device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) };
        if let Err(e) = bound {
            unsafe { device.destroy_buffer(raw, None) };
            if let Ok(mut allocator) = context.allocator() {
                let _ = allocator.free(allocation);
            }
            return Err(vk_error("bind buffer memory", e));
        }

        let address = unsafe {
            device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(raw))
        };

        Ok(Self {
            context: Arc::clone(context),
            raw,
            allocation: Mutex::new(Some(allocation)),
            address,
            size,
        })
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    fn check_range(&self, offset: u64, len: u64) -> BackendResult<std::ops::Range<usize>> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                BackendError::InvalidParameter(format!(
                    "access of {len} bytes at {offset} overflows buffer of {} bytes",
                    self.size
                ))
            })?;
        Ok(offset as usize..end as usize)
    }

    fn write(&self, offset: u64, data: &[u8]) -> BackendResult<()> {
        let range = self.check_range(offset, data.len() as u64)?;
        let mut allocation = self.allocation.lock();
        let mapped = allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| BackendError::InvalidParameter("buffer is not host visible".into()))?;
        mapped[range].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, len: u64) -> BackendResult<Vec<u8>> {
        let range = self.check_range(offset, len)?;
        let allocation = self.allocation.lock();
        let mapped = allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| BackendError::InvalidParameter("buffer is not host visible".into()))?;
        Ok(mapped[range].to_vec())
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_buffer(self.raw, None) };
        if let Some(allocation) = self.allocation.get_mut().take() {
            match self.context.allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        log::warn!("VulkanBackend: failed to free buffer memory: {}", e);
                    }
                }
                Err(e) => log::warn!("VulkanBackend: {}", e),
            }
        }
    }
}

/// `VkImage` kept in `GENERAL` layout, with a full-image view.
pub struct VulkanTexture {
    context: Arc<DeviceContext>,
    raw: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

impl VulkanTexture {
    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_image_view(self.view, None);
            self.context.device.destroy_image(self.raw, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Ok(mut allocator) = self.context.allocator() {
                if let Err(e) = allocator.free(allocation) {
                    log::warn!("VulkanBackend: failed to free image memory: {}", e);
                }
            }
        }
    }
}

/// Primitive payload attached to an acceleration structure.
#[derive(Clone)]
pub(crate) enum Payload {
    /// Bottom level: the buffer the structure was built with
    Primitives {
        buffer: Arc<Buffer>,
        stride: u64,
        count: u32,
    },
    /// Top level: every bottom-level payload, concatenated in index order
    Gathered(Arc<VulkanBuffer>),
}

pub struct VulkanAccelerationStructure {
    context: Arc<DeviceContext>,
    raw: vk::AccelerationStructureKHR,
    address: u64,
    payload: Mutex<Option<Payload>>,
    _storage: VulkanBuffer,
}

impl VulkanAccelerationStructure {
    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub(crate) fn payload(&self) -> Option<Payload> {
        self.payload.lock().clone()
    }

    fn set_payload(&self, payload: Option<Payload>) {
        *self.payload.lock() = payload;
    }
}

impl Drop for VulkanAccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.context
                .acceleration_structure
                .destroy_acceleration_structure(self.raw, None);
        }
    }
}

pub struct VulkanPipeline {
    context: Arc<DeviceContext>,
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
}

impl VulkanPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            let device = &self.context.device;
            device.destroy_pipeline(self.raw, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

fn foreign(what: &str) -> BackendError {
    BackendError::InvalidParameter(format!("{what} was created by another backend"))
}

fn vulkan_buffer(buffer: &Buffer) -> BackendResult<&VulkanBuffer> {
    match buffer.gpu() {
        GpuBuffer::Vulkan(buffer) => Ok(buffer),
        _ => Err(foreign("buffer")),
    }
}

fn vulkan_texture(texture: &Texture) -> BackendResult<&VulkanTexture> {
    match texture.gpu() {
        GpuTexture::Vulkan(texture) => Ok(texture),
        _ => Err(foreign("texture")),
    }
}

fn vulkan_acceleration_structure(
    structure: &AccelerationStructure,
) -> BackendResult<&VulkanAccelerationStructure> {
    match structure.gpu() {
        GpuAccelerationStructure::Vulkan(structure) => Ok(structure),
        _ => Err(foreign("acceleration structure")),
    }
}

fn vulkan_pipeline(pipeline: &ComputePipeline) -> BackendResult<&VulkanPipeline> {
    match pipeline.gpu() {
        GpuPipeline::Vulkan(pipeline) => Ok(pipeline),
        _ => Err(foreign("pipeline")),
    }
}

/// Descriptor layout of the ray-tracing kernel.
const KERNEL_BINDINGS: [(u32, vk::DescriptorType); 8] = [
    (slot::UNIFORMS, vk::DescriptorType::UNIFORM_BUFFER),
    (slot::RESOURCES, vk::DescriptorType::STORAGE_BUFFER),
    (slot::INSTANCES, vk::DescriptorType::STORAGE_BUFFER),
    (slot::LIGHTS, vk::DescriptorType::STORAGE_BUFFER),
    (slot::ACCELERATION_STRUCTURE, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
    (slot::SEEDS, vk::DescriptorType::SAMPLED_IMAGE),
    (slot::ACCUMULATION_SOURCE, vk::DescriptorType::SAMPLED_IMAGE),
    (slot::ACCUMULATION_TARGET, vk::DescriptorType::STORAGE_IMAGE),
];

/// Vulkan implementation of [`RayTracingBackend`].
pub struct VulkanBackend {
    queue: Queue,
    context: Arc<DeviceContext>,
}

impl VulkanBackend {
    pub fn new() -> BackendResult<Self> {
        log::info!("Initializing Vulkan backend");
        let context = Arc::new(DeviceContext::new()?);
        Ok(Self {
            queue: Queue::new(Arc::clone(&context))?,
            context,
        })
    }

    /// Name of the selected physical device.
    pub fn device_name(&self) -> &str {
        &self.context.properties.name
    }

    fn create_image(
        &self,
        desc: &TextureDescriptor,
    ) -> BackendResult<(vk::Image, Allocation)> {
        let device = &self.context.device;
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert_texture_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&info, None) }
            .map_err(|e| vk_error("create image", e))?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let name = desc.label.as_deref().unwrap_or("texture");
        let allocation = self
            .context
            .allocator()
            .and_then(|mut allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location: MemoryLocation::GpuOnly,
                        linear: false,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| allocation_error(name, e))
            })
            .inspect_err(|_| unsafe { device.destroy_image(image, None) })?;

        if let Err(e) = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            unsafe { device.destroy_image(image, None) };
            if let Ok(mut allocator) = self.context.allocator() {
                let _ = allocator.free(allocation);
            }
            return Err(vk_error("bind image memory", e));
        }
        Ok((image, allocation))
    }

    /// Move a fresh image to `GENERAL` and zero it.
    fn initialize_image(&self, image: vk::Image) -> BackendResult<()> {
        let device = &self.context.device;
        self.context.submit_immediate(|cmd| unsafe {
            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_subresource_range());
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
            device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::GENERAL,
                &vk::ClearColorValue { float32: [0.0; 4] },
                &[color_subresource_range()],
            );
        })
    }

    fn staging_buffer(&self, size: u64, location: MemoryLocation) -> BackendResult<VulkanBuffer> {
        VulkanBuffer::new(
            &self.context,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            location,
            16,
            "staging",
        )
    }

    fn image_copy(texture: &Texture) -> vk::BufferImageCopy {
        vk::BufferImageCopy::default()
            .image_subresource(color_subresource_layers())
            .image_extent(vk::Extent3D {
                width: texture.width(),
                height: texture.height(),
                depth: 1,
            })
    }

    fn create_set_layout(&self) -> BackendResult<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = KERNEL_BINDINGS
            .iter()
            .map(|&(binding, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        unsafe { self.context.device.create_descriptor_set_layout(&info, None) }
            .map_err(|e| vk_error("create descriptor set layout", e))
    }
}

impl RayTracingBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn limits(&self) -> DeviceLimits {
        let properties = &self.context.properties;
        DeviceLimits {
            min_uniform_buffer_offset_alignment: properties
                .min_uniform_buffer_offset_alignment
                .max(256),
            gpu_address_size: 8,
            max_texture_dimension_2d: properties.max_image_dimension_2d,
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            primitive_data_in_acceleration_structure: true,
            intersection_functions: false,
            bindless_resources: false,
            spatial_upscale: true,
            in_order_queue: true,
        }
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<Arc<Buffer>> {
        log::trace!(
            "VulkanBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        if desc.size == 0 {
            return Err(BackendError::InvalidParameter(format!(
                "buffer {:?} has zero size",
                desc.label
            )));
        }
        let alignment = if desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE_SCRATCH) {
            self.context.properties.scratch_offset_alignment
        } else {
            16
        };
        let buffer = VulkanBuffer::new(
            &self.context,
            desc.size,
            convert_buffer_usage(desc.usage),
            buffer_location(desc.usage),
            alignment,
            desc.label.as_deref().unwrap_or("buffer"),
        )?;
        Ok(Arc::new(Buffer::new(desc.clone(), GpuBuffer::Vulkan(buffer))))
    }

    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> BackendResult<()> {
        vulkan_buffer(buffer)?.write(offset, data)
    }

    fn read_buffer(&self, buffer: &Buffer, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        vulkan_buffer(buffer)?.read(offset, size)
    }

    fn buffer_address(&self, buffer: &Buffer) -> u64 {
        vulkan_buffer(buffer).map_or(0, VulkanBuffer::address)
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> BackendResult<Arc<Texture>> {
        log::trace!(
            "VulkanBackend: creating texture {:?} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let max = self.limits().max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(BackendError::InvalidParameter(format!(
                "texture size {}x{} outside 1..={max}",
                desc.width, desc.height
            )));
        }

        let (image, allocation) = self.create_image(desc)?;
        let mut texture = VulkanTexture {
            context: Arc::clone(&self.context),
            raw: image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert_texture_format(desc.format))
            .subresource_range(color_subresource_range());
        texture.view = unsafe { self.context.device.create_image_view(&view_info, None) }
            .map_err(|e| vk_error("create image view", e))?;
        self.initialize_image(image)?;

        Ok(Arc::new(Texture::new(desc.clone(), GpuTexture::Vulkan(texture))))
    }

    fn write_texture(&self, texture: &Texture, data: &[u8]) -> BackendResult<()> {
        let expected = texture.descriptor().byte_size();
        if data.len() as u64 != expected {
            return Err(BackendError::InvalidParameter(format!(
                "texture {:?} expects {expected} bytes, got {}",
                texture.label(),
                data.len()
            )));
        }
        let image = vulkan_texture(texture)?.raw();
        let staging = self.staging_buffer(expected, MemoryLocation::CpuToGpu)?;
        staging.write(0, data)?;
        let region = Self::image_copy(texture);
        let device = &self.context.device;
        self.context.submit_immediate(|cmd| unsafe {
            device.cmd_copy_buffer_to_image(cmd, staging.raw(), image, vk::ImageLayout::GENERAL, &[region]);
        })
    }

    fn read_texture(&self, texture: &Texture) -> BackendResult<Vec<u8>> {
        let size = texture.descriptor().byte_size();
        let image = vulkan_texture(texture)?.raw();
        let staging = self.staging_buffer(size, MemoryLocation::GpuToCpu)?;
        let region = Self::image_copy(texture);
        let device = &self.context.device;
        self.context.submit_immediate(|cmd| unsafe {
            device.cmd_copy_image_to_buffer(cmd, image, vk::ImageLayout::GENERAL, staging.raw(), &[region]);
            full_barrier(device, cmd);
        })?;
        staging.read(0, size)
    }

    fn acceleration_structure_sizes(
        &self,
        desc: &AccelerationStructureDescriptor,
    ) -> BackendResult<AccelerationStructureSizes> {
        let (geometry, count) = match desc {
            AccelerationStructureDescriptor::BottomLevel(geometry) => {
                accel::bottom_level_geometry(geometry)?
            }
            AccelerationStructureDescriptor::TopLevel(top) => {
                (accel::top_level_geometry(0), top.instance_count)
            }
        };
        Ok(accel::build_sizes(&self.context, desc.kind(), geometry, count))
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        size: u64,
        label: Option<&str>,
    ) -> BackendResult<Arc<AccelerationStructure>> {
        log::trace!(
            "VulkanBackend: creating {:?} acceleration structure {:?} ({} bytes)",
            kind,
            label,
            size
        );
        let storage = VulkanBuffer::new(
            &self.context,
            size.max(256),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            256,
            label.unwrap_or("acceleration_structure"),
        )?;
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.raw())
            .offset(0)
            .size(size)
            .ty(accel::convert_kind(kind));
        let acceleration_structure = &self.context.acceleration_structure;
        let raw = unsafe { acceleration_structure.create_acceleration_structure(&info, None) }
            .map_err(|e| vk_error("create acceleration structure", e))?;
        let address = unsafe {
            acceleration_structure.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(raw),
            )
        };

        let structure = VulkanAccelerationStructure {
            context: Arc::clone(&self.context),
            raw,
            address,
            payload: Mutex::new(None),
            _storage: storage,
        };
        Ok(Arc::new(AccelerationStructure::new(
            kind,
            size,
            label.map(str::to_owned),
            GpuAccelerationStructure::Vulkan(structure),
        )))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<Arc<ComputePipeline>> {
        log::trace!(
            "VulkanBackend: creating pipeline {:?} ({})",
            desc.label,
            desc.entry_point
        );
        if !desc.constants.use_primitive_data {
            return Err(BackendError::FeatureNotSupported(
                "the Vulkan kernel reads primitive payloads from the acceleration structure only"
                    .into(),
            ));
        }
        if desc.constants.use_intersection_functions || !desc.intersection_functions.is_empty() {
            return Err(BackendError::FeatureNotSupported(
                "intersection functions are not available with ray queries".into(),
            ));
        }
        if desc.workgroup_size != WORKGROUP_SIZE {
            return Err(BackendError::PipelineCreationFailed(format!(
                "kernel is compiled for {WORKGROUP_SIZE:?} workgroups, got {:?}",
                desc.workgroup_size
            )));
        }
        if desc.constants.max_bounces == 0 || desc.constants.max_bounces > MAX_BOUNCES {
            return Err(BackendError::PipelineCreationFailed(format!(
                "max bounces {} outside 1..={MAX_BOUNCES}",
                desc.constants.max_bounces
            )));
        }

        let spirv = shader::compile_kernel(desc.source, desc.entry_point, &desc.constants)?;
        let device = &self.context.device;

        let module = unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&spirv), None)
        }
        .map_err(|e| BackendError::PipelineCreationFailed(format!("shader module: {e:?}")))?;

        let set_layout = match self.create_set_layout() {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_shader_module(module, None) };
                return Err(e);
            }
        };
        let set_layouts = [set_layout];
        let layout = match unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts),
                None,
            )
        } {
            Ok(layout) => layout,
            Err(e) => unsafe {
                device.destroy_descriptor_set_layout(set_layout, None);
                device.destroy_shader_module(module, None);
                return Err(vk_error("create pipeline layout", e));
            },
        };

        let entry_point = std::ffi::CString::new(desc.entry_point).map_err(|_| {
            BackendError::PipelineCreationFailed("entry point contains a nul byte".into())
        })?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let created = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe { device.destroy_shader_module(module, None) };

        let raw = match created {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, e)) => {
                log::error!("VulkanBackend: compute pipeline creation failed: {:?}", e);
                None
            }
        };
        let Some(raw) = raw else {
            unsafe {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
            }
            return Err(BackendError::PipelineCreationFailed(format!(
                "compute pipeline {:?}",
                desc.label
            )));
        };

        let pipeline = VulkanPipeline {
            context: Arc::clone(&self.context),
            raw,
            layout,
            set_layout,
        };
        Ok(Arc::new(ComputePipeline::new(
            desc.label.clone(),
            desc.entry_point,
            desc.workgroup_size,
            desc.constants,
            desc.intersection_functions.clone(),
            GpuPipeline::Vulkan(pipeline),
        )))
    }

    fn submit(
        &self,
        commands: CommandList,
        on_complete: Option<CompletionHandler>,
    ) -> BackendResult<SubmissionIndex> {
        self.queue.submit(commands, on_complete)
    }

    fn wait(&self, submission: SubmissionIndex) -> BackendResult<()> {
        self.queue.wait(submission)
    }

    fn wait_idle(&self) -> BackendResult<()> {
        self.queue.wait_idle()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.queue.wait_idle() {
            log::warn!("VulkanBackend: device was lost before shutdown: {}", e);
        }
    }
}

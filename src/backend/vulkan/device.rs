//! Vulkan instance, device selection and the shared device context.

use std::ffi::{CStr, CString};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};

use super::conversion::vk_error;
use crate::backend::{BackendError, BackendResult};

/// Ray queries and buffer device addresses are core from Vulkan 1.2 plus extensions.
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_query::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Descriptor sets the shared pool can hand out at once.
const MAX_DESCRIPTOR_SETS: u32 = 256;

/// Properties read once at device creation.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    pub max_image_dimension_2d: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub scratch_offset_alignment: u64,
    /// Nanoseconds per timestamp tick, `None` when the queue has no timestamps
    pub timestamp_period: Option<f32>,
    /// `Rgba32Float` supports linear filtering in blits
    pub linear_float_blit: bool,
}

/// Everything resources need to destroy themselves.
///
/// Resources hold an `Arc` to the context, so the device outlives every
/// buffer, image and acceleration structure created on it.
pub struct DeviceContext {
    _entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    pub queue: Mutex<vk::Queue>,
    pub queue_family: u32,
    pub properties: DeviceProperties,
    allocator: Option<Mutex<Allocator>>,
    command_pool: Mutex<vk::CommandPool>,
    descriptor_pool: Mutex<vk::DescriptorPool>,
}

impl DeviceContext {
    pub fn new() -> BackendResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BackendError::InitializationFailed(format!("Vulkan loader: {e}")))?;
        let instance = create_instance(&entry)?;

        let (physical_device, queue_family) = match select_physical_device(&instance) {
            Ok(selected) => selected,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let device = match create_logical_device(&instance, physical_device, queue_family) {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let properties = read_properties(&instance, physical_device, queue_family);
        log::info!("Vulkan device: {}", properties.name);

        let acceleration_structure = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create memory allocator: {e}"))
        })?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| vk_error("create command pool", e))?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: MAX_DESCRIPTOR_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: MAX_DESCRIPTOR_SETS * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: MAX_DESCRIPTOR_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: MAX_DESCRIPTOR_SETS * 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: MAX_DESCRIPTOR_SETS,
            },
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(MAX_DESCRIPTOR_SETS)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&descriptor_pool_info, None) }
            .map_err(|e| vk_error("create descriptor pool", e))?;

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            acceleration_structure,
            queue: Mutex::new(queue),
            queue_family,
            properties,
            allocator: Some(Mutex::new(allocator)),
            command_pool: Mutex::new(command_pool),
            descriptor_pool: Mutex::new(descriptor_pool),
        })
    }

    pub fn allocator(&self) -> BackendResult<MutexGuard<'_, Allocator>> {
        self.allocator
            .as_ref()
            .map(Mutex::lock)
            .ok_or_else(|| BackendError::ResourceCreationFailed("Allocator not available".into()))
    }

    pub fn allocate_command_buffer(&self) -> BackendResult<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| vk_error("allocate command buffer", e))?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::ExecutionFailed("no command buffer allocated".into()))
    }

    pub fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe { self.device.free_command_buffers(*pool, &[command_buffer]) };
    }

    pub fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> BackendResult<vk::DescriptorSet> {
        let pool = self.descriptor_pool.lock();
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(|e| vk_error("allocate descriptor set", e))?;
        sets.into_iter()
            .next()
            .ok_or_else(|| BackendError::ExecutionFailed("no descriptor set allocated".into()))
    }

    pub fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) {
        if sets.is_empty() {
            return;
        }
        let pool = self.descriptor_pool.lock();
        if let Err(e) = unsafe { self.device.free_descriptor_sets(*pool, sets) } {
            log::warn!("VulkanBackend: failed to free descriptor sets: {:?}", e);
        }
    }

    /// Record, submit and wait for a one-off command buffer.
    pub fn submit_immediate(&self, record: impl FnOnce(vk::CommandBuffer)) -> BackendResult<()> {
        let command_buffer = self.allocate_command_buffer()?;
        let result = self.run_immediate(command_buffer, record);
        self.free_command_buffer(command_buffer);
        result
    }

    fn run_immediate(
        &self,
        command_buffer: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> BackendResult<()> {
        let device = &self.device;
        unsafe {
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(command_buffer, &begin)
                .map_err(|e| vk_error("begin command buffer", e))?;
            full_barrier(device, command_buffer);
            record(command_buffer);
            device
                .end_command_buffer(command_buffer)
                .map_err(|e| vk_error("end command buffer", e))?;

            let fence = device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| vk_error("create fence", e))?;
            let command_buffers = [command_buffer];
            let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
            let submitted = {
                let queue = self.queue.lock();
                device.queue_submit(*queue, &[submit], fence)
            };
            let result = submitted
                .and_then(|()| device.wait_for_fences(&[fence], true, u64::MAX))
                .map_err(|e| vk_error("immediate submission", e));
            device.destroy_fence(fence, None);
            result
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device
                .destroy_descriptor_pool(*self.descriptor_pool.get_mut(), None);
            self.device
                .destroy_command_pool(*self.command_pool.get_mut(), None);
            // The allocator frees its memory blocks on drop and must go before the device.
            drop(self.allocator.take());
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Make every earlier write visible to every later access.
///
/// Command lists are executed strictly in order, so one global barrier between
/// commands is the whole synchronization story.
pub fn full_barrier(device: &ash::Device, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

fn create_instance(entry: &ash::Entry) -> BackendResult<ash::Instance> {
    let app_name = CString::new("progressive-rt")
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    #[allow(unused_mut)]
    let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions);

    unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })
}

fn supports_ray_queries(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let Ok(available) = (unsafe { instance.enumerate_device_extension_properties(device) }) else {
        return false;
    };
    REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
        available
            .iter()
            .any(|extension| extension.extension_name_as_c_str() == Ok(*required))
    })
}

fn find_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
}

/// Pick the best device with ray-query support, preferring discrete GPUs.
fn select_physical_device(instance: &ash::Instance) -> BackendResult<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to enumerate physical devices: {:?}", e))
    })?;

    let mut best = None;
    let mut best_score = 0;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !supports_ray_queries(instance, device) {
            log::info!("Skipping GPU {name}: no ray query support");
            continue;
        }
        let Some(queue_family) = find_queue_family(instance, device) else {
            continue;
        };

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        log::info!(
            "Found GPU: {} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );
        if score > best_score {
            best_score = score;
            best = Some((device, queue_family));
        }
    }

    best.ok_or_else(|| {
        BackendError::InitializationFailed("No GPU with ray query support found".to_string())
    })
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> BackendResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities)];

    let extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .map(|name| name.as_ptr())
        .collect();

    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .host_query_reset(true);
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut vulkan_12_features)
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_query_features);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

fn read_properties(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> DeviceProperties {
    let mut acceleration_structure =
        vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut properties2 =
        vk::PhysicalDeviceProperties2::default().push_next(&mut acceleration_structure);
    unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
    let properties = properties2.properties;

    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let timestamps = families
        .get(queue_family as usize)
        .is_some_and(|family| family.timestamp_valid_bits > 0);

    let float_features = unsafe {
        instance.get_physical_device_format_properties(
            physical_device,
            vk::Format::R32G32B32A32_SFLOAT,
        )
    };

    DeviceProperties {
        name: properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        max_image_dimension_2d: properties.limits.max_image_dimension2_d,
        min_uniform_buffer_offset_alignment: properties.limits.min_uniform_buffer_offset_alignment,
        scratch_offset_alignment: u64::from(
            acceleration_structure.min_acceleration_structure_scratch_offset_alignment,
        ),
        timestamp_period: timestamps.then_some(properties.limits.timestamp_period),
        linear_float_blit: float_features
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR),
    }
}

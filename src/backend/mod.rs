//! Backend abstraction layer
//!
//! Provides the [`RayTracingBackend`] trait both devices implement, the shared
//! descriptor types, and the per-backend resource handles.
//!
//! # Available Backends
//!
//! - `software` (always built): CPU device with an in-order queue thread
//! - `vulkan` (feature `vulkan-backend`): `VK_KHR_acceleration_structure` + `VK_KHR_ray_query` via ash

pub mod command;
pub mod software;
pub mod traits;
pub mod types;

#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
pub mod vulkan;

use std::sync::Arc;

pub use command::*;
pub use traits::*;
pub use types::*;

use crate::BackendType;

/// Handle to a GPU buffer resource.
pub enum GpuBuffer {
    Software(software::SoftwareBuffer),
    #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
    Vulkan(vulkan::VulkanBuffer),
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(buffer) => f
                .debug_struct("GpuBuffer::Software")
                .field("address", &buffer.address())
                .finish_non_exhaustive(),
            #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
            Self::Vulkan(buffer) => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", &buffer.raw())
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU texture resource.
pub enum GpuTexture {
    Software(software::SoftwareTexture),
    #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
    Vulkan(vulkan::VulkanTexture),
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(_) => write!(f, "GpuTexture::Software"),
            #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
            Self::Vulkan(texture) => f
                .debug_struct("GpuTexture::Vulkan")
                .field("image", &texture.raw())
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU acceleration structure.
pub enum GpuAccelerationStructure {
    Software(software::SoftwareAccelerationStructure),
    #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
    Vulkan(vulkan::VulkanAccelerationStructure),
}

impl std::fmt::Debug for GpuAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(structure) => f
                .debug_struct("GpuAccelerationStructure::Software")
                .field("built", &structure.is_built())
                .finish(),
            #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
            Self::Vulkan(structure) => f
                .debug_struct("GpuAccelerationStructure::Vulkan")
                .field("handle", &structure.raw())
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a compiled compute pipeline.
pub enum GpuPipeline {
    Software(software::SoftwarePipeline),
    #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
    Vulkan(vulkan::VulkanPipeline),
}

impl std::fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(pipeline) => f
                .debug_tuple("GpuPipeline::Software")
                .field(&pipeline.kernel_name())
                .finish(),
            #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
            Self::Vulkan(pipeline) => f
                .debug_struct("GpuPipeline::Vulkan")
                .field("pipeline", &pipeline.raw())
                .finish_non_exhaustive(),
        }
    }
}

/// Creates the requested backend, falling back to the software device when it is
/// unavailable.
pub fn create_backend(backend: BackendType) -> BackendResult<Arc<dyn RayTracingBackend>> {
    match backend {
        BackendType::Vulkan => {
            #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
            {
                match vulkan::VulkanBackend::new() {
                    Ok(backend) => {
                        log::info!("Using Vulkan backend (ash)");
                        return Ok(Arc::new(backend));
                    }
                    Err(e) => {
                        log::warn!("Failed to create Vulkan backend: {}", e);
                    }
                }
            }
            #[cfg(not(all(feature = "vulkan-backend", not(target_arch = "wasm32"))))]
            log::warn!("Vulkan backend requested but not compiled in");
        }
        BackendType::Software => {}
    }

    log::info!("Using software backend");
    Ok(Arc::new(software::SoftwareBackend::new()?))
}

/// Check if a hardware backend was compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(all(feature = "vulkan-backend", not(target_arch = "wasm32")))
}

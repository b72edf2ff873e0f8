//! Software backend
//!
//! A CPU device that executes the same command lists as the Vulkan backend:
//! - buffers and textures live in host memory, buffers get synthetic device
//!   addresses so bindless tables work unchanged
//! - acceleration structures are real BVHs with observable compaction
//! - the ray-tracing kernel is a CPU port run with rayon
//! - command lists execute on one queue thread, strictly in submission order
//!
//! An optional memory budget makes allocation failure reproducible in tests.

mod accel;
mod bvh;
mod image_ops;
mod kernel;
mod memory;
mod queue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::{Vec3, Vec3A};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use accel::RayHit;

use self::accel::{BottomLevel, Built, BuiltinIntersector, TopLevel};
use self::bvh::Ray;
use self::memory::{MemoryBudget, Reservation};
use self::queue::Queue;
use crate::backend::{
    AccelerationStructureDescriptor, AccelerationStructureKind, AccelerationStructureSizes,
    BackendError, BackendResult, BufferDescriptor, Command, CommandList, CompletionHandler,
    ComputePipelineDescriptor, DeviceCapabilities, DeviceLimits, GpuAccelerationStructure,
    GpuBuffer, GpuPipeline, GpuTexture, RayTracingBackend, SubmissionIndex, TextureDescriptor,
};
use crate::resources::{AccelerationStructure, Buffer, ComputePipeline, Texture};
use crate::shaders::{MAX_BOUNCES, RAYTRACING_ENTRY_POINT};

/// First synthetic device address handed out.
const ADDRESS_BASE: u64 = 0x1000_0000;
/// Alignment of, and guard gap between, synthetic buffer addresses.
const ADDRESS_ALIGNMENT: u64 = 256;

/// Host-memory buffer with a synthetic device address.
pub struct SoftwareBuffer {
    address: u64,
    data: RwLock<Vec<u8>>,
    _reservation: Reservation,
}

impl SoftwareBuffer {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

/// Texels stored as 32-bit words; float formats are bit-cast.
pub struct SoftwareTexture {
    words: RwLock<Vec<u32>>,
    _reservation: Reservation,
}

impl SoftwareTexture {
    pub(crate) fn words(&self) -> RwLockReadGuard<'_, Vec<u32>> {
        self.words.read()
    }

    pub(crate) fn words_mut(&self) -> RwLockWriteGuard<'_, Vec<u32>> {
        self.words.write()
    }
}

pub struct SoftwareAccelerationStructure {
    contents: RwLock<Option<Built>>,
    _reservation: Reservation,
}

impl SoftwareAccelerationStructure {
    pub fn is_built(&self) -> bool {
        self.contents.read().is_some()
    }

    pub(crate) fn contents(&self) -> Option<Built> {
        self.contents.read().clone()
    }

    fn store(&self, built: Built) {
        *self.contents.write() = Some(built);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kernel {
    RayTracing,
}

pub struct SoftwarePipeline {
    kernel: Kernel,
}

impl SoftwarePipeline {
    pub fn kernel_name(&self) -> &'static str {
        match self.kernel {
            Kernel::RayTracing => RAYTRACING_ENTRY_POINT,
        }
    }
}

#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
fn foreign(what: &str) -> BackendError {
    BackendError::InvalidParameter(format!("{what} was created by another backend"))
}

pub(crate) fn software_buffer(buffer: &Buffer) -> BackendResult<&SoftwareBuffer> {
    match buffer.gpu() {
        GpuBuffer::Software(buffer) => Ok(buffer),
        #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
        _ => Err(foreign("buffer")),
    }
}

pub(crate) fn software_texture(texture: &Texture) -> BackendResult<&SoftwareTexture> {
    match texture.gpu() {
        GpuTexture::Software(texture) => Ok(texture),
        #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
        _ => Err(foreign("texture")),
    }
}

pub(crate) fn software_acceleration_structure(
    structure: &AccelerationStructure,
) -> BackendResult<&SoftwareAccelerationStructure> {
    match structure.gpu() {
        GpuAccelerationStructure::Software(structure) => Ok(structure),
        #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
        _ => Err(foreign("acceleration structure")),
    }
}

fn software_pipeline(pipeline: &ComputePipeline) -> BackendResult<&SoftwarePipeline> {
    match pipeline.gpu() {
        GpuPipeline::Software(pipeline) => Ok(pipeline),
        #[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
        _ => Err(foreign("pipeline")),
    }
}

fn built(structure: &AccelerationStructure, command: &str) -> BackendResult<Built> {
    software_acceleration_structure(structure)?
        .contents()
        .ok_or_else(|| {
            BackendError::ExecutionFailed(format!(
                "{command}: source acceleration structure {:?} is not built",
                structure.label()
            ))
        })
}

fn execute_command(command: &Command) -> BackendResult<()> {
    match command {
        Command::BuildAccelerationStructure {
            descriptor,
            scratch,
            destination,
        } => {
            if destination.kind() != descriptor.kind() {
                return Err(BackendError::ExecutionFailed(format!(
                    "building a {:?} structure into {:?} storage",
                    descriptor.kind(),
                    destination.kind()
                )));
            }
            let sizes = accel::estimate_sizes(descriptor)?;
            if scratch.size() < sizes.build_scratch_size {
                return Err(BackendError::ExecutionFailed(format!(
                    "scratch buffer of {} bytes, build needs {}",
                    scratch.size(),
                    sizes.build_scratch_size
                )));
            }
            let built = match descriptor {
                AccelerationStructureDescriptor::BottomLevel(geometry) => {
                    Built::Bottom(Arc::new(BottomLevel::build(geometry)?))
                }
                AccelerationStructureDescriptor::TopLevel(top) => {
                    Built::Top(Arc::new(TopLevel::build(top)?))
                }
            };
            if built.footprint() > destination.size() {
                return Err(BackendError::ExecutionFailed(format!(
                    "acceleration structure needs {} bytes, storage holds {}",
                    built.footprint(),
                    destination.size()
                )));
            }
            log::trace!(
                "SoftwareBackend: built {:?} {:?} ({} bytes)",
                descriptor.kind(),
                destination.label(),
                built.footprint()
            );
            software_acceleration_structure(destination)?.store(built);
        }
        Command::WriteCompactedSize {
            source,
            buffer,
            offset,
        } => {
            let footprint = built(source, "write_compacted_size")?.footprint();
            let mut data = software_buffer(buffer)?.write();
            let start = *offset as usize;
            let slot = data.get_mut(start..start + 8).ok_or_else(|| {
                BackendError::ExecutionFailed(format!(
                    "compacted size at offset {offset} past end of buffer"
                ))
            })?;
            slot.copy_from_slice(&footprint.to_le_bytes());
        }
        Command::CopyAndCompact {
            source,
            destination,
        } => {
            let built = built(source, "copy_and_compact")?;
            if source.kind() != destination.kind() {
                return Err(BackendError::ExecutionFailed(
                    "copy_and_compact between different structure kinds".into(),
                ));
            }
            if destination.size() < built.footprint() {
                return Err(BackendError::ExecutionFailed(format!(
                    "compacted structure needs {} bytes, destination holds {}",
                    built.footprint(),
                    destination.size()
                )));
            }
            software_acceleration_structure(destination)?.store(built);
        }
        Command::ClearTexture(texture) => image_ops::clear(texture)?,
        Command::Dispatch(dispatch) => match software_pipeline(&dispatch.pipeline)?.kernel {
            Kernel::RayTracing => kernel::raytrace(dispatch, *dispatch.pipeline.constants())?,
        },
        Command::Upscale {
            source,
            destination,
        } => image_ops::upscale(source, destination)?,
        Command::Blit {
            source,
            destination,
        } => image_ops::blit(source, destination)?,
    }
    Ok(())
}

fn execute(list: &CommandList) -> BackendResult<()> {
    for command in list.commands() {
        log::trace!("SoftwareBackend: {} ({:?})", command.name(), list.label());
        execute_command(command)?;
    }
    Ok(())
}

/// CPU implementation of [`RayTracingBackend`].
pub struct SoftwareBackend {
    budget: Arc<MemoryBudget>,
    next_address: AtomicU64,
    capabilities: DeviceCapabilities,
    queue: Queue,
}

/// Everything the CPU device can do.
const SOFTWARE_CAPABILITIES: DeviceCapabilities = DeviceCapabilities {
    primitive_data_in_acceleration_structure: true,
    intersection_functions: true,
    bindless_resources: true,
    spatial_upscale: true,
    in_order_queue: true,
};

impl SoftwareBackend {
    pub fn new() -> BackendResult<Self> {
        Self::with_budget(MemoryBudget::unlimited())
    }

    /// A device whose live resources may not exceed `bytes`.
    pub fn with_memory_budget(bytes: u64) -> BackendResult<Self> {
        Self::with_budget(MemoryBudget::limited(bytes))
    }

    fn with_budget(budget: Arc<MemoryBudget>) -> BackendResult<Self> {
        log::info!("Initializing software backend");
        Ok(Self {
            budget,
            next_address: AtomicU64::new(ADDRESS_BASE),
            capabilities: SOFTWARE_CAPABILITIES,
            queue: Queue::new(Box::new(execute))?,
        })
    }

    /// Report `capabilities` instead of the full CPU feature set, to stand in
    /// for a more limited GPU.
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Bytes held by live resources.
    pub fn memory_in_use(&self) -> u64 {
        self.budget.used()
    }

    /// Trace one ray against a built top-level structure on the calling thread.
    ///
    /// Procedural geometry is tested with its own intersection function when
    /// primitive data is embedded, and against its bounding boxes otherwise.
    pub fn intersect(
        &self,
        tlas: &AccelerationStructure,
        origin: Vec3,
        direction: Vec3,
        mask: u32,
    ) -> BackendResult<Option<RayHit>> {
        let top = match software_acceleration_structure(tlas)?.contents() {
            Some(Built::Top(top)) => top,
            Some(Built::Bottom(_)) => {
                return Err(BackendError::InvalidParameter(
                    "intersect expects a top-level structure".into(),
                ))
            }
            None => {
                return Err(BackendError::InvalidParameter(
                    "top-level structure is not built".into(),
                ))
            }
        };
        let ray = Ray::new(
            Vec3A::from(origin),
            Vec3A::from(direction),
            0.0,
            f32::INFINITY,
        );
        Ok(top.trace(&ray, mask, false, &BuiltinIntersector))
    }
}

impl RayTracingBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "Software"
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits::default()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<Arc<Buffer>> {
        log::trace!(
            "SoftwareBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        if desc.size == 0 {
            return Err(BackendError::InvalidParameter(format!(
                "buffer {:?} has zero size",
                desc.label
            )));
        }
        let reservation = self.budget.reserve(desc.size)?;
        let span = desc.size.div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT + ADDRESS_ALIGNMENT;
        let address = self.next_address.fetch_add(span, Ordering::Relaxed);
        let buffer = SoftwareBuffer {
            address,
            data: RwLock::new(vec![0; desc.size as usize]),
            _reservation: reservation,
        };
        Ok(Arc::new(Buffer::new(desc.clone(), GpuBuffer::Software(buffer))))
    }

    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> BackendResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= buffer.size())
            .ok_or_else(|| {
                BackendError::InvalidParameter(format!(
                    "write of {} bytes at {} overflows buffer {:?} of {} bytes",
                    data.len(),
                    offset,
                    buffer.label(),
                    buffer.size()
                ))
            })?;
        software_buffer(buffer)?.write()[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &Buffer, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= buffer.size())
            .ok_or_else(|| {
                BackendError::InvalidParameter(format!(
                    "read of {size} bytes at {offset} overflows buffer of {} bytes",
                    buffer.size()
                ))
            })?;
        Ok(software_buffer(buffer)?.read()[offset as usize..end as usize].to_vec())
    }

    fn buffer_address(&self, buffer: &Buffer) -> u64 {
        software_buffer(buffer).map_or(0, SoftwareBuffer::address)
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> BackendResult<Arc<Texture>> {
        log::trace!(
            "SoftwareBackend: creating texture {:?} ({}x{} {:?})",
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
        let bytes = desc.byte_size();
        let reservation = self.budget.reserve(bytes)?;
        let texture = SoftwareTexture {
            words: RwLock::new(vec![0; (bytes / 4) as usize]),
            _reservation: reservation,
        };
        Ok(Arc::new(Texture::new(desc.clone(), GpuTexture::Software(texture))))
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
        let mut words = software_texture(texture)?.words_mut();
        bytemuck::cast_slice_mut::<u32, u8>(&mut words[..]).copy_from_slice(data);
        Ok(())
    }

    fn read_texture(&self, texture: &Texture) -> BackendResult<Vec<u8>> {
        let words = software_texture(texture)?.words();
        Ok(bytemuck::cast_slice::<u32, u8>(&words[..]).to_vec())
    }

    fn acceleration_structure_sizes(
        &self,
        desc: &AccelerationStructureDescriptor,
    ) -> BackendResult<AccelerationStructureSizes> {
        accel::estimate_sizes(desc)
    }

    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        size: u64,
        label: Option<&str>,
    ) -> BackendResult<Arc<AccelerationStructure>> {
        log::trace!(
            "SoftwareBackend: creating {:?} acceleration structure {:?} ({} bytes)",
            kind,
            label,
            size
        );
        let reservation = self.budget.reserve(size)?;
        let structure = SoftwareAccelerationStructure {
            contents: RwLock::new(None),
            _reservation: reservation,
        };
        Ok(Arc::new(AccelerationStructure::new(
            kind,
            size,
            label.map(str::to_owned),
            GpuAccelerationStructure::Software(structure),
        )))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<Arc<ComputePipeline>> {
        log::trace!(
            "SoftwareBackend: creating pipeline {:?} ({})",
            desc.label,
            desc.entry_point
        );
        let kernel = match desc.entry_point {
            RAYTRACING_ENTRY_POINT => Kernel::RayTracing,
            other => {
                return Err(BackendError::PipelineCreationFailed(format!(
                    "no kernel named `{other}`"
                )))
            }
        };
        if desc.workgroup_size.contains(&0) {
            return Err(BackendError::PipelineCreationFailed(
                "workgroup size must be non-zero".into(),
            ));
        }
        if desc.constants.max_bounces == 0 || desc.constants.max_bounces > MAX_BOUNCES {
            return Err(BackendError::PipelineCreationFailed(format!(
                "max bounces {} outside 1..={MAX_BOUNCES}",
                desc.constants.max_bounces
            )));
        }
        Ok(Arc::new(ComputePipeline::new(
            desc.label.clone(),
            desc.entry_point,
            desc.workgroup_size,
            desc.constants,
            desc.intersection_functions.clone(),
            GpuPipeline::Software(SoftwarePipeline { kernel }),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferUsage, TextureFormat, TextureUsage};

    #[test]
    fn buffers_get_distinct_aligned_addresses() {
        let backend = SoftwareBackend::new().unwrap();
        let desc = BufferDescriptor::new(100, BufferUsage::STORAGE | BufferUsage::SHADER_ADDRESS);
        let a = backend.create_buffer(&desc).unwrap();
        let b = backend.create_buffer(&desc).unwrap();

        let (a, b) = (backend.buffer_address(&a), backend.buffer_address(&b));
        assert_eq!(a % ADDRESS_ALIGNMENT, 0);
        assert_eq!(b % ADDRESS_ALIGNMENT, 0);
        assert!(b >= a + 100);
    }

    #[test]
    fn buffer_write_read() {
        let backend = SoftwareBackend::new().unwrap();
        let buffer = backend
            .create_buffer_init(
                &BufferDescriptor::new(8, BufferUsage::MAP_READ),
                &[1, 2, 3, 4],
            )
            .unwrap();
        backend.write_buffer(&buffer, 4, &[9, 9]).unwrap();
        assert_eq!(
            backend.read_buffer(&buffer, 0, 8).unwrap(),
            vec![1, 2, 3, 4, 9, 9, 0, 0]
        );
        assert!(backend.write_buffer(&buffer, 7, &[1, 2]).is_err());
    }

    #[test]
    fn budget_is_enforced_and_released() {
        let backend = SoftwareBackend::with_memory_budget(1024).unwrap();
        let desc = BufferDescriptor::new(800, BufferUsage::STORAGE);
        let first = backend.create_buffer(&desc).unwrap();
        assert_eq!(
            backend.create_buffer(&desc).unwrap_err(),
            BackendError::OutOfMemory
        );
        drop(first);
        assert_eq!(backend.memory_in_use(), 0);
        assert!(backend.create_buffer(&desc).is_ok());
    }

    #[test]
    fn texture_round_trip() {
        let backend = SoftwareBackend::new().unwrap();
        let texture = backend
            .create_texture(&TextureDescriptor::new_2d(
                2,
                1,
                TextureFormat::Rgba8Unorm,
                TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
            ))
            .unwrap();
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        backend.write_texture(&texture, &data).unwrap();
        assert_eq!(backend.read_texture(&texture).unwrap(), data.to_vec());
        assert!(backend.write_texture(&texture, &data[..4]).is_err());
    }

    #[test]
    fn unknown_kernel_is_rejected() {
        let backend = SoftwareBackend::new().unwrap();
        let desc = ComputePipelineDescriptor {
            label: None,
            source: "",
            entry_point: "missing",
            workgroup_size: [8, 8],
            constants: crate::backend::KernelConstants {
                resources_stride: 8,
                use_intersection_functions: false,
                use_primitive_data: true,
                max_bounces: 3,
            },
            intersection_functions: Vec::new(),
        };
        assert!(matches!(
            backend.create_compute_pipeline(&desc),
            Err(BackendError::PipelineCreationFailed(_))
        ));
    }
}

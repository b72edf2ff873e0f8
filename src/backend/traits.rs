//! Core backend abstraction traits
//!
//! These traits define the interface that both the software and Vulkan devices implement.

use std::sync::Arc;
use thiserror::Error;

use crate::backend::command::{CommandList, CompletionHandler};
use crate::backend::types::*;
use crate::resources::{AccelerationStructure, Buffer, ComputePipeline, Texture};

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Position of a command list in its device's submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionIndex(pub(crate) u64);

impl SubmissionIndex {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// GPU device used by the renderer.
///
/// Resource creation is synchronous. Command lists run asynchronously and in
/// submission order; completion is observed through the handler passed to
/// [`submit`](RayTracingBackend::submit) or by blocking in [`wait`](RayTracingBackend::wait).
pub trait RayTracingBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    fn limits(&self) -> DeviceLimits;

    fn capabilities(&self) -> DeviceCapabilities;

    // Resource creation

    /// Create a buffer
    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<Arc<Buffer>>;

    /// Create a buffer with initial data
    fn create_buffer_init(&self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<Arc<Buffer>> {
        if data.len() as u64 > desc.size {
            return Err(BackendError::InvalidParameter(format!(
                "{} bytes of initial data for a {} byte buffer",
                data.len(),
                desc.size
            )));
        }
        let buffer = self.create_buffer(desc)?;
        self.write_buffer(&buffer, 0, data)?;
        Ok(buffer)
    }

    /// Write data to a host-visible buffer
    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Read back buffer contents
    fn read_buffer(&self, buffer: &Buffer, offset: u64, size: u64) -> BackendResult<Vec<u8>>;

    /// GPU virtual address of the first byte of `buffer`, as stored in bindless tables
    fn buffer_address(&self, buffer: &Buffer) -> u64;

    /// Create a texture
    fn create_texture(&self, desc: &TextureDescriptor) -> BackendResult<Arc<Texture>>;

    /// Replace the whole texture contents; `data` is tightly packed rows
    fn write_texture(&self, texture: &Texture, data: &[u8]) -> BackendResult<()>;

    /// Read the whole texture as tightly packed rows
    fn read_texture(&self, texture: &Texture) -> BackendResult<Vec<u8>>;

    // Acceleration structures

    /// Conservative storage and scratch sizes for building `desc`
    fn acceleration_structure_sizes(
        &self,
        desc: &AccelerationStructureDescriptor,
    ) -> BackendResult<AccelerationStructureSizes>;

    /// Allocate an empty acceleration structure of `size` bytes
    fn create_acceleration_structure(
        &self,
        kind: AccelerationStructureKind,
        size: u64,
        label: Option<&str>,
    ) -> BackendResult<Arc<AccelerationStructure>>;

    // Pipelines

    /// Create a specialized compute pipeline
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<Arc<ComputePipeline>>;

    // Command execution

    /// Queue a command list. Returns immediately; `on_complete` runs once the
    /// device has finished (or failed) the list.
    fn submit(
        &self,
        commands: CommandList,
        on_complete: Option<CompletionHandler>,
    ) -> BackendResult<SubmissionIndex>;

    /// Block until `submission` has retired, returning its execution error if any
    fn wait(&self, submission: SubmissionIndex) -> BackendResult<()>;

    /// Block until every submitted command list has retired
    fn wait_idle(&self) -> BackendResult<()>;
}

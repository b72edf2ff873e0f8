//! GPU buffer resource.

use crate::backend::{BufferDescriptor, BufferUsage, GpuBuffer};

/// A GPU buffer resource.
///
/// Buffers are created through [`RayTracingBackend::create_buffer`](crate::backend::RayTracingBackend::create_buffer).
pub struct Buffer {
    descriptor: BufferDescriptor,
    gpu: GpuBuffer,
}

impl Buffer {
    /// Create a new buffer (called by backends).
    pub(crate) fn new(descriptor: BufferDescriptor, gpu: GpuBuffer) -> Self {
        Self { descriptor, gpu }
    }

    /// Get the buffer descriptor.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.descriptor.usage
    }

    /// Get the buffer label, if set.
    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    pub(crate) fn gpu(&self) -> &GpuBuffer {
        &self.gpu
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.descriptor.size)
            .field("usage", &self.descriptor.usage)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

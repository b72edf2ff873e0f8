//! GPU texture resource.

use crate::backend::{GpuTexture, TextureDescriptor, TextureFormat};

/// A two-dimensional GPU texture.
pub struct Texture {
    descriptor: TextureDescriptor,
    gpu: GpuTexture,
}

impl Texture {
    pub(crate) fn new(descriptor: TextureDescriptor, gpu: GpuTexture) -> Self {
        Self { descriptor, gpu }
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    pub fn width(&self) -> u32 {
        self.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.descriptor.height
    }

    /// Width and height in texels.
    pub fn size(&self) -> (u32, u32) {
        (self.descriptor.width, self.descriptor.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.descriptor.format
    }

    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    pub(crate) fn gpu(&self) -> &GpuTexture {
        &self.gpu
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("width", &self.descriptor.width)
            .field("height", &self.descriptor.height)
            .field("format", &self.descriptor.format)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

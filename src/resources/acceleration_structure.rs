//! Acceleration structure resource.

use crate::backend::{AccelerationStructureKind, GpuAccelerationStructure};

/// Opaque bottom- or top-level acceleration structure plus its allocated size.
pub struct AccelerationStructure {
    kind: AccelerationStructureKind,
    size: u64,
    label: Option<String>,
    gpu: GpuAccelerationStructure,
}

impl AccelerationStructure {
    pub(crate) fn new(
        kind: AccelerationStructureKind,
        size: u64,
        label: Option<String>,
        gpu: GpuAccelerationStructure,
    ) -> Self {
        Self {
            kind,
            size,
            label,
            gpu,
        }
    }

    pub fn kind(&self) -> AccelerationStructureKind {
        self.kind
    }

    /// Allocated storage in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn gpu(&self) -> &GpuAccelerationStructure {
        &self.gpu
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("label", &self.label)
            .finish()
    }
}

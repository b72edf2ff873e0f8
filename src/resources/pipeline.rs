//! Compute pipeline resource.

use crate::backend::{GpuPipeline, IntersectionFunction, KernelConstants};

/// A compute pipeline specialized with [`KernelConstants`] at creation.
pub struct ComputePipeline {
    label: Option<String>,
    entry_point: &'static str,
    workgroup_size: [u32; 2],
    constants: KernelConstants,
    intersection_functions: Vec<IntersectionFunction>,
    gpu: GpuPipeline,
}

impl ComputePipeline {
    pub(crate) fn new(
        label: Option<String>,
        entry_point: &'static str,
        workgroup_size: [u32; 2],
        constants: KernelConstants,
        intersection_functions: Vec<IntersectionFunction>,
        gpu: GpuPipeline,
    ) -> Self {
        Self {
            label,
            entry_point,
            workgroup_size,
            constants,
            intersection_functions,
            gpu,
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn entry_point(&self) -> &'static str {
        self.entry_point
    }

    pub fn workgroup_size(&self) -> [u32; 2] {
        self.workgroup_size
    }

    pub fn constants(&self) -> &KernelConstants {
        &self.constants
    }

    /// Functions linked into the pipeline.
    pub fn intersection_functions(&self) -> &[IntersectionFunction] {
        &self.intersection_functions
    }

    pub(crate) fn gpu(&self) -> &GpuPipeline {
        &self.gpu
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("label", &self.label)
            .field("entry_point", &self.entry_point)
            .field("constants", &self.constants)
            .finish_non_exhaustive()
    }
}

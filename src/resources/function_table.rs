//! Intersection function table.

use std::sync::Arc;

use crate::backend::{
    BackendError, BackendResult, BufferDescriptor, BufferUsage, IntersectionFunction,
    RayTracingBackend,
};
use crate::resources::{Buffer, ComputePipeline};

/// Per-geometry table of intersection routines for bounding-box geometry.
///
/// Entry `i` holds the function run when a ray enters a bounding box of geometry
/// `i`, or nothing for triangle geometry. The table is stored on the device as one
/// `u32` function id per entry. When per-primitive data is not embedded in the
/// acceleration structures, the resource table is attached so the functions can
/// fetch their primitive data bindlessly.
pub struct IntersectionFunctionTable {
    functions: Vec<Option<IntersectionFunction>>,
    buffer: Arc<Buffer>,
    resource_table: Option<Arc<Buffer>>,
}

impl IntersectionFunctionTable {
    pub fn new(
        backend: &dyn RayTracingBackend,
        pipeline: &ComputePipeline,
        functions: Vec<Option<IntersectionFunction>>,
        resource_table: Option<Arc<Buffer>>,
    ) -> BackendResult<Self> {
        for function in functions.iter().flatten() {
            if !pipeline.intersection_functions().contains(function) {
                return Err(BackendError::InvalidParameter(format!(
                    "intersection function `{}` is not linked into the pipeline",
                    function.name()
                )));
            }
        }

        let ids: Vec<u32> = functions
            .iter()
            .map(|function| function.map_or(0, |f| f.id()))
            .collect();
        let bytes: &[u8] = bytemuck::cast_slice(&ids);
        let desc = BufferDescriptor::new(
            (bytes.len() as u64).max(4),
            BufferUsage::STORAGE | BufferUsage::MAP_WRITE,
        )
        .with_label("intersection_function_table");
        let buffer = backend.create_buffer_init(&desc, bytes)?;

        Ok(Self {
            functions,
            buffer,
            resource_table,
        })
    }

    pub fn function(&self, index: usize) -> Option<IntersectionFunction> {
        self.functions.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn resource_table(&self) -> Option<&Arc<Buffer>> {
        self.resource_table.as_ref()
    }
}

impl std::fmt::Debug for IntersectionFunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntersectionFunctionTable")
            .field("functions", &self.functions)
            .field("has_resource_table", &self.resource_table.is_some())
            .finish()
    }
}

//! Bindless resource table.
//!
//! One fixed-stride row per geometry, each row holding the raw GPU addresses of
//! that geometry's resources in declaration order:
//!
//! ```text
//!            0        8        16       24
//! row 0   │ indices │ normals │ colors  │   triangle mesh
//! row 1   │ spheres │ (unused)│ (unused)│   procedural spheres
//! ```
//!
//! The kernel finds resource `r` of geometry `g` at `g * stride + r * address_size`.

use std::sync::Arc;

use crate::backend::{
    BackendError, BackendResult, BufferDescriptor, BufferUsage, RayTracingBackend,
    ResidentResource,
};
use crate::resources::Buffer;
use crate::scene::UploadedGeometry;

/// Width of the addresses the table stores.
pub const TABLE_ADDRESS_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Smallest row, so that a table of geometries without resources is still addressable.
const MIN_ROW_ADDRESSES: u64 = 1;

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Row stride for geometries exposing `resource_counts` resources each.
pub fn row_stride(resource_counts: impl IntoIterator<Item = usize>, address_size: u64) -> u64 {
    let widest = resource_counts
        .into_iter()
        .map(|count| count as u64 * address_size)
        .max()
        .unwrap_or(0);
    align_up(widest.max(MIN_ROW_ADDRESSES * address_size), address_size)
}

pub struct ResourceTable {
    buffer: Arc<Buffer>,
    stride: u64,
    rows: usize,
    resources: Vec<Arc<Buffer>>,
}

impl ResourceTable {
    /// Lay out and upload the table for `geometries`, indexed by geometry id.
    pub fn new(
        backend: &dyn RayTracingBackend,
        geometries: &[UploadedGeometry],
    ) -> BackendResult<Self> {
        let address_size = backend.limits().gpu_address_size;
        if address_size != TABLE_ADDRESS_SIZE {
            return Err(BackendError::FeatureNotSupported(format!(
                "{address_size}-byte GPU addresses"
            )));
        }

        let stride = row_stride(
            geometries.iter().map(|g| g.resources().len()),
            address_size,
        );
        let rows = geometries.len().max(1);
        let mut arena = vec![0u8; rows * stride as usize];
        let mut resources = Vec::new();

        for (geometry, uploaded) in geometries.iter().enumerate() {
            for (slot, resource) in uploaded.resources().into_iter().enumerate() {
                let at = Self::offset_with(stride, geometry, slot) as usize;
                let address = backend.buffer_address(&resource);
                arena[at..at + TABLE_ADDRESS_SIZE as usize]
                    .copy_from_slice(bytemuck::bytes_of(&address));
                resources.push(resource);
            }
        }

        let desc = BufferDescriptor::new(
            arena.len() as u64,
            BufferUsage::STORAGE | BufferUsage::MAP_WRITE,
        )
        .with_label("resource_table");
        let buffer = backend.create_buffer_init(&desc, &arena)?;

        log::debug!(
            "Resource table: {} rows, stride {} bytes, {} resources",
            rows,
            stride,
            resources.len()
        );

        Ok(Self {
            buffer,
            stride,
            rows,
            resources,
        })
    }

    fn offset_with(stride: u64, geometry: usize, resource: usize) -> u64 {
        geometry as u64 * stride + resource as u64 * TABLE_ADDRESS_SIZE
    }

    /// Byte offset of resource `resource` of geometry `geometry`.
    pub fn offset(&self, geometry: usize, resource: usize) -> u64 {
        Self::offset_with(self.stride, geometry, resource)
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Bytes per row; baked into the kernel.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Every buffer the table points at. The kernel reaches them only through
    /// their addresses, so dispatches must declare them resident.
    pub fn resident_resources(&self) -> impl Iterator<Item = ResidentResource> + '_ {
        self.resources
            .iter()
            .map(|buffer| ResidentResource::Buffer(Arc::clone(buffer)))
    }
}

impl std::fmt::Debug for ResourceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTable")
            .field("rows", &self.rows)
            .field("stride", &self.stride)
            .field("resources", &self.resources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::scene::{FaceMask, Geometry, SphereGeometry, TriangleMesh};
    use glam::{Affine3A, Vec3};

    #[test]
    fn stride_covers_widest_row() {
        assert_eq!(row_stride([3, 1], 8), 24);
        assert_eq!(row_stride([1], 8), 8);
        assert_eq!(row_stride([], 8), 8);
        assert_eq!(row_stride([0, 0], 8), 8);
    }

    #[test]
    fn rows_hold_resource_addresses() {
        let backend = SoftwareBackend::new().unwrap();

        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(FaceMask::ALL, Vec3::ONE, &Affine3A::IDENTITY, false);
        let mut spheres = SphereGeometry::new();
        spheres.add_sphere(Vec3::ZERO, 1.0, Vec3::ONE);

        let uploaded = vec![
            Geometry::from(mesh).upload(&backend, 0).unwrap(),
            Geometry::from(spheres).upload(&backend, 1).unwrap(),
        ];
        let table = ResourceTable::new(&backend, &uploaded).unwrap();

        assert_eq!(table.stride(), 24);
        assert_eq!(table.offset(1, 0), 24);
        assert_eq!(table.offset(0, 2), 16);
        assert_eq!(table.resident_resources().count(), 4);

        let bytes = backend
            .read_buffer(table.buffer(), 0, table.buffer().size())
            .unwrap();
        let words: Vec<u64> = bytes
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let expected: Vec<u64> = uploaded
            .iter()
            .flat_map(|g| {
                let mut row: Vec<u64> = g
                    .resources()
                    .iter()
                    .map(|b| backend.buffer_address(b))
                    .collect();
                row.resize(3, 0);
                row
            })
            .collect();
        assert_eq!(words, expected);
    }
}

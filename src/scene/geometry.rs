//! Geometry authoring and upload.

use std::sync::Arc;

use glam::{Affine3A, Vec3, Vec4};

use crate::backend::{
    BackendResult, BufferDescriptor, BufferUsage, GeometryDescriptor, IndexFormat,
    IntersectionFunction, PrimitiveDataDescriptor, RayTracingBackend,
};
use crate::error::SceneError;
use crate::resources::Buffer;
use crate::shaders::{Sphere, Triangle};

/// Bytes between consecutive vertices; positions are padded `vec3`s.
pub const VERTEX_STRIDE: u64 = 16;

/// Selects cube faces for [`TriangleMesh::add_cube_with_faces`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceMask(u32);

impl FaceMask {
    pub const NONE: Self = Self(0);
    pub const NEGATIVE_X: Self = Self(1 << 0);
    pub const POSITIVE_X: Self = Self(1 << 1);
    pub const NEGATIVE_Y: Self = Self(1 << 2);
    pub const POSITIVE_Y: Self = Self(1 << 3);
    pub const NEGATIVE_Z: Self = Self(1 << 4);
    pub const POSITIVE_Z: Self = Self(1 << 5);
    pub const ALL: Self = Self((1 << 6) - 1);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    fn has_face(&self, face: usize) -> bool {
        self.0 & (1 << face) != 0
    }
}

impl std::ops::BitOr for FaceMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

const CUBE_CORNERS: [Vec3; 8] = [
    Vec3::new(-0.5, -0.5, -0.5),
    Vec3::new(0.5, -0.5, -0.5),
    Vec3::new(-0.5, 0.5, -0.5),
    Vec3::new(0.5, 0.5, -0.5),
    Vec3::new(-0.5, -0.5, 0.5),
    Vec3::new(0.5, -0.5, 0.5),
    Vec3::new(-0.5, 0.5, 0.5),
    Vec3::new(0.5, 0.5, 0.5),
];

/// Corner quads in face-mask bit order.
const CUBE_FACES: [[usize; 4]; 6] = [
    [0, 4, 6, 2],
    [1, 3, 7, 5],
    [0, 1, 5, 4],
    [2, 6, 7, 3],
    [0, 2, 3, 1],
    [4, 5, 7, 6],
];

fn triangle_normal(v0: Vec3, v1: Vec3, v2: Vec3) -> Vec3 {
    let e1 = (v1 - v0).normalize();
    let e2 = (v2 - v0).normalize();
    e1.cross(e2).normalize()
}

/// Indexed triangle mesh with per-vertex normals and colors.
#[derive(Debug, Clone, Default)]
pub struct TriangleMesh {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    colors: Vec<Vec3>,
    indices: Vec<u16>,
}

impl TriangleMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mesh from raw vertex streams; checked by [`Geometry::validate`].
    pub fn from_parts(
        positions: Vec<Vec3>,
        normals: Vec<Vec3>,
        colors: Vec<Vec3>,
        indices: Vec<u16>,
    ) -> Self {
        Self {
            positions,
            normals,
            colors,
            indices,
        }
    }

    /// Append the faces of a transformed unit cube, two triangles per face.
    ///
    /// Each face gets its own four vertices. The two shared corners carry the
    /// averaged normal of both triangles, the others their triangle's normal.
    pub fn add_cube_with_faces(
        &mut self,
        faces: FaceMask,
        color: Vec3,
        transform: &Affine3A,
        inward_normals: bool,
    ) {
        let corners = CUBE_CORNERS.map(|corner| transform.transform_point3(corner));

        for (face, quad) in CUBE_FACES.iter().enumerate() {
            if !faces.has_face(face) {
                continue;
            }
            let [v0, v1, v2, v3] = quad.map(|i| corners[i]);
            let mut n0 = triangle_normal(v0, v1, v2);
            let mut n1 = triangle_normal(v0, v2, v3);
            if inward_normals {
                n0 = -n0;
                n1 = -n1;
            }

            let base = self.positions.len() as u16;
            self.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
            self.positions.extend_from_slice(&[v0, v1, v2, v3]);
            let shared = (n0 + n1).normalize();
            self.normals.extend_from_slice(&[shared, n0, shared, n1]);
            self.colors.extend_from_slice(&[color; 4]);
        }
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    pub fn colors(&self) -> &[Vec3] {
        &self.colors
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Per-triangle payload gathered through the index buffer.
    pub fn triangles(&self) -> Vec<Triangle> {
        self.indices
            .chunks_exact(3)
            .map(|corners| {
                let mut triangle = Triangle::default();
                for (k, &index) in corners.iter().enumerate() {
                    triangle.normals[k] = self.normals[index as usize].extend(0.0);
                    triangle.colors[k] = self.colors[index as usize].extend(0.0);
                }
                triangle
            })
            .collect()
    }

    fn validate(&self, geometry: usize) -> Result<(), SceneError> {
        if self.triangle_count() == 0 {
            return Err(SceneError::EmptyGeometry { geometry });
        }
        let vertex_count = self.positions.len();
        if vertex_count > u16::MAX as usize + 1 {
            return Err(SceneError::TooManyVertices {
                geometry,
                vertex_count,
            });
        }
        if self.normals.len() != vertex_count || self.colors.len() != vertex_count {
            return Err(SceneError::MismatchedVertexStreams { geometry });
        }
        if let Some(&index) = self
            .indices
            .iter()
            .find(|&&index| index as usize >= vertex_count)
        {
            return Err(SceneError::IndexOutOfRange {
                geometry,
                index: index as u32,
                vertex_count,
            });
        }
        if !self.positions.iter().all(|p| p.is_finite()) {
            return Err(SceneError::NonFiniteGeometry { geometry });
        }
        Ok(())
    }
}

/// Procedural spheres intersected by `sphere_intersection`.
#[derive(Debug, Clone, Default)]
pub struct SphereGeometry {
    spheres: Vec<Sphere>,
}

impl SphereGeometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sphere(&mut self, origin: Vec3, radius: f32, color: Vec3) {
        self.spheres.push(Sphere::new(origin, radius, color));
    }

    pub fn spheres(&self) -> &[Sphere] {
        &self.spheres
    }

    fn validate(&self, geometry: usize) -> Result<(), SceneError> {
        if self.spheres.is_empty() {
            return Err(SceneError::EmptyGeometry { geometry });
        }
        let finite = self
            .spheres
            .iter()
            .all(|s| s.origin.is_finite() && s.radius.is_finite() && s.radius > 0.0);
        if !finite {
            return Err(SceneError::NonFiniteGeometry { geometry });
        }
        Ok(())
    }
}

/// Geometry variants a scene can hold.
#[derive(Debug, Clone)]
pub enum Geometry {
    TriangleMesh(TriangleMesh),
    Procedural(SphereGeometry),
}

impl From<TriangleMesh> for Geometry {
    fn from(mesh: TriangleMesh) -> Self {
        Geometry::TriangleMesh(mesh)
    }
}

impl From<SphereGeometry> for Geometry {
    fn from(spheres: SphereGeometry) -> Self {
        Geometry::Procedural(spheres)
    }
}

fn padded(vectors: &[Vec3]) -> Vec<Vec4> {
    vectors.iter().map(|v| v.extend(0.0)).collect()
}

fn storage_buffer<T: bytemuck::Pod>(
    backend: &dyn RayTracingBackend,
    label: String,
    data: &[T],
    usage: BufferUsage,
) -> BackendResult<Arc<Buffer>> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    // Rounded to whole words so kernels can read the buffer as `array<u32>`.
    let size = (bytes.len() as u64).div_ceil(4) * 4;
    let desc = BufferDescriptor::new(size, usage | BufferUsage::MAP_WRITE).with_label(label);
    backend.create_buffer_init(&desc, bytes)
}

impl Geometry {
    pub fn primitive_count(&self) -> usize {
        match self {
            Geometry::TriangleMesh(mesh) => mesh.triangle_count(),
            Geometry::Procedural(spheres) => spheres.spheres.len(),
        }
    }

    pub fn intersection_function(&self) -> Option<IntersectionFunction> {
        match self {
            Geometry::TriangleMesh(_) => None,
            Geometry::Procedural(_) => Some(IntersectionFunction::Sphere),
        }
    }

    /// Number of bindless resources the geometry exposes.
    pub fn resource_count(&self) -> usize {
        match self {
            Geometry::TriangleMesh(_) => 3,
            Geometry::Procedural(_) => 1,
        }
    }

    pub fn validate(&self, geometry: usize) -> Result<(), SceneError> {
        match self {
            Geometry::TriangleMesh(mesh) => mesh.validate(geometry),
            Geometry::Procedural(spheres) => spheres.validate(geometry),
        }
    }

    /// Copy the geometry into immutable device buffers.
    pub fn upload(
        &self,
        backend: &dyn RayTracingBackend,
        geometry: usize,
    ) -> BackendResult<UploadedGeometry> {
        match self {
            Geometry::TriangleMesh(mesh) => {
                let addressable = BufferUsage::STORAGE | BufferUsage::SHADER_ADDRESS;
                Ok(UploadedGeometry::Triangles {
                    positions: storage_buffer(
                        backend,
                        format!("geometry{geometry}_positions"),
                        &padded(&mesh.positions),
                        BufferUsage::VERTEX | BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                    )?,
                    indices: storage_buffer(
                        backend,
                        format!("geometry{geometry}_indices"),
                        &mesh.indices,
                        BufferUsage::INDEX | BufferUsage::ACCELERATION_STRUCTURE_INPUT | addressable,
                    )?,
                    normals: storage_buffer(
                        backend,
                        format!("geometry{geometry}_normals"),
                        &padded(&mesh.normals),
                        addressable,
                    )?,
                    colors: storage_buffer(
                        backend,
                        format!("geometry{geometry}_colors"),
                        &padded(&mesh.colors),
                        addressable,
                    )?,
                    triangles: storage_buffer(
                        backend,
                        format!("geometry{geometry}_triangles"),
                        &mesh.triangles(),
                        BufferUsage::STORAGE | BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                    )?,
                    vertex_count: mesh.vertex_count() as u32,
                    triangle_count: mesh.triangle_count() as u32,
                })
            }
            Geometry::Procedural(spheres) => {
                let boxes: Vec<_> = spheres.spheres.iter().map(Sphere::bounding_box).collect();
                Ok(UploadedGeometry::Spheres {
                    bounding_boxes: storage_buffer(
                        backend,
                        format!("geometry{geometry}_bounding_boxes"),
                        &boxes,
                        BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                    )?,
                    spheres: storage_buffer(
                        backend,
                        format!("geometry{geometry}_spheres"),
                        &spheres.spheres,
                        BufferUsage::STORAGE
                            | BufferUsage::SHADER_ADDRESS
                            | BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                    )?,
                    count: spheres.spheres.len() as u32,
                })
            }
        }
    }
}

/// Device copy of one geometry.
#[derive(Debug, Clone)]
pub enum UploadedGeometry {
    Triangles {
        positions: Arc<Buffer>,
        indices: Arc<Buffer>,
        normals: Arc<Buffer>,
        colors: Arc<Buffer>,
        triangles: Arc<Buffer>,
        vertex_count: u32,
        triangle_count: u32,
    },
    Spheres {
        bounding_boxes: Arc<Buffer>,
        spheres: Arc<Buffer>,
        count: u32,
    },
}

impl UploadedGeometry {
    /// Acceleration-structure input; `embed_primitive_data` stores the
    /// per-primitive payload inside the structure.
    pub fn descriptor(&self, embed_primitive_data: bool) -> GeometryDescriptor {
        match self {
            UploadedGeometry::Triangles {
                positions,
                indices,
                triangles,
                vertex_count,
                triangle_count,
                ..
            } => GeometryDescriptor::Triangles {
                vertex_buffer: Arc::clone(positions),
                vertex_stride: VERTEX_STRIDE,
                vertex_count: *vertex_count,
                index_buffer: Arc::clone(indices),
                index_format: IndexFormat::Uint16,
                triangle_count: *triangle_count,
                primitive_data: embed_primitive_data.then(|| PrimitiveDataDescriptor {
                    buffer: Arc::clone(triangles),
                    stride: std::mem::size_of::<Triangle>() as u64,
                    element_size: std::mem::size_of::<Triangle>() as u64,
                }),
            },
            UploadedGeometry::Spheres {
                bounding_boxes,
                spheres,
                count,
            } => GeometryDescriptor::BoundingBoxes {
                bounding_box_buffer: Arc::clone(bounding_boxes),
                bounding_box_stride: std::mem::size_of::<crate::shaders::BoundingBox>() as u64,
                bounding_box_count: *count,
                primitive_data: embed_primitive_data.then(|| PrimitiveDataDescriptor {
                    buffer: Arc::clone(spheres),
                    stride: std::mem::size_of::<Sphere>() as u64,
                    element_size: std::mem::size_of::<Sphere>() as u64,
                }),
                intersection_function: IntersectionFunction::Sphere,
            },
        }
    }

    /// Buffers bound bindlessly, in resource-table order.
    pub fn resources(&self) -> Vec<Arc<Buffer>> {
        match self {
            UploadedGeometry::Triangles {
                indices,
                normals,
                colors,
                ..
            } => vec![Arc::clone(indices), Arc::clone(normals), Arc::clone(colors)],
            UploadedGeometry::Spheres { spheres, .. } => vec![Arc::clone(spheres)],
        }
    }

    pub fn intersection_function(&self) -> Option<IntersectionFunction> {
        match self {
            UploadedGeometry::Triangles { .. } => None,
            UploadedGeometry::Spheres { .. } => Some(IntersectionFunction::Sphere),
        }
    }

    pub fn primitive_count(&self) -> u32 {
        match self {
            UploadedGeometry::Triangles { triangle_count, .. } => *triangle_count,
            UploadedGeometry::Spheres { count, .. } => *count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_cube_has_twelve_triangles() {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(FaceMask::ALL, Vec3::ONE, &Affine3A::IDENTITY, false);

        assert_eq!(mesh.triangle_count(), 12);
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(mesh.triangles().len(), 12);
        assert!(Geometry::from(mesh).validate(0).is_ok());
    }

    #[test]
    fn outward_normals_point_away_from_centre() {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(FaceMask::ALL, Vec3::ONE, &Affine3A::IDENTITY, false);

        for (position, normal) in mesh.positions().iter().zip(mesh.normals()) {
            assert!(position.dot(*normal) > 0.0, "{position} / {normal}");
        }
    }

    #[test]
    fn inward_faces_flip_normals() {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(FaceMask::POSITIVE_Y, Vec3::ONE, &Affine3A::IDENTITY, true);

        assert_eq!(mesh.triangle_count(), 2);
        for normal in mesh.normals() {
            assert!((normal.y + 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn vertex_normals_are_unit_length() {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(FaceMask::ALL, Vec3::ONE, &Affine3A::IDENTITY, false);

        for normal in mesh.normals() {
            assert!((normal.length() - 1.0).abs() < 1e-5, "{normal}");
        }
    }

    #[test]
    fn face_mask_selects_faces() {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(
            FaceMask::NEGATIVE_Y | FaceMask::POSITIVE_Y | FaceMask::NEGATIVE_Z,
            Vec3::ONE,
            &Affine3A::from_scale(Vec3::splat(2.0)),
            true,
        );
        assert_eq!(mesh.triangle_count(), 6);
        assert!(FaceMask::ALL.contains(FaceMask::POSITIVE_Z));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mesh = TriangleMesh::from_parts(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![Vec3::Z; 3],
            vec![Vec3::ONE; 3],
            vec![0, 1, 5],
        );
        assert_eq!(
            Geometry::from(mesh).validate(4),
            Err(SceneError::IndexOutOfRange {
                geometry: 4,
                index: 5,
                vertex_count: 3
            })
        );
    }

    #[test]
    fn rejects_empty_geometry() {
        assert_eq!(
            Geometry::from(TriangleMesh::new()).validate(1),
            Err(SceneError::EmptyGeometry { geometry: 1 })
        );
        assert_eq!(
            Geometry::from(SphereGeometry::new()).validate(2),
            Err(SceneError::EmptyGeometry { geometry: 2 })
        );
    }
}

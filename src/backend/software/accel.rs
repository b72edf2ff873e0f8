//! CPU acceleration structures.
//!
//! A bottom-level structure copies its primitives out of the input buffers and
//! indexes them with a [`Bvh`]. A top-level structure holds placed instances of
//! bottom-level structures and a BVH over their world bounds. Storage sizes are
//! modelled on a packed node layout so compaction is observable: the pre-build
//! estimate assumes the worst-case node count, the built footprint uses the real one.

use std::sync::Arc;

use glam::{Affine3A, Vec2, Vec3A};

use super::bvh::{Aabb, Bvh, Ray, Visit};
use super::{software_acceleration_structure, software_buffer};
use crate::backend::{
    AccelerationStructureDescriptor, AccelerationStructureSizes, BackendError, BackendResult,
    GeometryDescriptor, IndexFormat, InstanceDescriptor, IntersectionFunction,
    TopLevelDescriptor,
};
use crate::shaders::Sphere;

const HEADER_BYTES: u64 = 64;
const NODE_BYTES: u64 = 32;
const PRIMITIVE_INDEX_BYTES: u64 = 4;
const TRIANGLE_BYTES: u64 = 36;
const BOUNDING_BOX_BYTES: u64 = 24;
const INSTANCE_BYTES: u64 = std::mem::size_of::<InstanceDescriptor>() as u64 + 96;
const SCRATCH_BYTES_PER_PRIMITIVE: u64 = 28;
const SCRATCH_BASE_BYTES: u64 = 64;

/// Worst-case node count of a binary tree over `n` primitives.
fn max_nodes(n: u64) -> u64 {
    (2 * n).saturating_sub(1)
}

/// Conservative storage and scratch sizes for `desc`.
pub(crate) fn estimate_sizes(
    desc: &AccelerationStructureDescriptor,
) -> BackendResult<AccelerationStructureSizes> {
    let (count, per_primitive) = match desc {
        AccelerationStructureDescriptor::BottomLevel(geometry) => {
            let data = geometry.primitive_data().map_or(0, |d| d.element_size);
            let primitive = match geometry {
                GeometryDescriptor::Triangles { .. } => TRIANGLE_BYTES,
                GeometryDescriptor::BoundingBoxes { .. } => BOUNDING_BOX_BYTES,
            };
            (
                geometry.primitive_count() as u64,
                primitive + PRIMITIVE_INDEX_BYTES + data,
            )
        }
        AccelerationStructureDescriptor::TopLevel(top) => (
            top.instance_count as u64,
            INSTANCE_BYTES + PRIMITIVE_INDEX_BYTES,
        ),
    };
    if count == 0 {
        return Err(BackendError::InvalidParameter(
            "acceleration structure has no primitives".into(),
        ));
    }
    Ok(AccelerationStructureSizes {
        acceleration_structure_size: HEADER_BYTES + count * per_primitive + max_nodes(count) * NODE_BYTES,
        build_scratch_size: count * SCRATCH_BYTES_PER_PRIMITIVE + SCRATCH_BASE_BYTES,
    })
}

/// Contents of a built acceleration structure.
#[derive(Debug, Clone)]
pub(crate) enum Built {
    Bottom(Arc<BottomLevel>),
    Top(Arc<TopLevel>),
}

impl Built {
    /// Bytes the structure occupies once compacted.
    pub fn footprint(&self) -> u64 {
        match self {
            Built::Bottom(bottom) => bottom.footprint(),
            Built::Top(top) => top.footprint(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Primitives {
    Triangles(Vec<[Vec3A; 3]>),
    BoundingBoxes {
        boxes: Vec<Aabb>,
        function: IntersectionFunction,
    },
}

/// Per-primitive payload copied into the structure at build time.
#[derive(Debug)]
pub(crate) struct PrimitiveData {
    bytes: Vec<u8>,
    element_size: usize,
}

#[derive(Debug)]
pub(crate) struct BottomLevel {
    primitives: Primitives,
    primitive_data: Option<PrimitiveData>,
    bvh: Bvh,
}

fn read_vec3(bytes: &[u8], offset: usize) -> BackendResult<Vec3A> {
    let end = offset + 12;
    let slice = bytes.get(offset..end).ok_or_else(|| {
        BackendError::ExecutionFailed(format!("vertex read at {offset} past end of buffer"))
    })?;
    let v: [f32; 3] = bytemuck::pod_read_unaligned(slice);
    Ok(Vec3A::from(v))
}

impl BottomLevel {
    pub fn build(geometry: &GeometryDescriptor) -> BackendResult<Self> {
        let primitives = match geometry {
            GeometryDescriptor::Triangles {
                vertex_buffer,
                vertex_stride,
                vertex_count,
                index_buffer,
                index_format,
                triangle_count,
                ..
            } => {
                let vertices = software_buffer(vertex_buffer)?.read();
                let indices = software_buffer(index_buffer)?.read();
                let index_size = index_format.size() as usize;
                let needed = *triangle_count as usize * 3 * index_size;
                if indices.len() < needed {
                    return Err(BackendError::ExecutionFailed(format!(
                        "index buffer holds {} bytes, {} triangles need {}",
                        indices.len(),
                        triangle_count,
                        needed
                    )));
                }
                let index = |i: usize| -> u32 {
                    let at = i * index_size;
                    match index_format {
                        IndexFormat::Uint16 => {
                            u16::from_le_bytes([indices[at], indices[at + 1]]) as u32
                        }
                        IndexFormat::Uint32 => u32::from_le_bytes([
                            indices[at],
                            indices[at + 1],
                            indices[at + 2],
                            indices[at + 3],
                        ]),
                    }
                };

                let mut triangles = Vec::with_capacity(*triangle_count as usize);
                for t in 0..*triangle_count as usize {
                    let mut corners = [Vec3A::ZERO; 3];
                    for (corner, slot) in corners.iter_mut().enumerate() {
                        let vertex = index(t * 3 + corner);
                        if vertex >= *vertex_count {
                            return Err(BackendError::ExecutionFailed(format!(
                                "triangle {t} references vertex {vertex} of {vertex_count}"
                            )));
                        }
                        *slot = read_vec3(&vertices, (vertex as u64 * vertex_stride) as usize)?;
                    }
                    triangles.push(corners);
                }
                Primitives::Triangles(triangles)
            }
            GeometryDescriptor::BoundingBoxes {
                bounding_box_buffer,
                bounding_box_stride,
                bounding_box_count,
                intersection_function,
                ..
            } => {
                let data = software_buffer(bounding_box_buffer)?.read();
                let boxes = (0..*bounding_box_count as u64)
                    .map(|i| {
                        let at = (i * bounding_box_stride) as usize;
                        Ok(Aabb::new(read_vec3(&data, at)?, read_vec3(&data, at + 12)?))
                    })
                    .collect::<BackendResult<Vec<_>>>()?;
                Primitives::BoundingBoxes {
                    boxes,
                    function: *intersection_function,
                }
            }
        };

        let primitive_data = match geometry.primitive_data() {
            Some(desc) => {
                let source = software_buffer(&desc.buffer)?.read();
                let count = geometry.primitive_count() as usize;
                let element_size = desc.element_size as usize;
                let mut bytes = Vec::with_capacity(count * element_size);
                for i in 0..count {
                    let at = i * desc.stride as usize;
                    let element = source.get(at..at + element_size).ok_or_else(|| {
                        BackendError::ExecutionFailed(format!(
                            "primitive data for primitive {i} past end of buffer"
                        ))
                    })?;
                    bytes.extend_from_slice(element);
                }
                Some(PrimitiveData {
                    bytes,
                    element_size,
                })
            }
            None => None,
        };

        let bounds: Vec<Aabb> = match &primitives {
            Primitives::Triangles(triangles) => {
                triangles.iter().map(|t| Aabb::from_points(t)).collect()
            }
            Primitives::BoundingBoxes { boxes, .. } => boxes.clone(),
        };
        let bvh = Bvh::build(&bounds);

        Ok(Self {
            primitives,
            primitive_data,
            bvh,
        })
    }

    pub fn primitive_count(&self) -> usize {
        match &self.primitives {
            Primitives::Triangles(triangles) => triangles.len(),
            Primitives::BoundingBoxes { boxes, .. } => boxes.len(),
        }
    }

    pub fn footprint(&self) -> u64 {
        let per_primitive = match &self.primitives {
            Primitives::Triangles(_) => TRIANGLE_BYTES,
            Primitives::BoundingBoxes { .. } => BOUNDING_BOX_BYTES,
        } + PRIMITIVE_INDEX_BYTES
            + self.primitive_data.as_ref().map_or(0, |d| d.element_size as u64);
        HEADER_BYTES
            + self.primitive_count() as u64 * per_primitive
            + self.bvh.node_count() as u64 * NODE_BYTES
    }

    pub fn bounds(&self) -> Aabb {
        self.bvh.bounds()
    }

    pub fn is_procedural(&self) -> bool {
        matches!(self.primitives, Primitives::BoundingBoxes { .. })
    }

    pub fn intersection_function(&self) -> Option<IntersectionFunction> {
        match &self.primitives {
            Primitives::Triangles(_) => None,
            Primitives::BoundingBoxes { function, .. } => Some(*function),
        }
    }

    pub fn primitive_data(&self, primitive: u32) -> Option<&[u8]> {
        let data = self.primitive_data.as_ref()?;
        let start = primitive as usize * data.element_size;
        data.bytes.get(start..start + data.element_size)
    }

    pub fn has_primitive_data(&self) -> bool {
        self.primitive_data.is_some()
    }
}

/// Resolves hits against bounding-box primitives.
pub(crate) trait ProceduralIntersector {
    /// Distance along `ray` (object space) at which `primitive` is hit, if any.
    fn intersect(&self, instance: &PlacedInstance, primitive: u32, ray: &Ray, t_max: f32)
        -> Option<f32>;
}

/// Runs each geometry's own intersection function against its embedded
/// primitive data, or accepts the box entry point when there is none.
pub(crate) struct BuiltinIntersector;

impl ProceduralIntersector for BuiltinIntersector {
    fn intersect(
        &self,
        instance: &PlacedInstance,
        primitive: u32,
        ray: &Ray,
        t_max: f32,
    ) -> Option<f32> {
        let bottom = &instance.bottom;
        match (bottom.intersection_function(), bottom.primitive_data(primitive)) {
            (Some(IntersectionFunction::Sphere), Some(bytes))
                if bytes.len() >= std::mem::size_of::<Sphere>() =>
            {
                let sphere: Sphere =
                    bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<Sphere>()]);
                intersect_sphere(&sphere, ray, t_max)
            }
            _ => match &bottom.primitives {
                Primitives::BoundingBoxes { boxes, .. } => {
                    boxes.get(primitive as usize)?.intersect(ray, t_max)
                }
                Primitives::Triangles(_) => None,
            },
        }
    }
}

/// Nearest root of the ray/sphere quadratic inside `[ray.t_min, t_max]`.
pub(crate) fn intersect_sphere(sphere: &Sphere, ray: &Ray, t_max: f32) -> Option<f32> {
    let oc = ray.origin - Vec3A::from(sphere.origin);
    let a = ray.direction.dot(ray.direction);
    let b = 2.0 * oc.dot(ray.direction);
    let c = oc.dot(oc) - sphere.radius_squared;
    let disc = b * b - 4.0 * a * c;
    if disc <= 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / (2.0 * a);
    (t >= ray.t_min && t <= t_max).then_some(t)
}

/// Möller–Trumbore; returns distance and barycentrics of corners 1 and 2.
fn intersect_triangle(triangle: &[Vec3A; 3], ray: &Ray, t_max: f32) -> Option<(f32, Vec2)> {
    let edge1 = triangle[1] - triangle[0];
    let edge2 = triangle[2] - triangle[0];
    let p = ray.direction.cross(edge2);
    let det = edge1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - triangle[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(q) * inv_det;
    (t >= ray.t_min && t <= t_max).then_some((t, Vec2::new(u, v)))
}

#[derive(Debug)]
pub(crate) struct PlacedInstance {
    pub descriptor: InstanceDescriptor,
    pub object_to_world: Affine3A,
    pub world_to_object: Affine3A,
    pub bottom: Arc<BottomLevel>,
}

/// Closest (or any) intersection found by a top-level query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub distance: f32,
    pub instance_index: u32,
    pub primitive_index: u32,
    /// Barycentrics of the second and third triangle corners, zero for procedural hits
    pub barycentrics: Vec2,
    pub instance_mask: u32,
}

#[derive(Debug)]
pub(crate) struct TopLevel {
    instances: Vec<PlacedInstance>,
    bvh: Bvh,
}

impl TopLevel {
    pub fn build(desc: &TopLevelDescriptor) -> BackendResult<Self> {
        let data = software_buffer(&desc.instance_buffer)?.read();
        let stride = std::mem::size_of::<InstanceDescriptor>();
        let needed = desc.instance_count as usize * stride;
        if data.len() < needed {
            return Err(BackendError::ExecutionFailed(format!(
                "instance buffer holds {} bytes, {} instances need {}",
                data.len(),
                desc.instance_count,
                needed
            )));
        }

        let mut instances = Vec::with_capacity(desc.instance_count as usize);
        for (i, chunk) in data[..needed].chunks_exact(stride).enumerate() {
            let descriptor: InstanceDescriptor = bytemuck::pod_read_unaligned(chunk);
            let structure = desc
                .bottom_level
                .get(descriptor.acceleration_structure_index as usize)
                .ok_or_else(|| {
                    BackendError::ExecutionFailed(format!(
                        "instance {i} references bottom-level structure {} of {}",
                        descriptor.acceleration_structure_index,
                        desc.bottom_level.len()
                    ))
                })?;
            let bottom = match software_acceleration_structure(structure)?.contents() {
                Some(Built::Bottom(bottom)) => bottom,
                _ => {
                    return Err(BackendError::ExecutionFailed(format!(
                        "instance {i} references an unbuilt bottom-level structure"
                    )))
                }
            };
            let object_to_world = descriptor.affine();
            if object_to_world.matrix3.determinant() == 0.0 {
                return Err(BackendError::ExecutionFailed(format!(
                    "instance {i} has a singular transform"
                )));
            }
            instances.push(PlacedInstance {
                descriptor,
                object_to_world,
                world_to_object: object_to_world.inverse(),
                bottom,
            });
        }

        let bounds: Vec<Aabb> = instances
            .iter()
            .map(|instance| instance.bottom.bounds().transformed(&instance.object_to_world))
            .collect();
        let bvh = Bvh::build(&bounds);

        Ok(Self { instances, bvh })
    }

    pub fn footprint(&self) -> u64 {
        HEADER_BYTES
            + self.instances.len() as u64 * (INSTANCE_BYTES + PRIMITIVE_INDEX_BYTES)
            + self.bvh.node_count() as u64 * NODE_BYTES
    }

    pub fn instances(&self) -> &[PlacedInstance] {
        &self.instances
    }

    /// Trace `ray` against instances whose mask overlaps `ray_mask`. With
    /// `accept_any` the first accepted hit ends the query.
    pub fn trace(
        &self,
        ray: &Ray,
        ray_mask: u32,
        accept_any: bool,
        procedural: &dyn ProceduralIntersector,
    ) -> Option<RayHit> {
        let mut best: Option<RayHit> = None;
        let mut t_max = ray.t_max;

        self.bvh.traverse(ray, &mut t_max, |instance_index, current_max| {
            let instance = &self.instances[instance_index as usize];
            if instance.descriptor.mask & ray_mask == 0 {
                return Visit::Miss;
            }
            let local = ray.transformed(&instance.world_to_object);
            let mut local_max = current_max;
            let mut found = None;

            let terminated = instance.bottom.bvh.traverse(&local, &mut local_max, |primitive, limit| {
                let hit = match &instance.bottom.primitives {
                    Primitives::Triangles(triangles) => {
                        intersect_triangle(&triangles[primitive as usize], &local, limit)
                    }
                    Primitives::BoundingBoxes { .. } => procedural
                        .intersect(instance, primitive, &local, limit)
                        .map(|t| (t, Vec2::ZERO)),
                };
                match hit {
                    Some((t, barycentrics)) => {
                        found = Some(RayHit {
                            distance: t,
                            instance_index,
                            primitive_index: primitive,
                            barycentrics,
                            instance_mask: instance.descriptor.mask,
                        });
                        if accept_any {
                            Visit::Terminate
                        } else {
                            Visit::Hit(t)
                        }
                    }
                    None => Visit::Miss,
                }
            });

            match found {
                Some(hit) => {
                    best = Some(hit);
                    if terminated {
                        Visit::Terminate
                    } else {
                        Visit::Hit(hit.distance)
                    }
                }
                None => Visit::Miss,
            }
        });

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn sphere_hit_reports_near_root() {
        let sphere = Sphere::new(Vec3::new(0.0, 0.0, 5.0), 1.0, Vec3::ONE);
        let ray = Ray::new(Vec3A::ZERO, Vec3A::Z, 0.0, f32::INFINITY);
        let t = intersect_sphere(&sphere, &ray, f32::INFINITY).unwrap();
        assert!((t - 4.0).abs() < 1e-5);
        assert!(intersect_sphere(&sphere, &ray, 3.0).is_none());
    }

    #[test]
    fn triangle_hit_and_miss() {
        let triangle = [
            Vec3A::new(-1.0, -1.0, 2.0),
            Vec3A::new(1.0, -1.0, 2.0),
            Vec3A::new(0.0, 1.0, 2.0),
        ];
        let hit = Ray::new(Vec3A::ZERO, Vec3A::Z, 0.0, f32::INFINITY);
        let (t, bary) = intersect_triangle(&triangle, &hit, f32::INFINITY).unwrap();
        assert!((t - 2.0).abs() < 1e-5);
        assert!(bary.x >= 0.0 && bary.y >= 0.0 && bary.x + bary.y <= 1.0);

        let miss = Ray::new(Vec3A::new(5.0, 0.0, 0.0), Vec3A::Z, 0.0, f32::INFINITY);
        assert!(intersect_triangle(&triangle, &miss, f32::INFINITY).is_none());
    }

    #[test]
    fn estimate_needs_primitives() {
        assert_eq!(max_nodes(0), 0);
        assert_eq!(max_nodes(1), 1);
        assert_eq!(max_nodes(12), 23);
    }
}

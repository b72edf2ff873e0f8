//! Kernel-facing memory layouts and the ray-tracing kernel source.
//!
//! Every struct here is read bit-for-bit by the kernel on both backends. Three
//! component vectors are padded to 16 bytes, matching WGSL `vec3<f32>` alignment.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use static_assertions::const_assert_eq;

pub const GEOMETRY_MASK_TRIANGLE: u32 = 1;
pub const GEOMETRY_MASK_SPHERE: u32 = 2;
pub const GEOMETRY_MASK_LIGHT: u32 = 4;

pub const GEOMETRY_MASK_GEOMETRY: u32 = GEOMETRY_MASK_TRIANGLE | GEOMETRY_MASK_SPHERE;

pub const RAY_MASK_PRIMARY: u32 = GEOMETRY_MASK_GEOMETRY | GEOMETRY_MASK_LIGHT;
pub const RAY_MASK_SHADOW: u32 = GEOMETRY_MASK_GEOMETRY;
pub const RAY_MASK_SECONDARY: u32 = GEOMETRY_MASK_GEOMETRY;

/// Mask visible to every ray class.
pub const INSTANCE_MASK_ALL: u32 = 0xFF;

/// Upper bound for path segments per sample.
pub const MAX_BOUNCES: u32 = 3;

pub const WORKGROUP_SIZE: [u32; 2] = [8, 8];

pub const RAYTRACING_KERNEL: &str = include_str!("raytracing.wgsl");
pub const RAYTRACING_ENTRY_POINT: &str = "raytracing_kernel";

/// Kernel binding slots.
pub mod slot {
    pub const UNIFORMS: u32 = 0;
    pub const RESOURCES: u32 = 1;
    pub const INSTANCES: u32 = 2;
    pub const LIGHTS: u32 = 3;
    pub const ACCELERATION_STRUCTURE: u32 = 4;
    pub const INTERSECTION_FUNCTION_TABLE: u32 = 5;
    pub const SEEDS: u32 = 6;
    pub const ACCUMULATION_SOURCE: u32 = 7;
    pub const ACCUMULATION_TARGET: u32 = 8;
}

/// Slots of a triangle mesh row in the resource table.
pub mod triangle_resource {
    pub const INDICES: usize = 0;
    pub const NORMALS: usize = 1;
    pub const COLORS: usize = 2;
}

/// Slots of a sphere geometry row in the resource table.
pub mod sphere_resource {
    pub const SPHERES: usize = 0;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct CameraUniforms {
    pub position: Vec3,
    pub _pad0: f32,
    pub right: Vec3,
    pub _pad1: f32,
    pub up: Vec3,
    pub _pad2: f32,
    pub forward: Vec3,
    pub _pad3: f32,
}

const_assert_eq!(std::mem::size_of::<CameraUniforms>(), 64);

impl CameraUniforms {
    pub fn new(position: Vec3, right: Vec3, up: Vec3, forward: Vec3) -> Self {
        Self {
            position,
            right,
            up,
            forward,
            ..Default::default()
        }
    }
}

/// Per-frame constants, one copy per uniform ring slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub width: u32,
    pub height: u32,
    pub frame_index: u32,
    pub light_count: u32,
    pub camera: CameraUniforms,
}

const_assert_eq!(std::mem::size_of::<FrameUniforms>(), 80);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct AreaLight {
    pub position: Vec3,
    pub _pad0: f32,
    pub forward: Vec3,
    pub _pad1: f32,
    pub right: Vec3,
    pub _pad2: f32,
    pub up: Vec3,
    pub _pad3: f32,
    pub color: Vec3,
    pub _pad4: f32,
}

const_assert_eq!(std::mem::size_of::<AreaLight>(), 80);

impl AreaLight {
    pub fn new(position: Vec3, forward: Vec3, right: Vec3, up: Vec3, color: Vec3) -> Self {
        Self {
            position,
            forward,
            right,
            up,
            color,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Sphere {
    pub origin: Vec3,
    pub radius_squared: f32,
    pub color: Vec3,
    pub radius: f32,
}

const_assert_eq!(std::mem::size_of::<Sphere>(), 32);

impl Sphere {
    pub fn new(origin: Vec3, radius: f32, color: Vec3) -> Self {
        Self {
            origin,
            radius_squared: radius * radius,
            color,
            radius,
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox {
            min: self.origin - Vec3::splat(self.radius),
            max: self.origin + Vec3::splat(self.radius),
        }
    }
}

/// Per-triangle payload: vertex normals and colors, `w` unused.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Triangle {
    pub normals: [Vec4; 3],
    pub colors: [Vec4; 3],
}

const_assert_eq!(std::mem::size_of::<Triangle>(), 96);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

const_assert_eq!(std::mem::size_of::<BoundingBox>(), 24);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_masks_select_expected_geometry() {
        assert_ne!(RAY_MASK_PRIMARY & GEOMETRY_MASK_LIGHT, 0);
        assert_eq!(RAY_MASK_SHADOW & GEOMETRY_MASK_LIGHT, 0);
        assert_eq!(RAY_MASK_SECONDARY & GEOMETRY_MASK_LIGHT, 0);
        assert_ne!(RAY_MASK_SHADOW & GEOMETRY_MASK_SPHERE, 0);
    }

    #[test]
    fn sphere_bounds_enclose_sphere() {
        let sphere = Sphere::new(Vec3::new(1.0, 2.0, 3.0), 0.5, Vec3::ONE);
        let bounds = sphere.bounding_box();
        assert_eq!(bounds.min, Vec3::new(0.5, 1.5, 2.5));
        assert_eq!(bounds.max, Vec3::new(1.5, 2.5, 3.5));
        assert_eq!(sphere.radius_squared, 0.25);
    }
}

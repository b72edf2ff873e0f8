//! Common types shared between backends

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Mat3A, Vec3A};
use static_assertions::const_assert_eq;

use crate::resources::{AccelerationStructure, Buffer};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba32Float,
    R32Uint,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm | TextureFormat::R32Uint => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, TextureFormat::Rgba32Float)
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const STORAGE_BINDING: Self = Self(1 << 3);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const MAP_READ: Self = Self(1 << 0);
    pub const MAP_WRITE: Self = Self(1 << 1);
    pub const COPY_SRC: Self = Self(1 << 2);
    pub const COPY_DST: Self = Self(1 << 3);
    pub const INDEX: Self = Self(1 << 4);
    pub const VERTEX: Self = Self(1 << 5);
    pub const UNIFORM: Self = Self(1 << 6);
    pub const STORAGE: Self = Self(1 << 7);
    /// Input to an acceleration-structure build (vertices, indices, boxes, instances)
    pub const ACCELERATION_STRUCTURE_INPUT: Self = Self(1 << 8);
    /// Scratch memory for an acceleration-structure build
    pub const ACCELERATION_STRUCTURE_SCRATCH: Self = Self(1 << 9);
    /// The buffer's GPU address may be stored in a bindless table
    pub const SHADER_ADDRESS: Self = Self(1 << 10);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        }
    }
}

impl TextureDescriptor {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            width,
            height,
            format,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Size of the tightly packed texel data in bytes.
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Fixed device limits the renderer lays memory out against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Uniform slots must start at multiples of this
    pub min_uniform_buffer_offset_alignment: u64,
    /// Bytes per GPU address stored in a bindless table
    pub gpu_address_size: u64,
    pub max_texture_dimension_2d: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            gpu_address_size: 8,
            max_texture_dimension_2d: 16384,
        }
    }
}

/// Optional device features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    /// Per-primitive payloads can be stored inside bottom-level structures
    pub primitive_data_in_acceleration_structure: bool,
    /// Custom intersection functions for bounding-box geometry
    pub intersection_functions: bool,
    /// The kernel can read primitive data through the bindless resource table
    pub bindless_resources: bool,
    /// Spatial upscale pass is available
    pub spatial_upscale: bool,
    /// Command lists execute strictly in submission order
    pub in_order_queue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// Pre-build size estimates for an acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
}

/// Instance option flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceOptions(u32);

impl InstanceOptions {
    pub const NONE: Self = Self(0);
    pub const DISABLE_TRIANGLE_CULLING: Self = Self(1 << 0);
    pub const TRIANGLE_FRONT_FACING_WINDING_COUNTER_CLOCKWISE: Self = Self(1 << 1);
    /// Hits are accepted without running any intersection function
    pub const OPAQUE: Self = Self(1 << 2);
    pub const NON_OPAQUE: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for InstanceOptions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// One entry of the top-level instance buffer.
///
/// `transform` is a row-major 4x3 affine matrix: rows 0..3 are the images of the
/// x, y and z axes, row 3 is the translation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDescriptor {
    pub transform: [[f32; 3]; 4],
    pub options: u32,
    pub mask: u32,
    pub intersection_function_table_offset: u32,
    pub acceleration_structure_index: u32,
}

const_assert_eq!(std::mem::size_of::<InstanceDescriptor>(), 64);

impl InstanceDescriptor {
    pub fn new(
        transform: &Affine3A,
        options: InstanceOptions,
        mask: u32,
        acceleration_structure_index: u32,
    ) -> Self {
        let m = transform.matrix3;
        let t = transform.translation;
        Self {
            transform: [
                m.x_axis.to_array(),
                m.y_axis.to_array(),
                m.z_axis.to_array(),
                t.to_array(),
            ],
            options: options.bits(),
            mask,
            intersection_function_table_offset: 0,
            acceleration_structure_index,
        }
    }

    pub fn affine(&self) -> Affine3A {
        let [x, y, z, t] = self.transform;
        Affine3A {
            matrix3: Mat3A::from_cols(Vec3A::from(x), Vec3A::from(y), Vec3A::from(z)),
            translation: Vec3A::from(t),
        }
    }

    pub fn options(&self) -> InstanceOptions {
        InstanceOptions::from_bits(self.options)
    }

    pub fn is_opaque(&self) -> bool {
        self.options().contains(InstanceOptions::OPAQUE)
    }
}

/// Intersection routines a pipeline can link for bounding-box geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntersectionFunction {
    Sphere,
}

impl IntersectionFunction {
    pub fn name(&self) -> &'static str {
        match self {
            IntersectionFunction::Sphere => "sphere_intersection",
        }
    }

    /// Id written into intersection function tables; 0 marks an empty entry.
    pub fn id(&self) -> u32 {
        match self {
            IntersectionFunction::Sphere => 1,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(IntersectionFunction::Sphere),
            _ => None,
        }
    }
}

/// Per-primitive payload stored alongside the primitives of a bottom-level structure.
#[derive(Debug, Clone)]
pub struct PrimitiveDataDescriptor {
    pub buffer: Arc<Buffer>,
    pub stride: u64,
    pub element_size: u64,
}

/// Geometry input to a bottom-level build.
#[derive(Debug, Clone)]
pub enum GeometryDescriptor {
    Triangles {
        vertex_buffer: Arc<Buffer>,
        vertex_stride: u64,
        vertex_count: u32,
        index_buffer: Arc<Buffer>,
        index_format: IndexFormat,
        triangle_count: u32,
        primitive_data: Option<PrimitiveDataDescriptor>,
    },
    BoundingBoxes {
        bounding_box_buffer: Arc<Buffer>,
        bounding_box_stride: u64,
        bounding_box_count: u32,
        primitive_data: Option<PrimitiveDataDescriptor>,
        intersection_function: IntersectionFunction,
    },
}

impl GeometryDescriptor {
    pub fn primitive_count(&self) -> u32 {
        match self {
            GeometryDescriptor::Triangles { triangle_count, .. } => *triangle_count,
            GeometryDescriptor::BoundingBoxes {
                bounding_box_count, ..
            } => *bounding_box_count,
        }
    }

    pub fn primitive_data(&self) -> Option<&PrimitiveDataDescriptor> {
        match self {
            GeometryDescriptor::Triangles { primitive_data, .. }
            | GeometryDescriptor::BoundingBoxes { primitive_data, .. } => primitive_data.as_ref(),
        }
    }

    pub fn intersection_function(&self) -> Option<IntersectionFunction> {
        match self {
            GeometryDescriptor::Triangles { .. } => None,
            GeometryDescriptor::BoundingBoxes {
                intersection_function,
                ..
            } => Some(*intersection_function),
        }
    }
}

/// Instance input to a top-level build.
#[derive(Debug, Clone)]
pub struct TopLevelDescriptor {
    /// Tightly packed [`InstanceDescriptor`]s
    pub instance_buffer: Arc<Buffer>,
    pub instance_count: u32,
    /// Indexed by `InstanceDescriptor::acceleration_structure_index`
    pub bottom_level: Vec<Arc<AccelerationStructure>>,
}

#[derive(Debug, Clone)]
pub enum AccelerationStructureDescriptor {
    BottomLevel(GeometryDescriptor),
    TopLevel(TopLevelDescriptor),
}

impl AccelerationStructureDescriptor {
    pub fn kind(&self) -> AccelerationStructureKind {
        match self {
            AccelerationStructureDescriptor::BottomLevel(_) => AccelerationStructureKind::BottomLevel,
            AccelerationStructureDescriptor::TopLevel(_) => AccelerationStructureKind::TopLevel,
        }
    }
}

/// Values baked into the ray-tracing kernel when its pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConstants {
    /// Bytes per resource-table row
    pub resources_stride: u32,
    /// Some geometry routes through the intersection function table
    pub use_intersection_functions: bool,
    /// Per-primitive data is read from the acceleration structure instead of the resource table
    pub use_primitive_data: bool,
    pub max_bounces: u32,
}

/// Compute pipeline descriptor
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    /// WGSL source
    pub source: &'static str,
    pub entry_point: &'static str,
    pub workgroup_size: [u32; 2],
    pub constants: KernelConstants,
    /// Functions linked into the pipeline for the intersection function table
    pub intersection_functions: Vec<IntersectionFunction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn instance_descriptor_is_row_major_4x3() {
        let transform = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 3.0, 4.0),
            Quat::IDENTITY,
            Vec3::new(5.0, 6.0, 7.0),
        );
        let descriptor = InstanceDescriptor::new(&transform, InstanceOptions::OPAQUE, 0xFF, 3);

        assert_eq!(descriptor.transform[0], [2.0, 0.0, 0.0]);
        assert_eq!(descriptor.transform[1], [0.0, 3.0, 0.0]);
        assert_eq!(descriptor.transform[2], [0.0, 0.0, 4.0]);
        assert_eq!(descriptor.transform[3], [5.0, 6.0, 7.0]);
        assert_eq!(descriptor.acceleration_structure_index, 3);
        assert!(descriptor.is_opaque());
        assert_eq!(descriptor.affine(), transform);
    }

    #[test]
    fn usage_flags_combine() {
        let usage = BufferUsage::STORAGE | BufferUsage::SHADER_ADDRESS;
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(usage.contains(BufferUsage::SHADER_ADDRESS));
        assert!(!usage.contains(BufferUsage::UNIFORM));
    }

    #[test]
    fn intersection_function_ids_round_trip() {
        let function = IntersectionFunction::Sphere;
        assert_eq!(IntersectionFunction::from_id(function.id()), Some(function));
        assert_eq!(IntersectionFunction::from_id(0), None);
        assert_eq!(function.name(), "sphere_intersection");
    }
}

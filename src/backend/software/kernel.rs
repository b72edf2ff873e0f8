//! CPU port of the progressive path-tracing kernel.
//!
//! One sample per pixel per dispatch: a jittered primary ray, then up to
//! `max_bounces` segments, each with next-event estimation towards one randomly
//! chosen area light and a cosine-weighted continuation. The sample is folded
//! into the running average read from the source accumulation target.
//!
//! Geometry payloads are read either from the acceleration structure (primitive
//! data) or through the bindless resource table. Table addresses only resolve to
//! buffers declared resident for the dispatch.

use std::sync::Arc;

use glam::{Mat3A, Vec2, Vec3, Vec3A, Vec4};
use rayon::prelude::*;

use super::accel::{
    intersect_sphere, BottomLevel, Built, PlacedInstance, ProceduralIntersector, RayHit, TopLevel,
};
use super::bvh::Ray;
use super::{software_acceleration_structure, software_buffer, software_texture};
use crate::backend::{
    BackendError, BackendResult, Binding, DispatchCommand, InstanceDescriptor,
    IntersectionFunction, KernelConstants, ResidentResource, TextureFormat,
};
use crate::resources::{Buffer, Texture};
use crate::shaders::{
    slot, sphere_resource, triangle_resource, AreaLight, FrameUniforms, Sphere, Triangle,
    GEOMETRY_MASK_LIGHT, RAY_MASK_PRIMARY, RAY_MASK_SECONDARY, RAY_MASK_SHADOW,
};

const PRIMES: [u32; 20] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71,
];

/// Offset of shading points along the normal for secondary rays.
const SURFACE_EPSILON: f32 = 1e-3;

/// Halton sequence value `index` in dimension `dimension`.
pub(crate) fn halton(mut index: u32, dimension: usize) -> f32 {
    let base = PRIMES[dimension];
    let inv_base = 1.0 / base as f32;
    let mut fraction = 1.0;
    let mut result = 0.0;
    while index > 0 {
        fraction *= inv_base;
        result += fraction * (index % base) as f32;
        index /= base;
    }
    result
}

/// Cosine-weighted direction in the hemisphere around `normal`.
pub(crate) fn sample_cosine_weighted_hemisphere(u: Vec2, normal: Vec3A) -> Vec3A {
    let phi = 2.0 * std::f32::consts::PI * u.x;
    let cos_theta = u.y.sqrt();
    let sin_theta = (1.0 - u.y).max(0.0).sqrt();
    let local = Vec3A::new(sin_theta * phi.cos(), cos_theta, sin_theta * phi.sin());

    let right = normal.cross(Vec3A::new(0.0072, 1.0, 0.0034)).normalize();
    let forward = right.cross(normal);
    local.x * right + local.y * normal + local.z * forward
}

fn read_pod_vec<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

fn fail(message: String) -> BackendError {
    BackendError::ExecutionFailed(format!("raytracing_kernel: {message}"))
}

/// Per-geometry payload fetched through the resource table.
enum Surface {
    Triangles {
        indices: Vec<u16>,
        normals: Vec<Vec4>,
        colors: Vec<Vec4>,
    },
    Spheres(Vec<Sphere>),
}

/// Resident buffers by device address.
struct AddressSpace<'a> {
    buffers: Vec<(u64, &'a Buffer)>,
}

impl<'a> AddressSpace<'a> {
    fn new(resident: &'a [ResidentResource]) -> BackendResult<Self> {
        let mut buffers = Vec::new();
        for resource in resident {
            if let ResidentResource::Buffer(buffer) = resource {
                buffers.push((software_buffer(buffer)?.address(), buffer.as_ref()));
            }
        }
        Ok(Self { buffers })
    }

    /// Contents of the resident buffer holding `address`, from that address on.
    fn read_from(&self, address: u64) -> BackendResult<Vec<u8>> {
        let (base, buffer) = self
            .buffers
            .iter()
            .find(|(base, buffer)| address >= *base && address < base + buffer.size())
            .ok_or_else(|| fail(format!("address {address:#x} is not in a resident buffer")))?;
        let data = software_buffer(buffer)?.read();
        Ok(data[(address - base) as usize..].to_vec())
    }
}

struct TraceContext {
    uniforms: FrameUniforms,
    lights: Vec<AreaLight>,
    instances: Vec<InstanceDescriptor>,
    tlas: Arc<TopLevel>,
    surfaces: Vec<Option<Surface>>,
    functions: Vec<Option<IntersectionFunction>>,
    constants: KernelConstants,
}

fn storage_buffer(command: &DispatchCommand, index: u32) -> BackendResult<Option<&Arc<Buffer>>> {
    match command.binding(index) {
        Some(Binding::StorageBuffer(buffer)) => Ok(Some(buffer)),
        None => Ok(None),
        Some(other) => Err(fail(format!("slot {index} expects a storage buffer, got {other:?}"))),
    }
}

fn required_buffer(command: &DispatchCommand, index: u32) -> BackendResult<&Arc<Buffer>> {
    storage_buffer(command, index)?.ok_or_else(|| fail(format!("slot {index} is unbound")))
}

fn texture(
    command: &DispatchCommand,
    index: u32,
    storage: bool,
    format: TextureFormat,
) -> BackendResult<&Arc<Texture>> {
    match (command.binding(index), storage) {
        (Some(Binding::Texture(bound)), false) | (Some(Binding::StorageTexture(bound)), true) => {
            if bound.format() == format {
                Ok(bound)
            } else {
                Err(fail(format!(
                    "slot {index} expects {format:?}, got {:?}",
                    bound.format()
                )))
            }
        }
        (Some(other), _) => Err(fail(format!("slot {index} expects a texture, got {other:?}"))),
        (None, _) => Err(fail(format!("slot {index} is unbound"))),
    }
}

impl TraceContext {
    fn gather(command: &DispatchCommand, constants: KernelConstants) -> BackendResult<Self> {
        let uniforms = match command.binding(slot::UNIFORMS) {
            Some(Binding::UniformBuffer {
                buffer,
                offset,
                size,
            }) => {
                let data = software_buffer(buffer)?.read();
                let start = *offset as usize;
                let len = std::mem::size_of::<FrameUniforms>();
                if (*size as usize) < len || start + len > data.len() {
                    return Err(fail(format!("uniform range {offset}+{size} is too small")));
                }
                bytemuck::pod_read_unaligned::<FrameUniforms>(&data[start..start + len])
            }
            _ => return Err(fail("slot 0 expects a uniform buffer".into())),
        };

        let lights_buffer = required_buffer(command, slot::LIGHTS)?;
        let lights: Vec<AreaLight> = read_pod_vec(&software_buffer(lights_buffer)?.read());
        if lights.len() < uniforms.light_count as usize {
            return Err(fail(format!(
                "{} lights declared, buffer holds {}",
                uniforms.light_count,
                lights.len()
            )));
        }

        let tlas = match command.binding(slot::ACCELERATION_STRUCTURE) {
            Some(Binding::AccelerationStructure(structure)) => {
                match software_acceleration_structure(structure)?.contents() {
                    Some(Built::Top(top)) => top,
                    _ => return Err(fail("slot 4 holds an unbuilt top-level structure".into())),
                }
            }
            _ => return Err(fail("slot 4 expects an acceleration structure".into())),
        };

        let instances: Vec<InstanceDescriptor> =
            read_pod_vec(&software_buffer(required_buffer(command, slot::INSTANCES)?)?.read());
        if instances.len() < tlas.instances().len() {
            return Err(fail(format!(
                "instance buffer holds {} of {} instances",
                instances.len(),
                tlas.instances().len()
            )));
        }

        // Every bottom-level structure reached through the TLAS must be resident.
        let resident_bottoms: Vec<Arc<BottomLevel>> = command
            .resident
            .iter()
            .filter_map(|resource| match resource {
                ResidentResource::AccelerationStructure(structure) => Some(structure),
                ResidentResource::Buffer(_) => None,
            })
            .map(|structure| software_acceleration_structure(structure).map(|s| s.contents()))
            .collect::<BackendResult<Vec<_>>>()?
            .into_iter()
            .filter_map(|built| match built {
                Some(Built::Bottom(bottom)) => Some(bottom),
                _ => None,
            })
            .collect();
        for (i, placed) in tlas.instances().iter().enumerate() {
            if !resident_bottoms.iter().any(|b| Arc::ptr_eq(b, &placed.bottom)) {
                return Err(fail(format!(
                    "bottom-level structure of instance {i} is not resident"
                )));
            }
        }

        let functions = if constants.use_intersection_functions {
            match command.binding(slot::INTERSECTION_FUNCTION_TABLE) {
                Some(Binding::IntersectionFunctionTable(table)) => {
                    let ids: Vec<u32> = read_pod_vec(&software_buffer(table.buffer())?.read());
                    ids.into_iter()
                        .take(table.len())
                        .map(IntersectionFunction::from_id)
                        .collect()
                }
                _ => return Err(fail("slot 5 expects an intersection function table".into())),
            }
        } else {
            Vec::new()
        };

        let geometry_count = instances
            .iter()
            .take(tlas.instances().len())
            .map(|d| d.acceleration_structure_index as usize + 1)
            .max()
            .unwrap_or(0);
        let mut surfaces: Vec<Option<Surface>> = (0..geometry_count).map(|_| None).collect();

        let table = if constants.use_primitive_data {
            None
        } else {
            let buffer = required_buffer(command, slot::RESOURCES)?;
            Some(software_buffer(buffer)?.read().clone())
        };
        let address_space = AddressSpace::new(&command.resident)?;

        for (i, placed) in tlas.instances().iter().enumerate() {
            let bottom = &placed.bottom;
            if bottom.is_procedural() {
                let entry = placed.descriptor.intersection_function_table_offset as usize;
                if functions.get(entry).copied().flatten().is_none() {
                    return Err(fail(format!(
                        "instance {i} needs an intersection function at table entry {entry}"
                    )));
                }
            }

            let geometry = instances[i].acceleration_structure_index as usize;
            if constants.use_primitive_data {
                if !bottom.has_primitive_data() {
                    return Err(fail(format!(
                        "geometry {geometry} was built without primitive data"
                    )));
                }
                continue;
            }
            if surfaces[geometry].is_some() {
                continue;
            }

            let table = table.as_deref().unwrap_or_default();
            let stride = constants.resources_stride as usize;
            let address = |resource: usize| -> BackendResult<u64> {
                let at = geometry * stride + resource * 8;
                table
                    .get(at..at + 8)
                    .map(bytemuck::pod_read_unaligned::<u64>)
                    .ok_or_else(|| fail(format!("resource table has no row for geometry {geometry}")))
            };

            let surface = if bottom.is_procedural() {
                Surface::Spheres(read_pod_vec(
                    &address_space.read_from(address(sphere_resource::SPHERES)?)?,
                ))
            } else {
                let indices = address_space
                    .read_from(address(triangle_resource::INDICES)?)?
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Surface::Triangles {
                    indices,
                    normals: read_pod_vec(
                        &address_space.read_from(address(triangle_resource::NORMALS)?)?,
                    ),
                    colors: read_pod_vec(
                        &address_space.read_from(address(triangle_resource::COLORS)?)?,
                    ),
                }
            };
            surfaces[geometry] = Some(surface);
        }

        Ok(Self {
            uniforms,
            lights,
            instances,
            tlas,
            surfaces,
            functions,
            constants,
        })
    }

    fn geometry_of(&self, instance: u32) -> usize {
        self.instances[instance as usize].acceleration_structure_index as usize
    }

    fn sphere(&self, placed: &PlacedInstance, geometry: usize, primitive: u32) -> Option<Sphere> {
        if self.constants.use_primitive_data {
            let bytes = placed.bottom.primitive_data(primitive)?;
            return Some(bytemuck::pod_read_unaligned(
                bytes.get(..std::mem::size_of::<Sphere>())?,
            ));
        }
        match self.surfaces.get(geometry)? {
            Some(Surface::Spheres(spheres)) => spheres.get(primitive as usize).copied(),
            _ => None,
        }
    }

    /// World-space normal and albedo at `hit`.
    fn surface(&self, hit: &RayHit, ray: &Ray) -> Option<(Vec3A, Vec3)> {
        let placed = &self.tlas.instances()[hit.instance_index as usize];
        let geometry = self.geometry_of(hit.instance_index);

        let (object_normal, color) = if placed.bottom.is_procedural() {
            let sphere = self.sphere(placed, geometry, hit.primitive_index)?;
            let local = ray.transformed(&placed.world_to_object).at(hit.distance);
            ((local - Vec3A::from(sphere.origin)).normalize(), sphere.color)
        } else {
            let weights = Vec3::new(
                1.0 - hit.barycentrics.x - hit.barycentrics.y,
                hit.barycentrics.x,
                hit.barycentrics.y,
            );
            let (normals, colors) = if self.constants.use_primitive_data {
                let bytes = placed.bottom.primitive_data(hit.primitive_index)?;
                let triangle: Triangle =
                    bytemuck::pod_read_unaligned(bytes.get(..std::mem::size_of::<Triangle>())?);
                (triangle.normals, triangle.colors)
            } else {
                match self.surfaces.get(geometry)? {
                    Some(Surface::Triangles {
                        indices,
                        normals,
                        colors,
                    }) => {
                        let base = hit.primitive_index as usize * 3;
                        let corner = |k: usize| indices.get(base + k).map(|&i| i as usize);
                        let (i0, i1, i2) = (corner(0)?, corner(1)?, corner(2)?);
                        (
                            [*normals.get(i0)?, *normals.get(i1)?, *normals.get(i2)?],
                            [*colors.get(i0)?, *colors.get(i1)?, *colors.get(i2)?],
                        )
                    }
                    _ => return None,
                }
            };
            let normal = normals[0].truncate() * weights.x
                + normals[1].truncate() * weights.y
                + normals[2].truncate() * weights.z;
            let color = colors[0].truncate() * weights.x
                + colors[1].truncate() * weights.y
                + colors[2].truncate() * weights.z;
            (Vec3A::from(normal).normalize(), color)
        };

        let normal_matrix: Mat3A = placed.world_to_object.matrix3.transpose();
        Some(((normal_matrix * object_normal).normalize(), color))
    }

    fn sample_pixel(&self, x: u32, y: u32, offset: u32) -> Vec3 {
        let uniforms = &self.uniforms;
        let camera = &uniforms.camera;
        let index = offset.wrapping_add(uniforms.frame_index);

        let jitter = Vec2::new(halton(index, 0), halton(index, 1));
        let size = Vec2::new(uniforms.width as f32, uniforms.height as f32);
        let mut uv = (Vec2::new(x as f32, y as f32) + jitter) / size * 2.0 - 1.0;
        uv.y = -uv.y;

        let mut origin = Vec3A::from(camera.position);
        let mut direction = Vec3A::from(uv.x * camera.right + uv.y * camera.up + camera.forward)
            .normalize();
        let mut throughput = Vec3::ONE;
        let mut accumulated = Vec3::ZERO;
        let light_count = uniforms.light_count.min(self.lights.len() as u32);

        for bounce in 0..self.constants.max_bounces as usize {
            let ray = Ray::new(origin, direction, 0.0, f32::INFINITY);
            let mask = if bounce == 0 {
                RAY_MASK_PRIMARY
            } else {
                RAY_MASK_SECONDARY
            };
            let Some(hit) = self.tlas.trace(&ray, mask, false, self) else {
                break;
            };

            if hit.instance_mask == GEOMETRY_MASK_LIGHT {
                if bounce == 0 {
                    accumulated = Vec3::ONE;
                }
                break;
            }

            let Some((normal, albedo)) = self.surface(&hit, &ray) else {
                break;
            };
            let point = ray.at(hit.distance);
            let dimension = 2 + bounce * 5;
            throughput *= albedo;

            if light_count > 0 {
                let r = Vec2::new(halton(index, dimension), halton(index, dimension + 1));
                let choice = halton(index, dimension + 2);
                let light_index = ((choice * light_count as f32) as u32).min(light_count - 1);
                let light = &self.lights[light_index as usize];

                let uv = r * 2.0 - 1.0;
                let light_point = Vec3A::from(light.position + light.right * uv.x + light.up * uv.y);
                let to_light = light_point - point;
                let distance = to_light.length();
                let inv_distance = 1.0 / distance.max(SURFACE_EPSILON);
                let light_direction = to_light * inv_distance;

                let mut light_color = light.color * (inv_distance * inv_distance);
                light_color *= (-light_direction).dot(Vec3A::from(light.forward)).clamp(0.0, 1.0);
                light_color *= normal.dot(light_direction).clamp(0.0, 1.0);
                light_color *= light_count as f32;

                let shadow = Ray::new(
                    point + normal * SURFACE_EPSILON,
                    light_direction,
                    0.0,
                    distance - SURFACE_EPSILON,
                );
                if self.tlas.trace(&shadow, RAY_MASK_SHADOW, true, self).is_none() {
                    accumulated += light_color * throughput;
                }
            }

            let r = Vec2::new(halton(index, dimension + 3), halton(index, dimension + 4));
            direction = sample_cosine_weighted_hemisphere(r, normal);
            origin = point + normal * SURFACE_EPSILON;
        }

        accumulated
    }
}

impl ProceduralIntersector for TraceContext {
    fn intersect(
        &self,
        instance: &PlacedInstance,
        primitive: u32,
        ray: &Ray,
        t_max: f32,
    ) -> Option<f32> {
        let entry = instance.descriptor.intersection_function_table_offset as usize;
        match self.functions.get(entry).copied().flatten()? {
            IntersectionFunction::Sphere => {
                let geometry = instance.descriptor.acceleration_structure_index as usize;
                let sphere = self.sphere(instance, geometry, primitive)?;
                intersect_sphere(&sphere, ray, t_max)
            }
        }
    }
}

/// Execute one dispatch of the ray-tracing kernel.
pub(crate) fn raytrace(command: &DispatchCommand, constants: KernelConstants) -> BackendResult<()> {
    let scene = TraceContext::gather(command, constants)?;

    let seeds = texture(command, slot::SEEDS, false, TextureFormat::R32Uint)?;
    let source = texture(command, slot::ACCUMULATION_SOURCE, false, TextureFormat::Rgba32Float)?;
    let target = texture(command, slot::ACCUMULATION_TARGET, true, TextureFormat::Rgba32Float)?;
    if Arc::ptr_eq(source, target) {
        return Err(fail("accumulation source and target are the same texture".into()));
    }
    let [width, height] = command.grid;
    for (name, bound) in [("seed", seeds), ("source", source), ("target", target)] {
        if bound.size() != (width, height) {
            return Err(fail(format!(
                "{name} texture is {:?}, grid is {width}x{height}",
                bound.size()
            )));
        }
    }
    if (scene.uniforms.width, scene.uniforms.height) != (width, height) {
        return Err(fail(format!(
            "uniforms describe {}x{}, grid is {width}x{height}",
            scene.uniforms.width, scene.uniforms.height
        )));
    }

    let seed_words = software_texture(seeds)?.words();
    let seeds: &[u32] = &seed_words[..];
    let previous_words = software_texture(source)?.words();
    let previous: &[f32] = bytemuck::cast_slice(&previous_words[..]);
    let mut output_words = software_texture(target)?.words_mut();
    let output: &mut [f32] = bytemuck::cast_slice_mut(&mut output_words[..]);
    let frame = scene.uniforms.frame_index as f32;

    output
        .par_chunks_mut(width as usize * 4)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width as usize {
                let pixel = y * width as usize + x;
                let mut color = scene.sample_pixel(x as u32, y as u32, seeds[pixel]);
                if scene.uniforms.frame_index > 0 {
                    let prev = Vec3::from_slice(&previous[pixel * 4..pixel * 4 + 3]);
                    color = (prev * frame + color) / (frame + 1.0);
                }
                color.extend(1.0).write_to_slice(&mut row[x * 4..x * 4 + 4]);
            }
        });

    log::trace!(
        "SoftwareBackend: raytraced {}x{} frame {}",
        width,
        height,
        scene.uniforms.frame_index
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halton_base_two_is_van_der_corput() {
        assert_eq!(halton(0, 0), 0.0);
        assert_eq!(halton(1, 0), 0.5);
        assert_eq!(halton(2, 0), 0.25);
        assert_eq!(halton(3, 0), 0.75);
        assert!((halton(1, 1) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn halton_values_stay_in_unit_interval() {
        for dimension in 0..PRIMES.len() {
            for index in [1u32, 7, 1023, 1 << 20, 1_000_003] {
                let value = halton(index, dimension);
                assert!((0.0..1.0).contains(&value), "{value} at {index}/{dimension}");
            }
        }
    }

    #[test]
    fn hemisphere_samples_face_the_normal() {
        let normal = Vec3A::new(0.3, -0.8, 0.5).normalize();
        for i in 1..64 {
            let u = Vec2::new(halton(i, 3), halton(i, 4));
            let direction = sample_cosine_weighted_hemisphere(u, normal);
            assert!(direction.dot(normal) >= -1e-5);
            assert!((direction.length() - 1.0).abs() < 1e-4);
        }
    }
}

//! Scene description consumed by the renderer.
//!
//! A [`Scene`] owns its geometries; instances refer to them by index, so one
//! geometry (and its bottom-level acceleration structure) can be placed many
//! times. Everything here is plain CPU data until [`Geometry::upload`].

pub mod cornell;
mod geometry;

use glam::{Affine3A, Vec3};

pub use cornell::{hoist_cornell_box, LineUp};
pub use geometry::{FaceMask, Geometry, SphereGeometry, TriangleMesh, UploadedGeometry, VERTEX_STRIDE};

use crate::backend::DeviceCapabilities;
use crate::error::SceneError;
use crate::shaders::AreaLight;

/// Camera placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerPose {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
}

impl ViewerPose {
    pub fn new(position: Vec3, target: Vec3, up: Vec3) -> Self {
        Self {
            position,
            target,
            up,
        }
    }
}

impl Default for ViewerPose {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, -1.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
        }
    }
}

/// One placement of a geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    /// Index into [`Scene::geometries`]
    pub geometry: usize,
    pub transform: Affine3A,
    /// Ray classes that see this instance
    pub mask: u32,
}

impl Instance {
    pub fn new(geometry: usize, transform: Affine3A, mask: u32) -> Self {
        Self {
            geometry,
            transform,
            mask,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    geometries: Vec<Geometry>,
    instances: Vec<Instance>,
    lights: Vec<AreaLight>,
    viewer: ViewerPose,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the geometry index instances refer to.
    pub fn add_geometry(&mut self, geometry: impl Into<Geometry>) -> usize {
        self.geometries.push(geometry.into());
        self.geometries.len() - 1
    }

    pub fn add_instance(&mut self, instance: Instance) {
        self.instances.push(instance);
    }

    pub fn add_light(&mut self, light: AreaLight) {
        self.lights.push(light);
    }

    pub fn set_viewer(&mut self, viewer: ViewerPose) {
        self.viewer = viewer;
    }

    pub fn geometries(&self) -> &[Geometry] {
        &self.geometries
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn lights(&self) -> &[AreaLight] {
        &self.lights
    }

    pub fn viewer(&self) -> &ViewerPose {
        &self.viewer
    }

    /// Whether any geometry needs an intersection function.
    pub fn uses_intersection_functions(&self) -> bool {
        self.geometries
            .iter()
            .any(|g| g.intersection_function().is_some())
    }

    /// Structural checks independent of the device.
    pub fn validate(&self) -> Result<(), SceneError> {
        if self.instances.is_empty() {
            return Err(SceneError::EmptyScene);
        }
        for (index, geometry) in self.geometries.iter().enumerate() {
            geometry.validate(index)?;
        }
        for (index, instance) in self.instances.iter().enumerate() {
            if instance.geometry >= self.geometries.len() {
                return Err(SceneError::MissingGeometry {
                    instance: index,
                    geometry: instance.geometry,
                });
            }
            if instance.mask == 0 {
                return Err(SceneError::ZeroMask { instance: index });
            }
            if !instance.transform.is_finite() {
                return Err(SceneError::NonFiniteTransform { instance: index });
            }
            // Rays are traced in object space, so the transform must invert.
            if !instance.transform.matrix3.determinant().is_normal() {
                return Err(SceneError::SingularTransform { instance: index });
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus the features the device must offer.
    pub fn validate_for(&self, capabilities: &DeviceCapabilities) -> Result<(), SceneError> {
        self.validate()?;
        if !capabilities.intersection_functions {
            if let Some((geometry, function)) = self
                .geometries
                .iter()
                .enumerate()
                .find_map(|(i, g)| g.intersection_function().map(|f| (i, f)))
            {
                return Err(SceneError::UnsupportedIntersectionFunction {
                    geometry,
                    function: function.name(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders::GEOMETRY_MASK_TRIANGLE;

    fn cube_scene() -> Scene {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube_with_faces(FaceMask::ALL, Vec3::ONE, &Affine3A::IDENTITY, false);
        let mut scene = Scene::new();
        let geometry = scene.add_geometry(mesh);
        scene.add_instance(Instance::new(geometry, Affine3A::IDENTITY, GEOMETRY_MASK_TRIANGLE));
        scene
    }

    #[test]
    fn valid_scene_passes() {
        assert!(cube_scene().validate().is_ok());
    }

    #[test]
    fn empty_scene_is_rejected() {
        assert_eq!(Scene::new().validate(), Err(SceneError::EmptyScene));
    }

    #[test]
    fn zero_mask_is_rejected() {
        let mut scene = cube_scene();
        scene.add_instance(Instance::new(0, Affine3A::IDENTITY, 0));
        assert_eq!(scene.validate(), Err(SceneError::ZeroMask { instance: 1 }));
    }

    #[test]
    fn degenerate_transforms_are_rejected() {
        let mut scene = cube_scene();
        scene.add_instance(Instance::new(0, Affine3A::from_scale(Vec3::ZERO), 1));
        assert_eq!(
            scene.validate(),
            Err(SceneError::SingularTransform { instance: 1 })
        );

        let mut scene = cube_scene();
        scene.add_instance(Instance::new(
            0,
            Affine3A::from_translation(Vec3::new(f32::NAN, 0.0, 0.0)),
            1,
        ));
        assert_eq!(
            scene.validate(),
            Err(SceneError::NonFiniteTransform { instance: 1 })
        );

        let mut scene = cube_scene();
        scene.add_instance(Instance::new(0, Affine3A::from_scale(Vec3::splat(0.01)), 1));
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn missing_geometry_is_rejected() {
        let mut scene = cube_scene();
        scene.add_instance(Instance::new(3, Affine3A::IDENTITY, 1));
        assert_eq!(
            scene.validate(),
            Err(SceneError::MissingGeometry {
                instance: 1,
                geometry: 3
            })
        );
    }

    #[test]
    fn procedural_geometry_needs_device_support() {
        let mut scene = cube_scene();
        let mut spheres = SphereGeometry::new();
        spheres.add_sphere(Vec3::ZERO, 1.0, Vec3::ONE);
        let geometry = scene.add_geometry(spheres);
        scene.add_instance(Instance::new(geometry, Affine3A::IDENTITY, 2));

        let without = DeviceCapabilities::default();
        assert!(matches!(
            scene.validate_for(&without),
            Err(SceneError::UnsupportedIntersectionFunction { geometry: 1, .. })
        ));

        let with = DeviceCapabilities {
            intersection_functions: true,
            ..Default::default()
        };
        assert!(scene.validate_for(&with).is_ok());
    }
}

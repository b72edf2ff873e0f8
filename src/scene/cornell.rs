//! Instanced Cornell-box scenes.

use glam::{Affine3A, Quat, Vec3};
use rand::Rng;

use super::{FaceMask, Instance, Scene, SphereGeometry, TriangleMesh, ViewerPose};
use crate::shaders::{AreaLight, GEOMETRY_MASK_LIGHT, GEOMETRY_MASK_SPHERE, GEOMETRY_MASK_TRIANGLE};

const WHITE: Vec3 = Vec3::new(0.725, 0.71, 0.68);
const RED: Vec3 = Vec3::new(0.63, 0.065, 0.05);
const GREEN: Vec3 = Vec3::new(0.14, 0.45, 0.091);

/// Distance between neighbouring boxes.
const GRID_SPACING: f32 = 2.5;

/// Ceiling height of the light, relative to the box origin.
const LIGHT_HEIGHT: f32 = 1.98;

/// How many boxes are placed side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineUp {
    OneByOne,
    TwoByTwo,
    #[default]
    ThreeByThree,
}

impl LineUp {
    /// Boxes per grid row.
    pub fn side(&self) -> u32 {
        match self {
            LineUp::OneByOne => 1,
            LineUp::TwoByTwo => 2,
            LineUp::ThreeByThree => 3,
        }
    }

    pub fn box_count(&self) -> u32 {
        self.side() * self.side()
    }
}

fn light_mesh() -> TriangleMesh {
    let mut mesh = TriangleMesh::new();
    let transform = Affine3A::from_translation(Vec3::new(0.0, 1.0, 0.0))
        * Affine3A::from_scale(Vec3::new(0.5, LIGHT_HEIGHT, 0.5));
    mesh.add_cube_with_faces(FaceMask::POSITIVE_Y, Vec3::ONE, &transform, true);
    mesh
}

fn box_mesh(with_short_box: bool) -> TriangleMesh {
    let mut mesh = TriangleMesh::new();

    let room = Affine3A::from_translation(Vec3::new(0.0, 1.0, 0.0))
        * Affine3A::from_scale(Vec3::splat(2.0));
    mesh.add_cube_with_faces(
        FaceMask::NEGATIVE_Y | FaceMask::POSITIVE_Y | FaceMask::NEGATIVE_Z,
        WHITE,
        &room,
        true,
    );
    mesh.add_cube_with_faces(FaceMask::NEGATIVE_X, RED, &room, true);
    mesh.add_cube_with_faces(FaceMask::POSITIVE_X, GREEN, &room, true);

    let tall_box = Affine3A::from_scale_rotation_translation(
        Vec3::new(0.6, 1.2, 0.6),
        Quat::from_rotation_y(0.3),
        Vec3::new(-0.335, 0.6, -0.29),
    );
    mesh.add_cube_with_faces(FaceMask::ALL, WHITE, &tall_box, false);

    if with_short_box {
        let short_box = Affine3A::from_scale_rotation_translation(
            Vec3::splat(0.6),
            Quat::from_rotation_y(-0.3),
            Vec3::new(0.3275, 0.3, 0.3725),
        );
        mesh.add_cube_with_faces(FaceMask::ALL, WHITE, &short_box, false);
    }
    mesh
}

/// Offsets of the grid cells, centred on the origin.
fn grid_offsets(side: u32) -> impl Iterator<Item = Vec3> {
    let centre = (side as f32 - 1.0) * 0.5;
    (0..side).flat_map(move |row| {
        (0..side).map(move |column| {
            Vec3::new(
                (column as f32 - centre) * GRID_SPACING,
                (row as f32 - centre) * GRID_SPACING,
                0.0,
            )
        })
    })
}

/// Build a grid of Cornell boxes sharing one light mesh and one box mesh.
///
/// With `use_intersection_functions` the short box is replaced by a procedural
/// sphere, which adds a third geometry and one more instance per cell. Light
/// colors are drawn from `rng`.
pub fn hoist_cornell_box(
    line_up: LineUp,
    use_intersection_functions: bool,
    rng: &mut impl Rng,
) -> Scene {
    let mut scene = Scene::new();
    let side = line_up.side();

    scene.set_viewer(ViewerPose::new(
        Vec3::new(0.0, 1.0, 4.0 + 2.0 * side as f32),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::Y,
    ));

    let light = scene.add_geometry(light_mesh());
    let boxes = scene.add_geometry(box_mesh(!use_intersection_functions));
    let sphere = use_intersection_functions.then(|| {
        let mut spheres = SphereGeometry::new();
        spheres.add_sphere(Vec3::new(0.3275, 0.3, 0.3725), 0.3, WHITE);
        scene.add_geometry(spheres)
    });

    for offset in grid_offsets(side) {
        let transform = Affine3A::from_translation(offset);
        scene.add_instance(Instance::new(light, transform, GEOMETRY_MASK_LIGHT));
        scene.add_instance(Instance::new(boxes, transform, GEOMETRY_MASK_TRIANGLE));
        if let Some(sphere) = sphere {
            scene.add_instance(Instance::new(sphere, transform, GEOMETRY_MASK_SPHERE));
        }

        let color = Vec3::new(rng.gen(), rng.gen(), rng.gen()) * 4.0;
        scene.add_light(AreaLight::new(
            offset + Vec3::new(0.0, LIGHT_HEIGHT, 0.0),
            Vec3::NEG_Y,
            Vec3::new(0.25, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 0.25),
            color,
        ));
    }

    log::debug!(
        "Cornell line-up {}x{}: {} geometries, {} instances, {} lights",
        side,
        side,
        scene.geometries().len(),
        scene.instances().len(),
        scene.lights().len()
    );
    scene
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn three_by_three_places_nine_boxes() {
        let scene = hoist_cornell_box(LineUp::ThreeByThree, false, &mut StdRng::seed_from_u64(1));

        assert_eq!(scene.geometries().len(), 2);
        assert_eq!(scene.instances().len(), 18);
        assert_eq!(scene.lights().len(), 9);
        assert_eq!(scene.viewer().position, Vec3::new(0.0, 1.0, 10.0));
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn grid_is_centred() {
        let offsets: Vec<_> = grid_offsets(2).collect();
        assert_eq!(offsets[0], Vec3::new(-1.25, -1.25, 0.0));
        assert_eq!(offsets[3], Vec3::new(1.25, 1.25, 0.0));
        assert_eq!(grid_offsets(1).next(), Some(Vec3::ZERO));
    }

    #[test]
    fn sphere_variant_adds_procedural_geometry() {
        let scene = hoist_cornell_box(LineUp::TwoByTwo, true, &mut StdRng::seed_from_u64(2));

        assert_eq!(scene.geometries().len(), 3);
        assert_eq!(scene.instances().len(), 12);
        assert!(scene.uses_intersection_functions());
        // The short box becomes the sphere.
        assert_eq!(scene.geometries()[1].primitive_count(), 5 * 2 + 12);
    }

    #[test]
    fn light_colors_are_scaled() {
        let scene = hoist_cornell_box(LineUp::OneByOne, false, &mut StdRng::seed_from_u64(3));
        let light = scene.lights()[0];
        assert_eq!(light.position, Vec3::new(0.0, LIGHT_HEIGHT, 0.0));
        assert!(light.color.max_element() <= 4.0);
        assert!(light.color.min_element() >= 0.0);
    }
}

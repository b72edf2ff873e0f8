//! Bounding volume hierarchy shared by both acceleration structure levels.

use glam::{Affine3A, Vec3A};

/// Primitives per leaf before a node is split.
pub(crate) const MAX_LEAF_PRIMITIVES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Aabb {
    pub min: Vec3A,
    pub max: Vec3A,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3A::splat(f32::INFINITY),
        max: Vec3A::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3A, max: Vec3A) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: &[Vec3A]) -> Self {
        points.iter().fold(Self::EMPTY, |bounds, &p| bounds.grow(p))
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn grow(self, point: Vec3A) -> Self {
        Self {
            min: self.min.min(point),
            max: self.max.max(point),
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn centroid(&self) -> Vec3A {
        (self.min + self.max) * 0.5
    }

    /// Bounds of this box after `transform`, conservative for rotations.
    pub fn transformed(&self, transform: &Affine3A) -> Self {
        if self.is_empty() {
            return Self::EMPTY;
        }
        let mut bounds = Self::EMPTY;
        for corner in 0..8 {
            let point = Vec3A::new(
                if corner & 1 == 0 { self.min.x } else { self.max.x },
                if corner & 2 == 0 { self.min.y } else { self.max.y },
                if corner & 4 == 0 { self.min.z } else { self.max.z },
            );
            bounds = bounds.grow(transform.transform_point3a(point));
        }
        bounds
    }

    /// Slab test; returns the entry distance when the ray overlaps `[t_min, t_max]`.
    pub fn intersect(&self, ray: &Ray, t_max: f32) -> Option<f32> {
        let t0 = (self.min - ray.origin) * ray.inv_direction;
        let t1 = (self.max - ray.origin) * ray.inv_direction;
        let near = t0.min(t1).max_element().max(ray.t_min);
        let far = t0.max(t1).min_element().min(t_max);
        (near <= far).then_some(near)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Ray {
    pub origin: Vec3A,
    pub direction: Vec3A,
    pub inv_direction: Vec3A,
    pub t_min: f32,
    pub t_max: f32,
}

impl Ray {
    pub fn new(origin: Vec3A, direction: Vec3A, t_min: f32, t_max: f32) -> Self {
        Self {
            origin,
            direction,
            inv_direction: direction.recip(),
            t_min,
            t_max,
        }
    }

    /// The same ray in another space. Distances along the ray are preserved
    /// because the direction is not renormalized.
    pub fn transformed(&self, transform: &Affine3A) -> Self {
        Self::new(
            transform.transform_point3a(self.origin),
            transform.transform_vector3a(self.direction),
            self.t_min,
            self.t_max,
        )
    }

    pub fn at(&self, t: f32) -> Vec3A {
        self.origin + self.direction * t
    }
}

/// Outcome of testing one primitive during traversal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Visit {
    Miss,
    /// Accepted hit at this distance; traversal continues with a shorter ray
    Hit(f32),
    /// Stop traversal immediately
    Terminate,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum BvhNode {
    Leaf { bounds: Aabb, first: u32, count: u32 },
    Inner { bounds: Aabb, left: u32, right: u32 },
}

impl BvhNode {
    fn bounds(&self) -> &Aabb {
        match self {
            BvhNode::Leaf { bounds, .. } | BvhNode::Inner { bounds, .. } => bounds,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Bvh {
    nodes: Vec<BvhNode>,
    primitives: Vec<u32>,
}

impl Bvh {
    /// Median split on the longest centroid axis.
    pub fn build(bounds: &[Aabb]) -> Self {
        let mut bvh = Self {
            nodes: Vec::with_capacity(bounds.len().saturating_mul(2)),
            primitives: (0..bounds.len() as u32).collect(),
        };
        if !bounds.is_empty() {
            bvh.build_node(bounds, 0, bounds.len());
        }
        bvh
    }

    fn build_node(&mut self, bounds: &[Aabb], start: usize, end: usize) -> u32 {
        let node_bounds = self.primitives[start..end]
            .iter()
            .fold(Aabb::EMPTY, |acc, &p| acc.union(bounds[p as usize]));
        let index = self.nodes.len() as u32;
        let count = end - start;

        if count <= MAX_LEAF_PRIMITIVES {
            self.nodes.push(BvhNode::Leaf {
                bounds: node_bounds,
                first: start as u32,
                count: count as u32,
            });
            return index;
        }

        let centroids = self.primitives[start..end]
            .iter()
            .fold(Aabb::EMPTY, |acc, &p| acc.grow(bounds[p as usize].centroid()));
        let extent = centroids.max - centroids.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };

        let mid = count / 2;
        self.primitives[start..end].select_nth_unstable_by(mid, |&a, &b| {
            bounds[a as usize].centroid()[axis].total_cmp(&bounds[b as usize].centroid()[axis])
        });

        // Placeholder, patched once both children exist.
        self.nodes.push(BvhNode::Leaf {
            bounds: node_bounds,
            first: 0,
            count: 0,
        });
        let left = self.build_node(bounds, start, start + mid);
        let right = self.build_node(bounds, start + mid, end);
        self.nodes[index as usize] = BvhNode::Inner {
            bounds: node_bounds,
            left,
            right,
        };
        index
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes
            .first()
            .map_or(Aabb::EMPTY, |root| *root.bounds())
    }

    /// Visit primitives whose bounds the ray overlaps, shrinking `t_max` on every
    /// accepted hit. Returns `true` when the visitor terminated the traversal.
    pub fn traverse(
        &self,
        ray: &Ray,
        t_max: &mut f32,
        mut visit: impl FnMut(u32, f32) -> Visit,
    ) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        let mut stack: Vec<u32> = Vec::with_capacity(64);
        stack.push(0);

        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];
            if node.bounds().intersect(ray, *t_max).is_none() {
                continue;
            }
            match *node {
                BvhNode::Leaf { first, count, .. } => {
                    for &primitive in &self.primitives[first as usize..(first + count) as usize] {
                        match visit(primitive, *t_max) {
                            Visit::Miss => {}
                            Visit::Hit(t) => *t_max = t_max.min(t),
                            Visit::Terminate => return true,
                        }
                    }
                }
                BvhNode::Inner { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box_at(x: f32) -> Aabb {
        Aabb::new(Vec3A::new(x, 0.0, 0.0), Vec3A::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn build_splits_until_leaves_are_small() {
        let boxes: Vec<Aabb> = (0..37).map(|i| unit_box_at(i as f32 * 2.0)).collect();
        let bvh = Bvh::build(&boxes);

        let mut leaf_primitives = 0;
        for node in &bvh.nodes {
            if let BvhNode::Leaf { count, .. } = node {
                assert!(*count as usize <= MAX_LEAF_PRIMITIVES);
                leaf_primitives += count;
            }
        }
        assert_eq!(leaf_primitives, 37);
        assert!(bvh.node_count() <= 2 * 37 - 1);
        assert_eq!(bvh.bounds().max.x, 36.0 * 2.0 + 1.0);
    }

    #[test]
    fn traversal_finds_closest_box() {
        let boxes: Vec<Aabb> = (0..10).map(|i| unit_box_at(i as f32 * 2.0)).collect();
        let bvh = Bvh::build(&boxes);
        let ray = Ray::new(
            Vec3A::new(-5.0, 0.5, 0.5),
            Vec3A::X,
            0.0,
            f32::INFINITY,
        );

        let mut t_max = ray.t_max;
        let mut closest = None;
        bvh.traverse(&ray, &mut t_max, |primitive, t_max| {
            match boxes[primitive as usize].intersect(&ray, t_max) {
                Some(t) => {
                    closest = Some(primitive);
                    Visit::Hit(t)
                }
                None => Visit::Miss,
            }
        });

        assert_eq!(closest, Some(0));
        assert_eq!(t_max, 5.0);
    }

    #[test]
    fn terminate_stops_traversal() {
        let boxes: Vec<Aabb> = (0..10).map(|i| unit_box_at(i as f32 * 2.0)).collect();
        let bvh = Bvh::build(&boxes);
        let ray = Ray::new(Vec3A::new(-5.0, 0.5, 0.5), Vec3A::X, 0.0, f32::INFINITY);

        let mut visits = 0;
        let mut t_max = ray.t_max;
        let terminated = bvh.traverse(&ray, &mut t_max, |_, _| {
            visits += 1;
            Visit::Terminate
        });

        assert!(terminated);
        assert_eq!(visits, 1);
    }

    #[test]
    fn empty_hierarchy_misses() {
        let bvh = Bvh::build(&[]);
        let ray = Ray::new(Vec3A::ZERO, Vec3A::X, 0.0, f32::INFINITY);
        let mut t_max = ray.t_max;
        assert!(!bvh.traverse(&ray, &mut t_max, |_, _| Visit::Terminate));
        assert!(bvh.bounds().is_empty());
    }
}

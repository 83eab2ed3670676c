pub mod aabb;
pub mod inertia;
pub mod mesh;
pub mod paged_mesh;

pub use aabb::Aabb;
pub use mesh::TriangleMesh;
pub use paged_mesh::PagedTriangleMesh;

use crate::core::types::Transform;
use glam::{Quat, Vec3};
use std::sync::Arc;

/// Half-space extent used to bound plane shapes in the trees.
const PLANE_AABB_HALF_EXTENT: f32 = 1.0e6;

/// Shared convex polyhedron data: vertices, faces as an offset table into a
/// flat index list, and one outward normal per face. Immutable after
/// construction and shared by reference across bodies and islands.
#[derive(Debug, Clone)]
pub struct ConvexMesh {
    pub vertices: Vec<Vec3>,
    pub face_offsets: Vec<u32>,
    pub face_indices: Vec<u32>,
    pub normals: Vec<Vec3>,
}

impl ConvexMesh {
    pub fn face_count(&self) -> usize {
        self.face_offsets.len()
    }

    pub fn face_vertices(&self, face: usize) -> impl Iterator<Item = Vec3> + '_ {
        let start = self.face_offsets[face] as usize;
        let end = self
            .face_offsets
            .get(face + 1)
            .map(|&o| o as usize)
            .unwrap_or(self.face_indices.len());
        self.face_indices[start..end]
            .iter()
            .map(|&i| self.vertices[i as usize])
    }

    pub fn support_point(&self, dir: Vec3) -> Vec3 {
        let mut best = Vec3::ZERO;
        let mut best_dot = f32::NEG_INFINITY;
        for &v in &self.vertices {
            let d = v.dot(dir);
            if d > best_dot {
                best_dot = d;
                best = v;
            }
        }
        best
    }
}

/// Per-body world-space copy of a polyhedron's vertices and normals,
/// refreshed after integration so narrowphase reads rotated data directly.
#[derive(Debug, Clone, Default)]
pub struct RotatedMesh {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
}

impl RotatedMesh {
    pub fn update(&mut self, mesh: &ConvexMesh, orientation: Quat) {
        self.vertices.clear();
        self.vertices
            .extend(mesh.vertices.iter().map(|&v| orientation * v));
        self.normals.clear();
        self.normals
            .extend(mesh.normals.iter().map(|&n| orientation * n));
    }
}

/// One child of a compound shape, positioned in the compound's object space.
#[derive(Debug, Clone)]
pub struct CompoundChild {
    pub transform: Transform,
    pub shape: Shape,
}

/// Shape variants a body may carry. Cylinders, capsules and the spin axis
/// all run along the body's local x-axis. Meshes are shared by reference.
#[derive(Debug, Clone)]
pub enum Shape {
    Sphere {
        radius: f32,
    },
    /// Half-space `dot(normal, p) <= constant`, with the normal in object
    /// space of the owning body.
    Plane {
        normal: Vec3,
        constant: f32,
    },
    Cylinder {
        radius: f32,
        half_length: f32,
    },
    Capsule {
        radius: f32,
        half_length: f32,
    },
    Box {
        half_extents: Vec3,
    },
    Polyhedron {
        mesh: Arc<ConvexMesh>,
    },
    Compound {
        children: Vec<CompoundChild>,
    },
    Mesh {
        mesh: Arc<TriangleMesh>,
    },
    PagedMesh {
        mesh: Arc<PagedTriangleMesh>,
    },
}

/// Discriminant used to order shape pairs so symmetric collision entries
/// forward to the canonical routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShapeKind {
    Sphere,
    Plane,
    Cylinder,
    Capsule,
    Box,
    Polyhedron,
    Compound,
    Mesh,
    PagedMesh,
}

impl Shape {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Sphere { .. } => ShapeKind::Sphere,
            Shape::Plane { .. } => ShapeKind::Plane,
            Shape::Cylinder { .. } => ShapeKind::Cylinder,
            Shape::Capsule { .. } => ShapeKind::Capsule,
            Shape::Box { .. } => ShapeKind::Box,
            Shape::Polyhedron { .. } => ShapeKind::Polyhedron,
            Shape::Compound { .. } => ShapeKind::Compound,
            Shape::Mesh { .. } => ShapeKind::Mesh,
            Shape::PagedMesh { .. } => ShapeKind::PagedMesh,
        }
    }

    /// Whether the shape has a support function (is convex).
    pub fn is_convex(&self) -> bool {
        !matches!(
            self,
            Shape::Plane { .. } | Shape::Compound { .. } | Shape::Mesh { .. } | Shape::PagedMesh { .. }
        )
    }

    /// Support point in object space for convex variants.
    pub fn support_local(&self, dir: Vec3) -> Vec3 {
        match self {
            Shape::Sphere { radius } => dir.normalize_or_zero() * *radius,
            Shape::Box { half_extents } => Vec3::new(
                half_extents.x.copysign(dir.x),
                half_extents.y.copysign(dir.y),
                half_extents.z.copysign(dir.z),
            ),
            Shape::Cylinder {
                radius,
                half_length,
            } => {
                let lateral = Vec3::new(0.0, dir.y, dir.z);
                let radial = lateral.normalize_or_zero() * *radius;
                Vec3::new(half_length.copysign(dir.x), 0.0, 0.0) + radial
            }
            Shape::Capsule {
                radius,
                half_length,
            } => {
                Vec3::new(half_length.copysign(dir.x), 0.0, 0.0)
                    + dir.normalize_or_zero() * *radius
            }
            Shape::Polyhedron { mesh } => mesh.support_point(dir),
            _ => Vec3::ZERO,
        }
    }

    /// World-space bounds of the shape under `transform`.
    pub fn aabb(&self, transform: &Transform) -> Aabb {
        match self {
            Shape::Sphere { radius } => Aabb::new(
                transform.position - Vec3::splat(*radius),
                transform.position + Vec3::splat(*radius),
            ),
            Shape::Plane { .. } => Aabb::new(
                Vec3::splat(-PLANE_AABB_HALF_EXTENT),
                Vec3::splat(PLANE_AABB_HALF_EXTENT),
            ),
            Shape::Box { .. }
            | Shape::Cylinder { .. }
            | Shape::Capsule { .. }
            | Shape::Polyhedron { .. } => {
                let mut bounds = Aabb::empty();
                for axis in [Vec3::X, Vec3::Y, Vec3::Z] {
                    let local = transform.orientation.conjugate() * axis;
                    let hi = transform.to_world(self.support_local(local));
                    let lo = transform.to_world(self.support_local(-local));
                    bounds.extend(hi);
                    bounds.extend(lo);
                }
                bounds
            }
            Shape::Compound { children } => {
                let mut bounds = Aabb::empty();
                for child in children {
                    let child_world = transform.combine(&child.transform);
                    bounds = bounds.union(&child.shape.aabb(&child_world));
                }
                bounds
            }
            Shape::Mesh { mesh } => local_bounds_to_world(mesh.bounds(), transform),
            Shape::PagedMesh { mesh } => local_bounds_to_world(mesh.bounds(), transform),
        }
    }
}

fn local_bounds_to_world(bounds: Aabb, transform: &Transform) -> Aabb {
    let mut out = Aabb::empty();
    for i in 0..8 {
        let corner = Vec3::new(
            if i & 1 == 0 { bounds.min.x } else { bounds.max.x },
            if i & 2 == 0 { bounds.min.y } else { bounds.max.y },
            if i & 4 == 0 { bounds.min.z } else { bounds.max.z },
        );
        out.extend(transform.to_world(corner));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn box_aabb_grows_under_rotation() {
        let shape = Shape::Box {
            half_extents: Vec3::new(1.0, 0.5, 0.5),
        };
        let axis_aligned = shape.aabb(&Transform::default());
        assert!((axis_aligned.max.x - 1.0).abs() < 1e-5);

        let rotated = shape.aabb(&Transform::new(
            Vec3::ZERO,
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_4),
        ));
        assert!(rotated.max.x > 1.0);
        assert!(rotated.max.y > 0.5);
    }

    #[test]
    fn capsule_support_includes_cap() {
        let shape = Shape::Capsule {
            radius: 0.5,
            half_length: 1.0,
        };
        let tip = shape.support_local(Vec3::X);
        assert!((tip.x - 1.5).abs() < 1e-5);
    }

    #[test]
    fn compound_aabb_covers_children() {
        let shape = Shape::Compound {
            children: vec![
                CompoundChild {
                    transform: Transform::from_position(Vec3::new(-1.0, 0.0, 0.0)),
                    shape: Shape::Sphere { radius: 0.5 },
                },
                CompoundChild {
                    transform: Transform::from_position(Vec3::new(1.0, 0.0, 0.0)),
                    shape: Shape::Sphere { radius: 0.5 },
                },
            ],
        };
        let bounds = shape.aabb(&Transform::default());
        assert!((bounds.min.x + 1.5).abs() < 1e-5);
        assert!((bounds.max.x - 1.5).abs() < 1e-5);
    }
}

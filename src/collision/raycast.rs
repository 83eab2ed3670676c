//! Segment queries: the broadphase trees prune candidates, then each hit
//! candidate's shape is intersected exactly. Fractions are measured along
//! `p0..p1`.

use crate::core::registry::Registry;
use crate::core::types::Transform;
use crate::shapes::{Shape, TriangleMesh};
use crate::utils::allocator::EntityId;
use glam::Vec3;

const EPSILON: f32 = 1e-9;

/// Result of a segment query.
#[derive(Debug, Clone, Copy)]
pub struct RaycastHit {
    pub entity: EntityId,
    /// Fraction along the segment at the entry point.
    pub fraction: f32,
    pub point: Vec3,
    pub normal: Vec3,
    /// Compound child index or triangle index, when applicable.
    pub feature: Option<u32>,
}

/// Casts a segment through the world and returns the nearest hit.
pub fn raycast(registry: &Registry, p0: Vec3, p1: Vec3) -> Option<RaycastHit> {
    let mut candidates = Vec::new();
    registry
        .broadphase
        .query_segment(p0, p1, |entity| candidates.push(entity));

    let mut best: Option<RaycastHit> = None;
    for entity in candidates {
        let Some(body) = registry.bodies.get(entity) else {
            continue;
        };
        if let Some((fraction, normal, feature)) =
            raycast_shape(&body.shape, &body.transform, p0, p1)
        {
            if best.map(|b| fraction < b.fraction).unwrap_or(true) {
                best = Some(RaycastHit {
                    entity,
                    fraction,
                    point: p0 + (p1 - p0) * fraction,
                    normal,
                    feature,
                });
            }
        }
    }
    best
}

/// Shape-level segment intersection: fraction, world normal, feature.
pub fn raycast_shape(
    shape: &Shape,
    transform: &Transform,
    p0: Vec3,
    p1: Vec3,
) -> Option<(f32, Vec3, Option<u32>)> {
    let local_p0 = transform.to_local(p0);
    let local_p1 = transform.to_local(p1);

    match shape {
        Shape::Sphere { radius } => {
            let (t, normal) = ray_sphere(local_p0, local_p1, *radius)?;
            Some((t, transform.orientation * normal, None))
        }
        Shape::Plane { normal, constant } => {
            let d0 = normal.dot(local_p0) - constant;
            let d1 = normal.dot(local_p1) - constant;
            if d0 < 0.0 || d0 - d1 < EPSILON {
                return None;
            }
            let t = d0 / (d0 - d1);
            if !(0.0..=1.0).contains(&t) {
                return None;
            }
            Some((t, transform.orientation * *normal, None))
        }
        Shape::Box { half_extents } => {
            let (t, normal) = ray_box(local_p0, local_p1, *half_extents)?;
            Some((t, transform.orientation * normal, None))
        }
        Shape::Cylinder {
            radius,
            half_length,
        } => {
            let (t, normal) = ray_cylinder(local_p0, local_p1, *radius, *half_length)?;
            Some((t, transform.orientation * normal, None))
        }
        Shape::Capsule {
            radius,
            half_length,
        } => {
            let (t, normal) = ray_capsule(local_p0, local_p1, *radius, *half_length)?;
            Some((t, transform.orientation * normal, None))
        }
        Shape::Polyhedron { mesh } => {
            let (t, normal) = ray_convex(local_p0, local_p1, mesh)?;
            Some((t, transform.orientation * normal, None))
        }
        Shape::Compound { children } => {
            let mut best: Option<(f32, Vec3, Option<u32>)> = None;
            for (index, child) in children.iter().enumerate() {
                let child_world = transform.combine(&child.transform);
                if let Some((t, normal, _)) = raycast_shape(&child.shape, &child_world, p0, p1) {
                    if best.map(|b| t < b.0).unwrap_or(true) {
                        best = Some((t, normal, Some(index as u32)));
                    }
                }
            }
            best
        }
        Shape::Mesh { mesh } => {
            let (t, normal, tri) = ray_mesh(local_p0, local_p1, mesh)?;
            Some((t, transform.orientation * normal, Some(tri)))
        }
        Shape::PagedMesh { mesh } => {
            let mut best: Option<(f32, Vec3, Option<u32>)> = None;
            mesh.visit_triangles_segment(local_p0, local_p1, |_, submesh, tri| {
                let verts = submesh.triangle_vertices(tri);
                if let Some(t) = ray_triangle(local_p0, local_p1, &verts) {
                    if best.map(|b| t < b.0).unwrap_or(true) {
                        let normal = submesh.triangle_normal(tri);
                        best = Some((t, transform.orientation * normal, Some(tri as u32)));
                    }
                }
            });
            best
        }
    }
}

fn ray_sphere(p0: Vec3, p1: Vec3, radius: f32) -> Option<(f32, Vec3)> {
    let d = p1 - p0;
    let a = d.length_squared();
    if a < EPSILON {
        return None;
    }
    let b = 2.0 * p0.dot(d);
    let c = p0.length_squared() - radius * radius;
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / (2.0 * a);
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let point = p0 + d * t;
    Some((t, point.normalize_or_zero()))
}

fn ray_box(p0: Vec3, p1: Vec3, half_extents: Vec3) -> Option<(f32, Vec3)> {
    let d = p1 - p0;
    let mut t_min = 0.0f32;
    let mut t_max = 1.0f32;
    let mut normal = Vec3::ZERO;

    for axis in 0..3 {
        if d[axis].abs() < EPSILON {
            if p0[axis].abs() > half_extents[axis] {
                return None;
            }
        } else {
            let inv = 1.0 / d[axis];
            let mut t0 = (-half_extents[axis] - p0[axis]) * inv;
            let mut t1 = (half_extents[axis] - p0[axis]) * inv;
            let mut axis_normal = Vec3::ZERO;
            axis_normal[axis] = -d[axis].signum();
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
                axis_normal = -axis_normal;
            }
            if t0 > t_min {
                t_min = t0;
                normal = axis_normal;
            }
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }
    }

    if normal == Vec3::ZERO {
        // Segment starts inside.
        return None;
    }
    Some((t_min, normal))
}

/// Cylinder along local x: quadratic on the lateral distance plus cap
/// discs.
fn ray_cylinder(p0: Vec3, p1: Vec3, radius: f32, half_length: f32) -> Option<(f32, Vec3)> {
    let d = p1 - p0;
    let mut best: Option<(f32, Vec3)> = None;

    // Lateral surface.
    let a = d.y * d.y + d.z * d.z;
    if a > EPSILON {
        let b = 2.0 * (p0.y * d.y + p0.z * d.z);
        let c = p0.y * p0.y + p0.z * p0.z - radius * radius;
        let disc = b * b - 4.0 * a * c;
        if disc >= 0.0 {
            let t = (-b - disc.sqrt()) / (2.0 * a);
            if (0.0..=1.0).contains(&t) {
                let hit = p0 + d * t;
                if hit.x.abs() <= half_length {
                    best = Some((t, Vec3::new(0.0, hit.y, hit.z).normalize_or_zero()));
                }
            }
        }
    }

    // Cap discs.
    if d.x.abs() > EPSILON {
        for sign in [-1.0f32, 1.0] {
            let plane_x = sign * half_length;
            let t = (plane_x - p0.x) / d.x;
            if !(0.0..=1.0).contains(&t) {
                continue;
            }
            let hit = p0 + d * t;
            if hit.y * hit.y + hit.z * hit.z <= radius * radius
                && best.map(|b| t < b.0).unwrap_or(true)
            {
                best = Some((t, Vec3::new(sign, 0.0, 0.0)));
            }
        }
    }

    best
}

fn ray_capsule(p0: Vec3, p1: Vec3, radius: f32, half_length: f32) -> Option<(f32, Vec3)> {
    let mut best = ray_cylinder(p0, p1, radius, half_length).filter(|(t, _)| {
        let hit = p0 + (p1 - p0) * *t;
        hit.x.abs() <= half_length
    });

    for sign in [-1.0f32, 1.0] {
        let center = Vec3::new(sign * half_length, 0.0, 0.0);
        if let Some((t, normal)) = ray_sphere(p0 - center, p1 - center, radius) {
            if best.map(|b| t < b.0).unwrap_or(true) {
                best = Some((t, normal));
            }
        }
    }
    best
}

/// Clips the segment against every face half-space of the convex hull.
fn ray_convex(p0: Vec3, p1: Vec3, mesh: &crate::shapes::ConvexMesh) -> Option<(f32, Vec3)> {
    let d = p1 - p0;
    let mut t_min = 0.0f32;
    let mut t_max = 1.0f32;
    let mut entry_normal = Vec3::ZERO;

    for face in 0..mesh.face_count() {
        let normal = mesh.normals[face];
        let on_face = mesh.face_vertices(face).next()?;
        let dist0 = normal.dot(p0 - on_face);
        let denom = normal.dot(d);

        if denom.abs() < EPSILON {
            if dist0 > 0.0 {
                return None;
            }
            continue;
        }
        let t = -dist0 / denom;
        if denom < 0.0 {
            // Entering.
            if t > t_min {
                t_min = t;
                entry_normal = normal;
            }
        } else if t < t_max {
            t_max = t;
        }
        if t_min > t_max {
            return None;
        }
    }

    if entry_normal == Vec3::ZERO {
        return None;
    }
    Some((t_min, entry_normal))
}

fn ray_mesh(p0: Vec3, p1: Vec3, mesh: &TriangleMesh) -> Option<(f32, Vec3, u32)> {
    let mut best: Option<(f32, Vec3, u32)> = None;
    mesh.visit_triangles_segment(p0, p1, |tri| {
        let verts = mesh.triangle_vertices(tri);
        if let Some(t) = ray_triangle(p0, p1, &verts) {
            if best.map(|b| t < b.0).unwrap_or(true) {
                best = Some((t, mesh.triangle_normal(tri), tri as u32));
            }
        }
    });
    best
}

/// Möller-Trumbore over the segment `p0..p1`.
fn ray_triangle(p0: Vec3, p1: Vec3, tri: &[Vec3; 3]) -> Option<f32> {
    let d = p1 - p0;
    let edge1 = tri[1] - tri[0];
    let edge2 = tri[2] - tri[0];
    let h = d.cross(edge2);
    let a = edge1.dot(h);
    if a.abs() < EPSILON {
        return None;
    }
    let f = 1.0 / a;
    let s = p0 - tri[0];
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = f * d.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = f * edge2.dot(q);
    if (0.0..=1.0).contains(&t) {
        Some(t)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_hits_sphere_at_quarter() {
        let shape = Shape::Sphere { radius: 0.5 };
        let transform = Transform::from_position(Vec3::new(0.0, 0.0, 0.0));
        let (t, normal, _) = raycast_shape(
            &shape,
            &transform,
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
        )
        .unwrap();
        assert!((t - 0.25).abs() < 1e-5);
        assert!(normal.x < -0.99);
    }

    #[test]
    fn oriented_box_is_hit_in_local_space() {
        let shape = Shape::Box {
            half_extents: Vec3::new(0.5, 0.25, 0.25),
        };
        let transform = Transform::new(
            Vec3::ZERO,
            glam::Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
        );
        // The box's long axis now points along +y.
        let hit = raycast_shape(
            &shape,
            &transform,
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(0.0, -2.0, 0.0),
        );
        let (t, _, _) = hit.unwrap();
        assert!((t - (2.0 - 0.5) / 4.0).abs() < 1e-4);
    }

    #[test]
    fn compound_reports_child_index() {
        let shape = Shape::Compound {
            children: vec![
                crate::shapes::CompoundChild {
                    transform: Transform::from_position(Vec3::new(-1.0, 0.0, 0.0)),
                    shape: Shape::Cylinder {
                        radius: 0.5,
                        half_length: 0.5,
                    },
                },
                crate::shapes::CompoundChild {
                    transform: Transform::from_position(Vec3::new(1.0, 0.0, 0.0)),
                    shape: Shape::Cylinder {
                        radius: 0.5,
                        half_length: 0.5,
                    },
                },
            ],
        };
        let (t, _, feature) = raycast_shape(
            &shape,
            &Transform::default(),
            Vec3::new(-2.0, 0.1, 0.0),
            Vec3::new(2.0, 0.1, 0.0),
        )
        .unwrap();
        // The left cylinder's cap sits at x = -1.5.
        assert!((t - 0.125).abs() < 1e-4);
        assert_eq!(feature, Some(0));
    }
}

//! Closest-feature routines per shape pair. The entry point dispatches over
//! the two shape variants; symmetric pairs forward to the canonical routine
//! and swap the A/B fields of its output. Degenerate configurations fall
//! back to documented axes and never fail: they just yield no candidates.

use super::contact::{CollidePoint, CollisionResult, NormalAttachment};
use super::gjk;
use crate::core::types::Transform;
use crate::shapes::{Shape, TriangleMesh};
use glam::Vec3;

const EPSILON: f32 = 1e-6;

/// Computes up to four candidate contact points between two shapes, in each
/// body's object space. `margin` is the separation threshold below which
/// non-penetrating candidates are still reported.
pub fn collide(
    shape_a: &Shape,
    transform_a: &Transform,
    shape_b: &Shape,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    // Canonical ordering: the lower shape kind plays A.
    if shape_a.kind() > shape_b.kind() {
        return collide(shape_b, transform_b, shape_a, transform_a, margin).swapped();
    }

    match (shape_a, shape_b) {
        (Shape::Sphere { radius: ra }, Shape::Sphere { radius: rb }) => {
            sphere_sphere(*ra, transform_a, *rb, transform_b, margin)
        }
        (Shape::Sphere { radius }, Shape::Plane { normal, constant }) => {
            sphere_plane(*radius, transform_a, *normal, *constant, transform_b, margin)
        }
        (Shape::Sphere { radius }, Shape::Cylinder { .. }) => {
            sphere_convex(*radius, transform_a, shape_b, transform_b, margin)
        }
        (Shape::Sphere { radius: rs }, Shape::Capsule { radius, half_length }) => {
            sphere_capsule(*rs, transform_a, *radius, *half_length, transform_b, margin)
        }
        (Shape::Sphere { radius }, Shape::Box { half_extents }) => {
            sphere_box(*radius, transform_a, *half_extents, transform_b, margin)
        }
        (Shape::Plane { normal, constant }, _) => {
            plane_any(*normal, *constant, transform_a, shape_b, transform_b, margin).swapped()
        }
        (Shape::Capsule { radius: ra, half_length: la }, Shape::Capsule { radius: rb, half_length: lb }) => {
            capsule_capsule(*ra, *la, transform_a, *rb, *lb, transform_b, margin)
        }
        (_, Shape::Compound { children }) => {
            compound_any(children, transform_b, shape_a, transform_a, margin).swapped()
        }
        (Shape::Compound { children }, _) => {
            compound_any(children, transform_a, shape_b, transform_b, margin)
        }
        (_, Shape::Mesh { mesh }) => {
            convex_mesh(shape_a, transform_a, mesh, transform_b, margin)
        }
        (_, Shape::PagedMesh { mesh }) => {
            let mut result = CollisionResult::default();
            if !shape_a.is_convex() {
                return result;
            }
            let query = shape_a.aabb(transform_a).inflated(margin);
            let local_query = world_aabb_to_local(&query, transform_b);
            mesh.visit_triangles(&local_query, |_, submesh, tri| {
                collide_convex_triangle(
                    shape_a,
                    transform_a,
                    submesh,
                    tri,
                    transform_b,
                    margin,
                    &mut result,
                );
            });
            result
        }
        _ => {
            // Remaining convex-convex pairs share the GJK path.
            if shape_a.is_convex() && shape_b.is_convex() {
                convex_convex(shape_a, transform_a, shape_b, transform_b)
            } else {
                CollisionResult::default()
            }
        }
    }
}

fn point(
    pivot_a: Vec3,
    pivot_b: Vec3,
    normal: Vec3,
    local_normal: Vec3,
    attachment: NormalAttachment,
    distance: f32,
) -> CollidePoint {
    CollidePoint {
        pivot_a,
        pivot_b,
        normal,
        local_normal,
        normal_attachment: attachment,
        distance,
        feature: None,
    }
}

fn sphere_sphere(
    radius_a: f32,
    transform_a: &Transform,
    radius_b: f32,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    let delta = transform_a.position - transform_b.position;
    let center_dist = delta.length();
    let distance = center_dist - radius_a - radius_b;
    if distance > margin {
        return result;
    }

    // Coincident centers: push apart along +y.
    let normal = if center_dist > EPSILON {
        delta / center_dist
    } else {
        Vec3::Y
    };

    let pivot_a = transform_a.to_local(transform_a.position - normal * radius_a);
    let pivot_b = transform_b.to_local(transform_b.position + normal * radius_b);
    result.push(point(
        pivot_a,
        pivot_b,
        normal,
        normal,
        NormalAttachment::None,
        distance,
    ));
    result
}

fn sphere_plane(
    radius: f32,
    transform_a: &Transform,
    plane_normal: Vec3,
    plane_constant: f32,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    let normal = transform_b.orientation * plane_normal;
    let plane_point = transform_b.to_world(plane_normal * plane_constant);
    let distance = normal.dot(transform_a.position - plane_point) - radius;
    if distance > margin {
        return result;
    }

    let contact_on_a = transform_a.position - normal * radius;
    let contact_on_b = contact_on_a - normal * distance;
    result.push(point(
        transform_a.to_local(contact_on_a),
        transform_b.to_local(contact_on_b),
        normal,
        plane_normal,
        NormalAttachment::BodyB,
        distance,
    ));
    result
}

fn sphere_capsule(
    sphere_radius: f32,
    transform_a: &Transform,
    capsule_radius: f32,
    half_length: f32,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let axis = transform_b.orientation * Vec3::X;
    let p0 = transform_b.position - axis * half_length;
    let p1 = transform_b.position + axis * half_length;
    let closest = closest_point_on_segment(p0, p1, transform_a.position);

    let mut result = CollisionResult::default();
    let delta = transform_a.position - closest;
    let center_dist = delta.length();
    let distance = center_dist - sphere_radius - capsule_radius;
    if distance > margin {
        return result;
    }

    let normal = if center_dist > EPSILON {
        delta / center_dist
    } else {
        // Sphere center on the capsule axis: any radial direction works.
        let mut radial = axis.cross(Vec3::Y);
        if radial.length_squared() < EPSILON {
            radial = axis.cross(Vec3::Z);
        }
        radial.normalize()
    };

    let pivot_a = transform_a.to_local(transform_a.position - normal * sphere_radius);
    let pivot_b = transform_b.to_local(closest + normal * capsule_radius);
    result.push(point(
        pivot_a,
        pivot_b,
        normal,
        normal,
        NormalAttachment::None,
        distance,
    ));
    result
}

fn sphere_box(
    radius: f32,
    transform_a: &Transform,
    half_extents: Vec3,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    let center_local = transform_b.to_local(transform_a.position);
    let clamped = center_local.clamp(-half_extents, half_extents);

    let (closest_local, normal_local, distance) = if clamped == center_local {
        // Center inside the box: exit through the nearest face.
        let face_dist = half_extents - center_local.abs();
        let axis = if face_dist.x <= face_dist.y && face_dist.x <= face_dist.z {
            0
        } else if face_dist.y <= face_dist.z {
            1
        } else {
            2
        };
        let mut normal = Vec3::ZERO;
        normal[axis] = center_local[axis].signum();
        if normal[axis] == 0.0 {
            normal[axis] = 1.0;
        }
        let mut surface = center_local;
        surface[axis] = half_extents[axis] * normal[axis];
        (surface, normal, -(face_dist[axis] + radius))
    } else {
        let delta = center_local - clamped;
        let dist = delta.length();
        (clamped, delta / dist, dist - radius)
    };

    if distance > margin {
        return result;
    }

    let normal = transform_b.orientation * normal_local;
    let pivot_a = transform_a.to_local(transform_a.position - normal * radius);
    result.push(point(
        pivot_a,
        closest_local,
        normal,
        normal_local,
        NormalAttachment::BodyB,
        distance,
    ));
    result
}

/// Sphere against cylinder via closest point on the cylinder's surface.
fn sphere_convex(
    radius: f32,
    transform_a: &Transform,
    shape_b: &Shape,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    let Shape::Cylinder {
        radius: cyl_radius,
        half_length,
    } = shape_b
    else {
        return convex_convex(&Shape::Sphere { radius }, transform_a, shape_b, transform_b);
    };

    let center_local = transform_b.to_local(transform_a.position);
    let lateral = Vec3::new(0.0, center_local.y, center_local.z);
    let lateral_len = lateral.length();
    let outside = center_local.x.abs() > *half_length || lateral_len > *cyl_radius;

    let on_surface_local = if outside {
        let axial = center_local.x.clamp(-*half_length, *half_length);
        let radial = if lateral_len > *cyl_radius {
            lateral * (*cyl_radius / lateral_len)
        } else {
            lateral
        };
        Vec3::new(axial, radial.y, radial.z)
    } else {
        // Inside: project to the nearer of cap or wall. A center on the
        // axis defaults to the +y wall direction.
        let wall_dist = *cyl_radius - lateral_len;
        let cap_dist = *half_length - center_local.x.abs();
        if cap_dist < wall_dist {
            Vec3::new(
                half_length.copysign(center_local.x),
                center_local.y,
                center_local.z,
            )
        } else {
            let radial = if lateral_len > EPSILON {
                lateral * (*cyl_radius / lateral_len)
            } else {
                Vec3::new(0.0, *cyl_radius, 0.0)
            };
            Vec3::new(center_local.x, radial.y, radial.z)
        }
    };

    let closest_world = transform_b.to_world(on_surface_local);
    let delta = transform_a.position - closest_world;
    let dist = delta.length();
    let distance = if outside { dist - radius } else { -(dist + radius) };
    if distance > margin {
        return result;
    }

    let normal = if dist > EPSILON {
        let dir = delta / dist;
        if outside {
            dir
        } else {
            -dir
        }
    } else {
        transform_b.orientation * Vec3::Y
    };

    let pivot_a = transform_a.to_local(transform_a.position - normal * radius);
    result.push(point(
        pivot_a,
        on_surface_local,
        normal,
        transform_b.orientation.conjugate() * normal,
        NormalAttachment::BodyB,
        distance,
    ));
    result
}

/// Plane as body A against any convex or compound body B. Produces one
/// candidate per deep support corner, so flat resting shapes get a stable
/// multi-point base.
fn plane_any(
    plane_normal: Vec3,
    plane_constant: f32,
    transform_a: &Transform,
    shape_b: &Shape,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    let normal = transform_a.orientation * plane_normal;
    let plane_point = transform_a.to_world(plane_normal * plane_constant);

    match shape_b {
        Shape::Sphere { .. } | Shape::Capsule { .. } | Shape::Cylinder { .. } | Shape::Box { .. } | Shape::Polyhedron { .. } => {
            for support_local in deep_points_towards(shape_b, transform_b, -normal) {
                let world = transform_b.to_world(support_local);
                let distance = normal.dot(world - plane_point);
                if distance > margin {
                    continue;
                }
                let on_plane = world - normal * distance;
                result.push(point(
                    transform_a.to_local(on_plane),
                    support_local,
                    -normal,
                    -plane_normal,
                    NormalAttachment::BodyA,
                    distance,
                ));
            }
        }
        Shape::Compound { children } => {
            for (index, child) in children.iter().enumerate() {
                let child_world = transform_b.combine(&child.transform);
                let plane = Shape::Plane {
                    normal: plane_normal,
                    constant: plane_constant,
                };
                let child_result =
                    collide(&plane, transform_a, &child.shape, &child_world, margin);
                for candidate in child_result.iter() {
                    let mut candidate = *candidate;
                    candidate.pivot_b =
                        child.transform.to_world(candidate.pivot_b);
                    candidate.feature = Some(index as u32);
                    result.push(candidate);
                }
            }
        }
        _ => {}
    }

    result
}

/// Object-space points of `shape` deepest along the world direction `dir`:
/// the support point plus any other extreme points within the support
/// feature tolerance, capped at four.
fn deep_points_towards(shape: &Shape, transform: &Transform, dir: Vec3) -> Vec<Vec3> {
    use crate::config::SUPPORT_FEATURE_TOLERANCE;

    let local_dir = transform.orientation.conjugate() * dir;
    match shape {
        Shape::Sphere { .. } => vec![shape.support_local(local_dir)],
        Shape::Capsule {
            radius,
            half_length,
        } => {
            if local_dir.x.abs() < SUPPORT_FEATURE_TOLERANCE {
                // Lying flat: both cap ends rest.
                let radial = local_dir.normalize_or_zero() * *radius;
                vec![
                    Vec3::new(*half_length, 0.0, 0.0) + radial,
                    Vec3::new(-*half_length, 0.0, 0.0) + radial,
                ]
            } else {
                vec![shape.support_local(local_dir)]
            }
        }
        Shape::Box { half_extents } => {
            let support = shape.support_local(local_dir);
            let mut points = Vec::with_capacity(4);
            for i in 0..8 {
                let corner = Vec3::new(
                    if i & 1 == 0 { half_extents.x } else { -half_extents.x },
                    if i & 2 == 0 { half_extents.y } else { -half_extents.y },
                    if i & 4 == 0 { half_extents.z } else { -half_extents.z },
                );
                if (support - corner).dot(local_dir) <= SUPPORT_FEATURE_TOLERANCE
                    && points.len() < 4
                {
                    points.push(corner);
                }
            }
            points
        }
        Shape::Cylinder {
            radius,
            half_length,
        } => {
            let lateral = Vec3::new(0.0, local_dir.y, local_dir.z);
            let lateral_len = lateral.length();
            if lateral_len < EPSILON {
                // Axis parallel to the direction: the cap face rests. Emit
                // four rim points of the deep cap.
                let x = half_length.copysign(local_dir.x);
                vec![
                    Vec3::new(x, *radius, 0.0),
                    Vec3::new(x, -*radius, 0.0),
                    Vec3::new(x, 0.0, *radius),
                    Vec3::new(x, 0.0, -*radius),
                ]
            } else {
                let radial = lateral / lateral_len * *radius;
                if local_dir.x.abs() < SUPPORT_FEATURE_TOLERANCE {
                    // Lying flat: both rim ends touch.
                    vec![
                        Vec3::new(*half_length, radial.y, radial.z),
                        Vec3::new(-*half_length, radial.y, radial.z),
                    ]
                } else {
                    vec![Vec3::new(half_length.copysign(local_dir.x), radial.y, radial.z)]
                }
            }
        }
        Shape::Polyhedron { mesh } => {
            let support = mesh.support_point(local_dir);
            let mut points = Vec::with_capacity(4);
            for &v in &mesh.vertices {
                if (support - v).dot(local_dir) <= SUPPORT_FEATURE_TOLERANCE && points.len() < 4 {
                    points.push(v);
                }
            }
            points
        }
        _ => Vec::new(),
    }
}

fn capsule_capsule(
    radius_a: f32,
    half_length_a: f32,
    transform_a: &Transform,
    radius_b: f32,
    half_length_b: f32,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let axis_a = transform_a.orientation * Vec3::X;
    let axis_b = transform_b.orientation * Vec3::X;
    let (pa, pb) = closest_points_between_segments(
        transform_a.position - axis_a * half_length_a,
        transform_a.position + axis_a * half_length_a,
        transform_b.position - axis_b * half_length_b,
        transform_b.position + axis_b * half_length_b,
    );

    let mut result = CollisionResult::default();
    let delta = pa - pb;
    let center_dist = delta.length();
    let distance = center_dist - radius_a - radius_b;
    if distance > margin {
        return result;
    }

    // Near-parallel overlapping axes collapse to a single closest pair; the
    // cross-axis fallback keeps the normal stable.
    let normal = if center_dist > EPSILON {
        delta / center_dist
    } else {
        let fallback = axis_a.cross(axis_b);
        if fallback.length_squared() > EPSILON {
            fallback.normalize()
        } else {
            axis_a.cross(Vec3::Y).normalize_or_zero()
        }
    };

    result.push(point(
        transform_a.to_local(pa - normal * radius_a),
        transform_b.to_local(pb + normal * radius_b),
        normal,
        normal,
        NormalAttachment::None,
        distance,
    ));
    result
}

/// Compound as body A: collide each positioned child against B and tag
/// candidates with the child index.
fn compound_any(
    children: &[crate::shapes::CompoundChild],
    transform_a: &Transform,
    shape_b: &Shape,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    for (index, child) in children.iter().enumerate() {
        let child_world = transform_a.combine(&child.transform);
        let child_result = collide(&child.shape, &child_world, shape_b, transform_b, margin);
        for candidate in child_result.iter() {
            let mut candidate = *candidate;
            // Lift the pivot from child space into compound space.
            candidate.pivot_a = child.transform.to_world(candidate.pivot_a);
            candidate.feature = Some(index as u32);
            result.push(candidate);
        }
    }
    result
}

/// Convex body A against a triangle mesh B: query the mesh tree with A's
/// bounds in mesh space and collide against each overlapping triangle.
fn convex_mesh(
    shape_a: &Shape,
    transform_a: &Transform,
    mesh: &TriangleMesh,
    transform_b: &Transform,
    margin: f32,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    if !shape_a.is_convex() {
        return result;
    }
    let query = shape_a.aabb(transform_a).inflated(margin);
    let local_query = world_aabb_to_local(&query, transform_b);
    mesh.visit_triangles(&local_query, |tri| {
        collide_convex_triangle(shape_a, transform_a, mesh, tri, transform_b, margin, &mut result);
    });
    result
}

fn collide_convex_triangle(
    shape_a: &Shape,
    transform_a: &Transform,
    mesh: &TriangleMesh,
    tri: usize,
    transform_b: &Transform,
    margin: f32,
    result: &mut CollisionResult,
) {
    let local = mesh.triangle_vertices(tri);
    let world = [
        transform_b.to_world(local[0]),
        transform_b.to_world(local[1]),
        transform_b.to_world(local[2]),
    ];
    let tri_normal = transform_b.orientation * mesh.triangle_normal(tri);

    if let Shape::Sphere { radius } = shape_a {
        sphere_triangle(
            *radius,
            transform_a,
            &world,
            tri_normal,
            transform_b,
            margin,
            result,
        );
        return;
    }

    if let Some(pen) = gjk::intersect_triangle(shape_a, transform_a, &world) {
        let mut normal = -pen.normal;
        // Never report a normal pointing into the mesh surface.
        if normal.dot(tri_normal) < 0.0 {
            normal = tri_normal;
        }
        let point_b = pen.point_a - normal * pen.depth;
        result.push(CollidePoint {
            pivot_a: transform_a.to_local(pen.point_a),
            pivot_b: transform_b.to_local(point_b),
            normal,
            local_normal: transform_b.orientation.conjugate() * normal,
            normal_attachment: NormalAttachment::BodyB,
            distance: -pen.depth,
            feature: Some(tri as u32),
        });
    }
}

fn sphere_triangle(
    radius: f32,
    transform_a: &Transform,
    triangle: &[Vec3; 3],
    tri_normal: Vec3,
    transform_b: &Transform,
    margin: f32,
    result: &mut CollisionResult,
) {
    let center = transform_a.position;
    let closest = closest_point_on_triangle(triangle, center);
    let delta = center - closest;
    let dist = delta.length();
    let distance = dist - radius;
    if distance > margin {
        return;
    }

    let normal = if dist > EPSILON {
        delta / dist
    } else {
        tri_normal
    };
    // Reject back-face contacts.
    if normal.dot(tri_normal) < 0.0 {
        return;
    }

    result.push(CollidePoint {
        pivot_a: transform_a.to_local(center - normal * radius),
        pivot_b: transform_b.to_local(closest),
        normal,
        local_normal: transform_b.orientation.conjugate() * normal,
        normal_attachment: NormalAttachment::BodyB,
        distance,
        feature: None,
    });
}

/// General convex pair through GJK/EPA: one candidate per step; the
/// persistent manifold accumulates a full contact set over a few steps.
fn convex_convex(
    shape_a: &Shape,
    transform_a: &Transform,
    shape_b: &Shape,
    transform_b: &Transform,
) -> CollisionResult {
    let mut result = CollisionResult::default();
    if let Some(pen) = gjk::intersect(shape_a, transform_a, shape_b, transform_b) {
        let normal = -pen.normal;
        let point_b = pen.point_a - normal * pen.depth;
        result.push(point(
            transform_a.to_local(pen.point_a),
            transform_b.to_local(point_b),
            normal,
            normal,
            NormalAttachment::None,
            -pen.depth,
        ));
    }
    result
}

fn world_aabb_to_local(aabb: &crate::shapes::Aabb, transform: &Transform) -> crate::shapes::Aabb {
    let mut out = crate::shapes::Aabb::empty();
    for i in 0..8 {
        let corner = Vec3::new(
            if i & 1 == 0 { aabb.min.x } else { aabb.max.x },
            if i & 2 == 0 { aabb.min.y } else { aabb.max.y },
            if i & 4 == 0 { aabb.min.z } else { aabb.max.z },
        );
        out.extend(transform.to_local(corner));
    }
    out
}

fn closest_point_on_segment(p0: Vec3, p1: Vec3, point: Vec3) -> Vec3 {
    let axis = p1 - p0;
    let len_sq = axis.length_squared();
    if len_sq < EPSILON {
        return p0;
    }
    let t = ((point - p0).dot(axis) / len_sq).clamp(0.0, 1.0);
    p0 + axis * t
}

fn closest_points_between_segments(p0: Vec3, p1: Vec3, q0: Vec3, q1: Vec3) -> (Vec3, Vec3) {
    let d1 = p1 - p0;
    let d2 = q1 - q0;
    let r = p0 - q0;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    let (s, t);
    if a < EPSILON && e < EPSILON {
        return (p0, q0);
    }
    if a < EPSILON {
        s = 0.0;
        t = (f / e).clamp(0.0, 1.0);
    } else {
        let c = d1.dot(r);
        if e < EPSILON {
            t = 0.0;
            s = (-c / a).clamp(0.0, 1.0);
        } else {
            let b = d1.dot(d2);
            let denom = a * e - b * b;
            let s_unclamped = if denom > EPSILON {
                (b * f - c * e) / denom
            } else {
                // Parallel segments: any point does; pick the start.
                0.0
            };
            let s_clamped = s_unclamped.clamp(0.0, 1.0);
            let t_unclamped = (b * s_clamped + f) / e;
            if t_unclamped < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t_unclamped > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            } else {
                t = t_unclamped;
                s = s_clamped;
            }
        }
    }

    (p0 + d1 * s, q0 + d2 * t)
}

fn closest_point_on_triangle(tri: &[Vec3; 3], p: Vec3) -> Vec3 {
    let [a, b, c] = *tri;
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONTACT_BREAKING_THRESHOLD;

    #[test]
    fn resting_sphere_on_plane() {
        let sphere = Shape::Sphere { radius: 0.5 };
        let plane = Shape::Plane {
            normal: Vec3::Y,
            constant: 0.0,
        };
        let result = collide(
            &sphere,
            &Transform::from_position(Vec3::new(0.0, 0.495, 0.0)),
            &plane,
            &Transform::default(),
            CONTACT_BREAKING_THRESHOLD,
        );
        assert_eq!(result.len(), 1);
        let cp = result.get(0);
        assert!((cp.distance + 0.005).abs() < 1e-5);
        assert!(cp.normal.y > 0.99);
    }

    #[test]
    fn plane_pair_is_symmetric() {
        let sphere = Shape::Sphere { radius: 0.5 };
        let plane = Shape::Plane {
            normal: Vec3::Y,
            constant: 0.0,
        };
        let sphere_transform = Transform::from_position(Vec3::new(0.0, 0.4, 0.0));

        let forward = collide(
            &sphere,
            &sphere_transform,
            &plane,
            &Transform::default(),
            0.02,
        );
        let swapped = collide(
            &plane,
            &Transform::default(),
            &sphere,
            &sphere_transform,
            0.02,
        );
        assert_eq!(forward.len(), 1);
        assert_eq!(swapped.len(), 1);
        assert!((forward.get(0).normal + swapped.get(0).normal).length() < 1e-6);
        assert!((forward.get(0).distance - swapped.get(0).distance).abs() < 1e-6);
    }

    #[test]
    fn box_resting_on_plane_has_four_corners() {
        let cube = Shape::Box {
            half_extents: Vec3::splat(0.5),
        };
        let plane = Shape::Plane {
            normal: Vec3::Y,
            constant: 0.0,
        };
        let result = collide(
            &cube,
            &Transform::from_position(Vec3::new(0.0, 0.499, 0.0)),
            &plane,
            &Transform::default(),
            CONTACT_BREAKING_THRESHOLD,
        );
        assert_eq!(result.len(), 4);
        for cp in result.iter() {
            assert!(cp.normal.y > 0.99);
            assert!(cp.distance < CONTACT_BREAKING_THRESHOLD);
        }
    }

    #[test]
    fn separated_spheres_yield_nothing() {
        let sphere = Shape::Sphere { radius: 0.5 };
        let result = collide(
            &sphere,
            &Transform::default(),
            &sphere,
            &Transform::from_position(Vec3::new(2.0, 0.0, 0.0)),
            0.02,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn compound_children_report_feature_index() {
        let compound = Shape::Compound {
            children: vec![
                crate::shapes::CompoundChild {
                    transform: Transform::from_position(Vec3::new(-1.0, 0.0, 0.0)),
                    shape: Shape::Sphere { radius: 0.5 },
                },
                crate::shapes::CompoundChild {
                    transform: Transform::from_position(Vec3::new(1.0, 0.0, 0.0)),
                    shape: Shape::Sphere { radius: 0.5 },
                },
            ],
        };
        let sphere = Shape::Sphere { radius: 0.5 };
        let result = collide(
            &compound,
            &Transform::default(),
            &sphere,
            &Transform::from_position(Vec3::new(1.6, 0.0, 0.0)),
            0.02,
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result.get(0).feature, Some(1));
    }

    #[test]
    fn sphere_mesh_contact_uses_face_normal() {
        let mesh = TriangleMesh::new(
            vec![
                Vec3::new(-1.0, 0.0, -1.0),
                Vec3::new(1.0, 0.0, -1.0),
                Vec3::new(1.0, 0.0, 1.0),
                Vec3::new(-1.0, 0.0, 1.0),
            ],
            vec![0, 2, 1, 0, 3, 2],
        );
        let shape = Shape::Mesh {
            mesh: std::sync::Arc::new(mesh),
        };
        let sphere = Shape::Sphere { radius: 0.5 };
        let result = collide(
            &sphere,
            &Transform::from_position(Vec3::new(0.0, 0.49, 0.0)),
            &shape,
            &Transform::default(),
            0.02,
        );
        assert!(!result.is_empty());
        assert!(result.get(0).normal.y > 0.99);
    }
}

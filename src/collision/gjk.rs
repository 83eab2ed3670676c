//! GJK intersection test with EPA penetration depth for convex shape pairs
//! that have no closed-form routine.

use crate::core::types::Transform;
use crate::shapes::Shape;
use glam::Vec3;

const GJK_MAX_ITERATIONS: usize = 20;
const EPA_MAX_ITERATIONS: usize = 32;
const EPSILON: f32 = 1e-6;

/// Penetration between two convex shapes. `normal` points from A toward B
/// in world space; `point_a` lies on A's surface.
#[derive(Debug, Clone, Copy)]
pub struct Penetration {
    pub normal: Vec3,
    pub depth: f32,
    pub point_a: Vec3,
}

fn support(shape: &Shape, transform: &Transform, world_dir: Vec3) -> Vec3 {
    let local_dir = transform.orientation.conjugate() * world_dir;
    transform.to_world(shape.support_local(local_dir))
}

/// Tests two convex shapes for overlap, returning penetration depth and
/// axis when they intersect. Degenerate configurations fall back to the
/// center-to-center axis; separated shapes return `None`.
pub fn intersect(
    shape_a: &Shape,
    transform_a: &Transform,
    shape_b: &Shape,
    transform_b: &Transform,
) -> Option<Penetration> {
    debug_assert!(shape_a.is_convex() && shape_b.is_convex());
    intersect_support(
        &|dir| support(shape_a, transform_a, dir),
        transform_a.position,
        &|dir| support(shape_b, transform_b, dir),
        transform_b.position,
    )
}

/// Convex shape against a world-space triangle.
pub fn intersect_triangle(
    shape_a: &Shape,
    transform_a: &Transform,
    triangle: &[Vec3; 3],
) -> Option<Penetration> {
    let centroid = (triangle[0] + triangle[1] + triangle[2]) / 3.0;
    intersect_support(
        &|dir| support(shape_a, transform_a, dir),
        transform_a.position,
        &|dir| {
            *triangle
                .iter()
                .max_by(|a, b| {
                    a.dot(dir)
                        .partial_cmp(&b.dot(dir))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap()
        },
        centroid,
    )
}

/// GJK over arbitrary world-space support mappings.
fn intersect_support(
    support_a: &dyn Fn(Vec3) -> Vec3,
    center_a: Vec3,
    support_b: &dyn Fn(Vec3) -> Vec3,
    center_b: Vec3,
) -> Option<Penetration> {
    let mut simplex: Vec<Vec3> = Vec::with_capacity(4);
    let mut direction = center_b - center_a;
    if direction.length_squared() < EPSILON {
        direction = Vec3::X;
    }

    for _ in 0..GJK_MAX_ITERATIONS {
        let point = support_a(direction) - support_b(-direction);

        if point.dot(direction) < 0.0 {
            return None;
        }

        simplex.push(point);
        if next_simplex(&mut simplex, &mut direction) {
            let (depth, mut normal) =
                epa_penetration(&simplex, support_a, center_a, support_b, center_b);

            // Normal points from A toward B.
            let center_axis = center_b - center_a;
            if normal.dot(center_axis) < 0.0 {
                normal = -normal;
            }

            // Near-touching results can come out with a normal orthogonal to
            // the approach axis; trust the center axis for those.
            let center_len_sq = center_axis.length_squared();
            if center_len_sq > EPSILON && depth < 0.01 {
                let center_dir = center_axis / center_len_sq.sqrt();
                if normal.dot(center_dir) < 0.5 {
                    normal = center_dir;
                }
            }

            let point_a = support_a(normal);
            return Some(Penetration {
                normal,
                depth,
                point_a,
            });
        }
    }

    None
}

/// Evolves the simplex toward the origin. Returns true once a tetrahedron
/// encloses it.
fn next_simplex(simplex: &mut Vec<Vec3>, direction: &mut Vec3) -> bool {
    match simplex.len() {
        1 => {
            *direction = -simplex[0];
            false
        }
        2 => {
            let a = simplex[1];
            let b = simplex[0];
            let ab = b - a;
            let ao = -a;

            let dir = ab.cross(ao).cross(ab);
            if dir.length_squared() < EPSILON {
                // Origin lies on the segment; any perpendicular works.
                let axis = if ab.x.abs() < 0.1 { Vec3::X } else { Vec3::Y };
                *direction = ab.cross(axis);
            } else {
                *direction = dir;
            }
            false
        }
        3 => {
            let a = simplex[2];
            let b = simplex[1];
            let c = simplex[0];
            let ab = b - a;
            let ac = c - a;
            let ao = -a;
            let abc = ab.cross(ac);

            if abc.cross(ac).dot(ao) > 0.0 {
                simplex.remove(1);
                *direction = ac.cross(ao).cross(ac);
                false
            } else if ab.cross(abc).dot(ao) > 0.0 {
                simplex.remove(0);
                *direction = ab.cross(ao).cross(ab);
                false
            } else {
                if abc.length_squared() < EPSILON {
                    *direction = Vec3::Y;
                } else if abc.dot(ao) > 0.0 {
                    *direction = abc;
                } else {
                    *direction = -abc;
                }
                false
            }
        }
        4 => {
            let a = simplex[3];
            let b = simplex[2];
            let c = simplex[1];
            let d = simplex[0];
            let ab = b - a;
            let ac = c - a;
            let ad = d - a;
            let ao = -a;
            let abc = ab.cross(ac);
            let acd = ac.cross(ad);
            let adb = ad.cross(ab);

            if abc.dot(ao) > 0.0 {
                simplex.remove(0);
                *direction = abc;
                false
            } else if acd.dot(ao) > 0.0 {
                simplex.remove(2);
                *direction = acd;
                false
            } else if adb.dot(ao) > 0.0 {
                simplex.remove(1);
                *direction = adb;
                false
            } else {
                true
            }
        }
        _ => false,
    }
}

fn epa_penetration(
    simplex: &[Vec3],
    support_a: &dyn Fn(Vec3) -> Vec3,
    center_a: Vec3,
    support_b: &dyn Fn(Vec3) -> Vec3,
    center_b: Vec3,
) -> (f32, Vec3) {
    let fallback = || {
        let axis = (center_b - center_a).normalize_or_zero();
        if axis == Vec3::ZERO {
            Vec3::X
        } else {
            axis
        }
    };

    if simplex.len() < 4 {
        let depth = simplex
            .iter()
            .map(|p| p.length())
            .fold(f32::INFINITY, f32::min)
            .min(0.01);
        return (depth, fallback());
    }

    let mut polytope = simplex.to_vec();
    let mut faces = initial_faces(&polytope);

    for _ in 0..EPA_MAX_ITERATIONS {
        let (_, min_dist, normal) = closest_face(&polytope, &faces);
        if min_dist >= f32::MAX * 0.5 {
            return (0.01, fallback());
        }
        if min_dist < EPSILON {
            return (EPSILON, normal);
        }

        let new_support = support_a(normal) - support_b(-normal);
        if new_support.dot(normal) - min_dist < EPSILON {
            return (min_dist, normal);
        }

        expand(&mut polytope, &mut faces, new_support);
    }

    let (_, min_dist, normal) = closest_face(&polytope, &faces);
    if min_dist >= f32::MAX * 0.5 {
        (0.01, fallback())
    } else {
        (min_dist, normal)
    }
}

fn initial_faces(polytope: &[Vec3]) -> Vec<(usize, usize, usize)> {
    let mut faces = vec![(0, 1, 2), (0, 2, 3), (0, 3, 1), (1, 3, 2)];
    for face in &mut faces {
        let ab = polytope[face.1] - polytope[face.0];
        let ac = polytope[face.2] - polytope[face.0];
        if polytope[face.0].dot(ab.cross(ac)) < 0.0 {
            std::mem::swap(&mut face.1, &mut face.2);
        }
    }
    faces
}

fn closest_face(polytope: &[Vec3], faces: &[(usize, usize, usize)]) -> (usize, f32, Vec3) {
    let mut min_dist = f32::MAX;
    let mut min_normal = Vec3::ZERO;
    let mut min_index = 0;

    for (index, &(a, b, c)) in faces.iter().enumerate() {
        let normal = (polytope[b] - polytope[a])
            .cross(polytope[c] - polytope[a])
            .normalize_or_zero();
        if normal == Vec3::ZERO {
            continue;
        }
        let dist = polytope[a].dot(normal);
        if dist < min_dist {
            min_dist = dist;
            min_normal = normal;
            min_index = index;
        }
    }

    (min_index, min_dist, min_normal)
}

fn expand(polytope: &mut Vec<Vec3>, faces: &mut Vec<(usize, usize, usize)>, point: Vec3) {
    let new_index = polytope.len();
    polytope.push(point);

    // Remove faces visible from the new point and remember their edges.
    let mut edges: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < faces.len() {
        let (a, b, c) = faces[i];
        let normal = (polytope[b] - polytope[a])
            .cross(polytope[c] - polytope[a])
            .normalize_or_zero();
        if normal.dot(point - polytope[a]) > 0.0 {
            edges.push((a, b));
            edges.push((b, c));
            edges.push((c, a));
            faces.swap_remove(i);
        } else {
            i += 1;
        }
    }

    // The horizon is the set of edges that appear only once.
    let mut horizon: Vec<(usize, usize)> = Vec::new();
    for (u, v) in edges {
        if let Some(pos) = horizon.iter().position(|&e| e == (v, u)) {
            horizon.remove(pos);
        } else {
            horizon.push((u, v));
        }
    }

    for (u, v) in horizon {
        faces.push((u, v, new_index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_boxes_intersect() {
        let shape = Shape::Box {
            half_extents: Vec3::splat(0.5),
        };
        let pen = intersect(
            &shape,
            &Transform::default(),
            &shape,
            &Transform::from_position(Vec3::new(0.8, 0.0, 0.0)),
        )
        .unwrap();
        assert!((pen.depth - 0.2).abs() < 1e-3);
        assert!(pen.normal.x > 0.99);
    }

    #[test]
    fn separated_boxes_do_not_intersect() {
        let shape = Shape::Box {
            half_extents: Vec3::splat(0.5),
        };
        assert!(intersect(
            &shape,
            &Transform::default(),
            &shape,
            &Transform::from_position(Vec3::new(1.5, 0.0, 0.0)),
        )
        .is_none());
    }

    #[test]
    fn coincident_centers_fall_back_to_an_axis() {
        let shape = Shape::Sphere { radius: 0.5 };
        let pen = intersect(
            &shape,
            &Transform::default(),
            &shape,
            &Transform::default(),
        );
        // Fully overlapping spheres still yield a usable axis.
        if let Some(pen) = pen {
            assert!(pen.normal.length() > 0.99);
        }
    }
}

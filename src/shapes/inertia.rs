//! Moments of inertia for the shape variants that can carry finite mass.

use super::{ConvexMesh, Shape};
use glam::{Mat3, Vec3};

pub fn solid_sphere(mass: f32, radius: f32) -> Mat3 {
    Mat3::from_diagonal(Vec3::splat(0.4 * mass * radius * radius))
}

pub fn solid_box(mass: f32, half_extents: Vec3) -> Mat3 {
    let size = half_extents * 2.0;
    let factor = mass / 12.0;
    Mat3::from_diagonal(Vec3::new(
        factor * (size.y * size.y + size.z * size.z),
        factor * (size.x * size.x + size.z * size.z),
        factor * (size.x * size.x + size.y * size.y),
    ))
}

/// Cylinder with its axis along local x.
pub fn solid_cylinder(mass: f32, radius: f32, half_length: f32) -> Mat3 {
    let len = half_length * 2.0;
    let axial = 0.5 * mass * radius * radius;
    let lateral = mass * (3.0 * radius * radius + len * len) / 12.0;
    Mat3::from_diagonal(Vec3::new(axial, lateral, lateral))
}

/// Capsule with its axis along local x: cylinder plus two half spheres
/// shifted by the parallel axis theorem.
pub fn solid_capsule(mass: f32, radius: f32, half_length: f32) -> Mat3 {
    let len = half_length * 2.0;
    let cyl_volume = std::f32::consts::PI * radius * radius * len;
    let cap_volume = 4.0 / 3.0 * std::f32::consts::PI * radius.powi(3);
    let total_volume = cyl_volume + cap_volume;
    let cyl_mass = mass * cyl_volume / total_volume;
    let cap_mass = mass * cap_volume / total_volume;

    let cyl_axial = 0.5 * cyl_mass * radius * radius;
    let cyl_lateral = cyl_mass * (3.0 * radius * radius + len * len) / 12.0;

    let cap_axial = 0.4 * cap_mass * radius * radius;
    let cap_offset = half_length + 3.0 / 8.0 * radius;
    let cap_lateral = 0.4 * cap_mass * radius * radius + cap_mass * cap_offset * cap_offset;

    Mat3::from_diagonal(Vec3::new(
        cyl_axial + cap_axial,
        cyl_lateral + cap_lateral,
        cyl_lateral + cap_lateral,
    ))
}

/// Convex hull inertia approximated from the vertex cloud's bounding box.
/// Accurate enough for the solver; hull tessellation integrals are not
/// worth their cost here.
pub fn solid_hull(mass: f32, mesh: &ConvexMesh) -> Mat3 {
    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    for &v in &mesh.vertices {
        min = min.min(v);
        max = max.max(v);
    }
    if !min.x.is_finite() {
        return Mat3::IDENTITY;
    }
    solid_box(mass, (max - min) * 0.5)
}

/// Inertia of a shape about its own origin. Compounds sum children through
/// the parallel axis theorem; concave meshes fall back to their bounds.
pub fn moment_of_inertia(shape: &Shape, mass: f32) -> Mat3 {
    match shape {
        Shape::Sphere { radius } => solid_sphere(mass, *radius),
        Shape::Box { half_extents } => solid_box(mass, *half_extents),
        Shape::Cylinder {
            radius,
            half_length,
        } => solid_cylinder(mass, *radius, *half_length),
        Shape::Capsule {
            radius,
            half_length,
        } => solid_capsule(mass, *radius, *half_length),
        Shape::Polyhedron { mesh } => solid_hull(mass, mesh),
        Shape::Compound { children } => {
            let child_mass = mass / children.len().max(1) as f32;
            let mut total = Mat3::ZERO;
            for child in children {
                let local = moment_of_inertia(&child.shape, child_mass);
                let rot = Mat3::from_quat(child.transform.orientation);
                let rotated = rot * local * rot.transpose();
                let d = child.transform.position;
                let shift = Mat3::from_diagonal(Vec3::splat(d.length_squared()))
                    - Mat3::from_cols(d * d.x, d * d.y, d * d.z);
                total = add_mat(total, add_mat(rotated, shift * child_mass));
            }
            total
        }
        Shape::Mesh { mesh } => solid_box(mass, mesh.bounds().extent()),
        Shape::PagedMesh { mesh } => solid_box(mass, mesh.bounds().extent()),
        Shape::Plane { .. } => Mat3::IDENTITY,
    }
}

fn add_mat(a: Mat3, b: Mat3) -> Mat3 {
    Mat3::from_cols(
        a.x_axis + b.x_axis,
        a.y_axis + b.y_axis,
        a.z_axis + b.z_axis,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_sphere_inertia() {
        let inertia = solid_sphere(1.0, 0.5);
        assert!((inertia.x_axis.x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn cylinder_axial_term_is_smaller_than_lateral() {
        let inertia = solid_cylinder(2.0, 0.3, 1.0);
        assert!(inertia.x_axis.x < inertia.y_axis.y);
        assert!((inertia.y_axis.y - inertia.z_axis.z).abs() < 1e-6);
    }
}

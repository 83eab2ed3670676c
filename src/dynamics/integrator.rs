//! Gravity application, velocity and position integration, and the derived
//! state refresh that closes every step.

use crate::core::rigidbody::RigidBody;
use glam::Quat;

/// Integrates one body's transform from its velocities and re-normalizes
/// the orientation. Spin-enabled bodies integrate their scalar spin angle
/// separately so wheel rotation keeps full precision.
pub fn integrate(body: &mut RigidBody, dt: f32) {
    if body.is_static() {
        return;
    }

    body.transform.position += body.velocity.linear * dt;

    let w = body.velocity.angular;
    if w.length_squared() > 0.0 {
        let dq = Quat::from_xyzw(w.x, w.y, w.z, 0.0) * body.transform.orientation;
        let orientation = Quat::from_xyzw(
            body.transform.orientation.x + dq.x * 0.5 * dt,
            body.transform.orientation.y + dq.y * 0.5 * dt,
            body.transform.orientation.z + dq.z * 0.5 * dt,
            body.transform.orientation.w + dq.w * 0.5 * dt,
        );
        body.transform.orientation = orientation.normalize();
    }

    if let Some(spin) = &mut body.spin {
        spin.integrate(dt);
    }
}

/// Refreshes state derived from the transform: world-space inverse inertia,
/// rotated convex meshes and the world AABB.
pub fn update_derived_state(body: &mut RigidBody) {
    body.update_world_inertia();
    body.update_rotated_mesh();
    body.update_aabb();
}

/// Records the pre-integration transform as the presentation state, so
/// renderers can interpolate between the previous and current step.
pub fn stash_presentation(body: &mut RigidBody) {
    if let Some(presentation) = &mut body.presentation {
        presentation.transform = body.transform;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rigidbody::RigidBodyDef;
    use crate::shapes::Shape;
    use glam::Vec3;

    #[test]
    fn orientation_stays_unit_under_fast_rotation() {
        let mut body = RigidBodyDef::new()
            .shape(Shape::Sphere { radius: 0.5 })
            .angular_velocity(Vec3::new(20.0, 15.0, -8.0))
            .build();

        for _ in 0..600 {
            integrate(&mut body, 1.0 / 60.0);
        }
        assert!((body.transform.orientation.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_velocity_body_stays_exactly_put() {
        let mut body = RigidBodyDef::new()
            .shape(Shape::Sphere { radius: 0.5 })
            .position(Vec3::new(1.0, 2.0, 3.0))
            .build();
        integrate(&mut body, 1.0 / 60.0);
        assert_eq!(body.transform.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(body.velocity.linear, Vec3::ZERO);
    }

    #[test]
    fn world_inertia_follows_orientation() {
        let mut body = RigidBodyDef::new()
            .shape(Shape::Box {
                half_extents: Vec3::new(1.0, 0.1, 0.1),
            })
            .angular_velocity(Vec3::new(0.0, 0.0, 3.0))
            .build();

        integrate(&mut body, 0.1);
        update_derived_state(&mut body);

        let rot = glam::Mat3::from_quat(body.transform.orientation);
        let expected = rot * body.mass.inverse_inertia * rot.transpose();
        let diff = (body.mass.inverse_inertia_world.x_axis - expected.x_axis).length()
            + (body.mass.inverse_inertia_world.y_axis - expected.y_axis).length()
            + (body.mass.inverse_inertia_world.z_axis - expected.z_axis).length();
        assert!(diff < 1e-5);
    }
}

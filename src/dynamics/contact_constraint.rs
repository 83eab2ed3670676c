//! Solver rows generated from contact manifolds each step. Unlike joints,
//! contact rows are rebuilt from the manifold's points; the accumulated
//! impulses live on the points themselves.

use crate::collision::contact::ContactManifold;
use crate::dynamics::constraints::{PrepareContext, RowCache};
use crate::dynamics::row::{
    prepare_row, ConstraintRow, FrictionRow, FrictionRowPair, RowOptions, SolverBody,
    SpinFrictionRow,
};
use crate::utils::allocator::EntityId;
use glam::Vec3;

/// Where each contact point's rows landed in the cache, for writing the
/// converged impulses back after the iterations.
#[derive(Debug, Clone)]
pub struct ContactRowRefs {
    pub manifold: EntityId,
    pub point_slot: usize,
    pub normal_row: usize,
    pub friction_pair: usize,
    pub rolling_pair: Option<usize>,
    pub spinning_row: Option<usize>,
}

/// Emits one normal row, a coupled friction pair, and optional rolling and
/// spinning friction rows per contact point.
pub fn prepare_contact_constraint(
    manifold_id: EntityId,
    manifold: &ContactManifold,
    ctx: &PrepareContext,
    bodies: &[SolverBody],
    cache: &mut RowCache,
    refs: &mut Vec<ContactRowRefs>,
    restitution_pass_enabled: bool,
) {
    let has_spin = [
        has_spin_dof(&bodies[ctx.body_a]),
        has_spin_dof(&bodies[ctx.body_b]),
    ];

    for (slot, point) in manifold.point_slots() {
        let normal = point.normal;
        let world_a = ctx.transform_a.to_world(point.pivot_a);
        let world_b = ctx.transform_b.to_world(point.pivot_b);
        let r_a = world_a - ctx.transform_a.position;
        let r_b = world_b - ctx.transform_b.position;

        // Normal row: unilateral, ERP driven by penetration depth. With the
        // dedicated restitution pass enabled the bounce is handled there,
        // not here. Separated (speculative) points may close their gap at
        // exactly one step's rate.
        let (error, erp) = if point.distance < 0.0 {
            (point.distance, 0.2 / ctx.dt)
        } else {
            (point.distance, 1.0 / ctx.dt)
        };
        let restitution = if restitution_pass_enabled {
            0.0
        } else {
            point.material.restitution
        };

        let mut normal_row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [normal, r_a.cross(normal), -normal, -(r_b.cross(normal))],
        )
        .limits(0.0, f32::INFINITY);
        normal_row.impulse = point.normal_impulse;

        // Soft materials turn the normal row into a spring-damper by capping
        // the impulse at what the spring can exert this step.
        if !point.material.is_rigid() && point.distance < 0.0 {
            let spring_force = point.material.stiffness * (-point.distance);
            let damper_force = point.material.damping;
            normal_row.upper_limit = (spring_force + damper_force) * ctx.dt;
        }

        prepare_row(
            &mut normal_row,
            &RowOptions {
                error,
                erp,
                restitution,
            },
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        let normal_row_index = cache.rows.len();
        cache.rows.push(normal_row);

        // Friction pair spanning the tangent plane, coupled by the circle
        // clamp against this point's normal impulse.
        let (tangent_u, tangent_v) = tangent_basis(normal);
        let mut friction = FrictionRowPair {
            body_a: ctx.body_a,
            body_b: ctx.body_b,
            rows: [
                FrictionRow {
                    j: [tangent_u, r_a.cross(tangent_u), -tangent_u, -(r_b.cross(tangent_u))],
                    eff_mass: 0.0,
                    rhs: 0.0,
                    impulse: point.friction_impulse[0],
                },
                FrictionRow {
                    j: [tangent_v, r_a.cross(tangent_v), -tangent_v, -(r_b.cross(tangent_v))],
                    eff_mass: 0.0,
                    rhs: 0.0,
                    impulse: point.friction_impulse[1],
                },
            ],
            friction_coefficient: point.material.friction,
            normal_row: normal_row_index,
            use_spin: has_spin,
        };
        friction.prepare(&bodies[ctx.body_a], &bodies[ctx.body_b]);
        let friction_index = cache.friction.len();
        cache.friction.push(friction);

        // Rolling friction: a pair acting purely on the angular velocities.
        let rolling_index = if point.material.roll_friction > 0.0 {
            let mut rolling = FrictionRowPair {
                body_a: ctx.body_a,
                body_b: ctx.body_b,
                rows: [
                    FrictionRow {
                        j: [Vec3::ZERO, tangent_u, Vec3::ZERO, -tangent_u],
                        eff_mass: 0.0,
                        rhs: 0.0,
                        impulse: point.rolling_impulse[0],
                    },
                    FrictionRow {
                        j: [Vec3::ZERO, tangent_v, Vec3::ZERO, -tangent_v],
                        eff_mass: 0.0,
                        rhs: 0.0,
                        impulse: point.rolling_impulse[1],
                    },
                ],
                friction_coefficient: point.material.roll_friction,
                normal_row: normal_row_index,
                use_spin: has_spin,
            };
            rolling.prepare(&bodies[ctx.body_a], &bodies[ctx.body_b]);
            let index = cache.rolling.len();
            cache.rolling.push(rolling);
            Some(index)
        } else {
            None
        };

        // Spinning friction about the contact normal.
        let spinning_index = if point.material.spin_friction > 0.0 {
            let mut spinning = SpinFrictionRow {
                body_a: ctx.body_a,
                body_b: ctx.body_b,
                axis: normal,
                eff_mass: 0.0,
                impulse: point.spinning_impulse,
                friction_coefficient: point.material.spin_friction,
                normal_row: normal_row_index,
            };
            spinning.prepare(&bodies[ctx.body_a], &bodies[ctx.body_b]);
            let index = cache.spinning.len();
            cache.spinning.push(spinning);
            Some(index)
        } else {
            None
        };

        refs.push(ContactRowRefs {
            manifold: manifold_id,
            point_slot: slot,
            normal_row: normal_row_index,
            friction_pair: friction_index,
            rolling_pair: rolling_index,
            spinning_row: spinning_index,
        });
    }
}

/// Writes converged impulses back onto the contact points for warm
/// starting the next step.
pub fn store_contact_impulses(
    refs: &[ContactRowRefs],
    cache: &RowCache,
    manifolds: &mut crate::utils::allocator::Arena<ContactManifold>,
) {
    for row_ref in refs {
        let Some(manifold) = manifolds.get_mut(row_ref.manifold) else {
            continue;
        };
        let Some(point) = manifold.point_at_mut(row_ref.point_slot) else {
            continue;
        };
        point.normal_impulse = cache.rows[row_ref.normal_row].impulse;
        point.friction_impulse = [
            cache.friction[row_ref.friction_pair].rows[0].impulse,
            cache.friction[row_ref.friction_pair].rows[1].impulse,
        ];
        if let Some(index) = row_ref.rolling_pair {
            point.rolling_impulse = [
                cache.rolling[index].rows[0].impulse,
                cache.rolling[index].rows[1].impulse,
            ];
        }
        if let Some(index) = row_ref.spinning_row {
            point.spinning_impulse = cache.spinning[index].impulse;
        }
    }
}

fn has_spin_dof(body: &SolverBody) -> bool {
    body.spin_inv_inertia > 0.0
}

/// Orthonormal basis spanning the plane orthogonal to the contact normal.
pub fn tangent_basis(normal: Vec3) -> (Vec3, Vec3) {
    let helper = if normal.x.abs() < 0.9 { Vec3::X } else { Vec3::Y };
    let u = normal.cross(helper).normalize();
    let v = normal.cross(u);
    (u, v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::contact::{CollidePoint, CollisionResult, NormalAttachment};
    use crate::core::types::{ContactMaterial, Transform};
    use glam::Mat3;

    fn solver_body(inv_mass: f32) -> SolverBody {
        SolverBody {
            entity: EntityId::default(),
            linvel: Vec3::ZERO,
            angvel: Vec3::ZERO,
            spin_rate: 0.0,
            spin_axis: Vec3::ZERO,
            inv_mass,
            inv_inertia: Mat3::IDENTITY * inv_mass,
            spin_inv_inertia: 0.0,
            delta_linvel: Vec3::ZERO,
            delta_angvel: Vec3::ZERO,
            delta_spin: 0.0,
        }
    }

    fn penetrating_manifold() -> ContactManifold {
        let mut manifold = ContactManifold::new(EntityId::new(0, 0), EntityId::new(1, 0), 0.1);
        let mut result = CollisionResult::default();
        result.push(CollidePoint {
            pivot_a: Vec3::new(0.0, -0.5, 0.0),
            pivot_b: Vec3::ZERO,
            normal: Vec3::Y,
            local_normal: Vec3::Y,
            normal_attachment: NormalAttachment::None,
            distance: -0.01,
            feature: None,
        });
        manifold.merge_result(
            &result,
            &Transform::default(),
            &Transform::default(),
            false,
            ContactMaterial::default,
        );
        manifold
    }

    #[test]
    fn one_point_emits_normal_and_friction() {
        let manifold = penetrating_manifold();
        let bodies = vec![solver_body(1.0), solver_body(0.0)];
        let transform_a = Transform::from_position(Vec3::new(0.0, 0.49, 0.0));
        let transform_b = Transform::default();
        let ctx = PrepareContext {
            body_a: 0,
            body_b: 1,
            transform_a: &transform_a,
            transform_b: &transform_b,
            dt: 1.0 / 60.0,
        };

        let mut cache = RowCache::default();
        let mut refs = Vec::new();
        prepare_contact_constraint(
            EntityId::new(7, 0),
            &manifold,
            &ctx,
            &bodies,
            &mut cache,
            &mut refs,
            true,
        );

        assert_eq!(cache.rows.len(), 1);
        assert_eq!(cache.friction.len(), 1);
        assert_eq!(refs.len(), 1);
        assert_eq!(cache.rows[0].lower_limit, 0.0);
        // Penetration produces a positive push on the rhs.
        assert!(cache.rows[0].rhs > 0.0);
    }

    #[test]
    fn tangent_basis_is_orthonormal() {
        for normal in [Vec3::X, Vec3::Y, Vec3::Z, Vec3::new(0.3, 0.8, -0.5).normalize()] {
            let (u, v) = tangent_basis(normal);
            assert!(u.dot(normal).abs() < 1e-6);
            assert!(v.dot(normal).abs() < 1e-6);
            assert!(u.dot(v).abs() < 1e-6);
            assert!((u.length() - 1.0).abs() < 1e-5);
        }
    }
}

//! The island solve: restitution pre-pass, warm-started velocity PGS
//! iterations, integration, and the positional correction pass. One island
//! is always solved by a single thread; parallelism happens between
//! islands.

use crate::core::registry::Registry;
use crate::core::types::Transform;
use crate::dynamics::constraints::{ConstraintPrepare, PrepareContext, RowCache};
use crate::dynamics::contact_constraint::{
    prepare_contact_constraint, store_contact_impulses, ContactRowRefs,
};
use crate::dynamics::integrator;
use crate::dynamics::row::{self, PositionSolver, SolverBody};
use crate::utils::allocator::EntityId;
use glam::{Quat, Vec3};
use std::collections::HashMap;

/// Approach speed below which the restitution pass ignores a contact.
const RESTITUTION_RELVEL_THRESHOLD: f32 = -0.005;

/// Positional correction tuning: fraction of the error corrected per
/// iteration, the per-iteration cap, and the error magnitude below which
/// the pass exits.
const POSITION_CORRECTION_RATE: f32 = 0.2;
const MAX_POSITION_CORRECTION: f32 = 0.2;
const POSITION_ERROR_CUTOFF: f32 = 0.0005;

/// The entities making up one island's step.
#[derive(Debug, Default, Clone)]
pub struct IslandMembers {
    pub bodies: Vec<EntityId>,
    pub manifolds: Vec<EntityId>,
    pub constraints: Vec<EntityId>,
}

/// Runs one fixed step for one island: gravity, restitution, velocity
/// iterations, integration, position iterations, derived-state refresh.
pub fn step_island(registry: &mut Registry, members: &IslandMembers) {
    let settings = registry.settings;
    let dt = settings.fixed_dt;

    // Gravity.
    for &body_id in &members.bodies {
        if let Some(body) = registry.bodies.get_mut(body_id) {
            if body.is_dynamic() {
                body.velocity.linear += settings.gravity * dt;
            }
        }
    }

    // Island-local solver view.
    let mut solver_bodies = Vec::with_capacity(members.bodies.len());
    let mut transforms = Vec::with_capacity(members.bodies.len());
    let mut index_of = HashMap::with_capacity(members.bodies.len());
    for &body_id in &members.bodies {
        let Some(body) = registry.bodies.get(body_id) else {
            continue;
        };
        index_of.insert(body_id, solver_bodies.len());
        transforms.push(body.transform);
        let spin_axis = if body.spin.is_some() {
            body.transform.orientation * Vec3::X
        } else {
            Vec3::ZERO
        };
        solver_bodies.push(SolverBody {
            entity: body_id,
            linvel: body.velocity.linear,
            angvel: body.velocity.angular,
            spin_rate: body.spin.map(|s| s.rate).unwrap_or(0.0),
            spin_axis,
            inv_mass: body.mass.inverse_mass,
            inv_inertia: body.mass.inverse_inertia_world,
            spin_inv_inertia: if body.spin.is_some() {
                body.mass.inverse_inertia.x_axis.x
            } else {
                0.0
            },
            delta_linvel: Vec3::ZERO,
            delta_angvel: Vec3::ZERO,
            delta_spin: 0.0,
        });
    }

    // Dedicated restitution pass, before the main iterations, so resting
    // stacks don't bounce from ERP-folded restitution.
    if settings.restitution_iterations > 0 {
        solve_restitution(
            registry,
            members,
            &mut solver_bodies,
            &index_of,
            &transforms,
            settings.restitution_iterations,
        );
    }

    // Row generation: joints first, then contacts.
    let mut cache = RowCache::default();
    let mut contact_refs: Vec<ContactRowRefs> = Vec::new();

    for &constraint_id in &members.constraints {
        let Some(constraint) = registry.constraints.get(constraint_id) else {
            continue;
        };
        let (Some(&a), Some(&b)) = (
            index_of.get(&constraint.body_a),
            index_of.get(&constraint.body_b),
        ) else {
            continue;
        };
        let ctx = PrepareContext {
            body_a: a,
            body_b: b,
            transform_a: &transforms[a],
            transform_b: &transforms[b],
            dt,
        };
        let start = cache.begin_constraint();
        constraint.joint.prepare(&ctx, &solver_bodies, &mut cache);
        cache.end_constraint(constraint_id, start);
    }

    for &manifold_id in &members.manifolds {
        let Some(manifold) = registry.manifolds.get(manifold_id) else {
            continue;
        };
        if is_sensor_pair(registry, manifold.body_a, manifold.body_b) {
            continue;
        }
        let (Some(&a), Some(&b)) = (
            index_of.get(&manifold.body_a),
            index_of.get(&manifold.body_b),
        ) else {
            continue;
        };
        let ctx = PrepareContext {
            body_a: a,
            body_b: b,
            transform_a: &transforms[a],
            transform_b: &transforms[b],
            dt,
        };
        prepare_contact_constraint(
            manifold_id,
            manifold,
            &ctx,
            &solver_bodies,
            &mut cache,
            &mut contact_refs,
            settings.restitution_iterations > 0,
        );
    }

    // Warm start: each row applies its persisted impulse exactly once.
    for constraint_row in &cache.rows {
        row::warm_start(constraint_row, &mut solver_bodies);
    }
    for pair in &cache.friction {
        pair.warm_start(&mut solver_bodies);
    }
    for pair in &cache.rolling {
        pair.warm_start(&mut solver_bodies);
    }
    for spin in &cache.spinning {
        let applied = spin.impulse;
        let (a, b) = (spin.body_a, spin.body_b);
        let axis = spin.axis;
        let delta_a = solver_bodies[a].inv_inertia * axis * applied;
        solver_bodies[a].delta_angvel += delta_a;
        let delta_b = solver_bodies[b].inv_inertia * axis * applied;
        solver_bodies[b].delta_angvel -= delta_b;
    }

    // Velocity iterations. Rows are solved in a fixed order so warm starts
    // reproduce; friction pairs solve together after their normal rows.
    for _ in 0..settings.velocity_iterations {
        for constraint_row in &mut cache.rows {
            row::solve_row(constraint_row, &mut solver_bodies);
        }
        for i in 0..cache.friction.len() {
            let normal_impulse = cache.rows[cache.friction[i].normal_row].impulse;
            cache.friction[i].solve(normal_impulse, &mut solver_bodies);
        }
        for i in 0..cache.rolling.len() {
            let normal_impulse = cache.rows[cache.rolling[i].normal_row].impulse;
            cache.rolling[i].solve(normal_impulse, &mut solver_bodies);
        }
        for i in 0..cache.spinning.len() {
            let normal_impulse = cache.rows[cache.spinning[i].normal_row].impulse;
            cache.spinning[i].solve(normal_impulse, &mut solver_bodies);
        }
    }

    // Fold deltas into the store.
    for solver_body in &solver_bodies {
        let Some(body) = registry.bodies.get_mut(solver_body.entity) else {
            continue;
        };
        if !body.is_dynamic() {
            continue;
        }
        body.velocity.linear = solver_body.linvel + solver_body.delta_linvel;
        body.velocity.angular = solver_body.angvel + solver_body.delta_angvel;
        if let Some(spin) = &mut body.spin {
            spin.rate = solver_body.spin_rate + solver_body.delta_spin;
        }
    }

    // Persist converged impulses for next step's warm start.
    for (constraint_id, range) in cache.constraint_ranges() {
        if let Some(constraint) = registry.constraints.get_mut(*constraint_id) {
            let impulses: Vec<f32> = cache.rows[range.clone()].iter().map(|r| r.impulse).collect();
            constraint.joint.store_impulses(&impulses);
        }
    }
    store_contact_impulses(&contact_refs, &cache, &mut registry.manifolds);

    // Integrate positions from the solved velocities, keeping the previous
    // transform around for render interpolation. Kinematic bodies are
    // shared between islands and integrate once per step elsewhere.
    for &body_id in &members.bodies {
        if let Some(body) = registry.bodies.get_mut(body_id) {
            if body.is_dynamic() {
                integrator::stash_presentation(body);
                integrator::integrate(body, dt);
            }
        }
    }

    // Position pass: direct split-impulse correction of residual
    // penetration and joint drift.
    solve_positions(registry, members, settings.position_iterations);

    // Derived state.
    for &body_id in &members.bodies {
        if let Some(body) = registry.bodies.get_mut(body_id) {
            if body.is_dynamic() {
                integrator::update_derived_state(body);
            }
        }
    }
}

/// Advances kinematic bodies by their application-controlled velocity.
/// Run once per fixed step, outside the island solves, because kinematic
/// bodies may reside in many islands.
pub fn integrate_kinematic_bodies(registry: &mut Registry, dt: f32) {
    for body in registry.bodies.iter_mut() {
        if body.kind == crate::core::rigidbody::BodyKind::Kinematic {
            integrator::stash_presentation(body);
            integrator::integrate(body, dt);
            integrator::update_derived_state(body);
        }
    }
}

fn is_sensor_pair(registry: &Registry, a: EntityId, b: EntityId) -> bool {
    let sensor = |id| {
        registry
            .bodies
            .get(id)
            .map(|b| b.is_sensor())
            .unwrap_or(true)
    };
    sensor(a) || sensor(b)
}

/// Elastic impulses for contacts with approach velocity above the
/// threshold, iterated until no contact keeps approaching.
fn solve_restitution(
    registry: &Registry,
    members: &IslandMembers,
    solver_bodies: &mut [SolverBody],
    index_of: &HashMap<EntityId, usize>,
    transforms: &[Transform],
    iterations: u32,
) {
    for _ in 0..iterations {
        let mut any_applied = false;

        for &manifold_id in &members.manifolds {
            let Some(manifold) = registry.manifolds.get(manifold_id) else {
                continue;
            };
            if is_sensor_pair(registry, manifold.body_a, manifold.body_b) {
                continue;
            }
            let (Some(&ia), Some(&ib)) = (
                index_of.get(&manifold.body_a),
                index_of.get(&manifold.body_b),
            ) else {
                continue;
            };

            for (_, point) in manifold.point_slots() {
                if point.material.restitution <= 0.0 {
                    continue;
                }

                let world_a = transforms[ia].to_world(point.pivot_a);
                let world_b = transforms[ib].to_world(point.pivot_b);
                let r_a = world_a - transforms[ia].position;
                let r_b = world_b - transforms[ib].position;
                let normal = point.normal;

                let (body_a, body_b) = if ia < ib {
                    let (left, right) = solver_bodies.split_at_mut(ib);
                    (&mut left[ia], &mut right[0])
                } else {
                    let (left, right) = solver_bodies.split_at_mut(ia);
                    (&mut right[0], &mut left[ib])
                };

                let vel_a = body_a.linvel + body_a.angvel.cross(r_a);
                let vel_b = body_b.linvel + body_b.angvel.cross(r_b);
                let relvel = normal.dot(vel_a - vel_b);
                if relvel >= RESTITUTION_RELVEL_THRESHOLD {
                    continue;
                }

                let j_ang_a = r_a.cross(normal);
                let j_ang_b = r_b.cross(normal);
                let j_invm_jt = body_a.inv_mass
                    + (body_a.inv_inertia * j_ang_a).dot(j_ang_a)
                    + body_b.inv_mass
                    + (body_b.inv_inertia * j_ang_b).dot(j_ang_b);
                if j_invm_jt <= f32::EPSILON {
                    continue;
                }

                let impulse = -(1.0 + point.material.restitution) * relvel / j_invm_jt;
                body_a.linvel += normal * (impulse * body_a.inv_mass);
                body_a.angvel += body_a.inv_inertia * j_ang_a * impulse;
                body_b.linvel -= normal * (impulse * body_b.inv_mass);
                body_b.angvel -= body_b.inv_inertia * j_ang_b * impulse;
                any_applied = true;
            }
        }

        if !any_applied {
            break;
        }
    }
}

/// Direct positional correction: contacts resolve residual penetration with
/// a split impulse; joints with a positional contract run their own
/// correction through [`PositionSolver`]. Exits early once the largest
/// error drops below the cut-off.
fn solve_positions(registry: &mut Registry, members: &IslandMembers, iterations: u32) {
    for _ in 0..iterations {
        let mut max_error = 0.0f32;

        for &manifold_id in &members.manifolds {
            let Some(manifold) = registry.manifolds.get(manifold_id) else {
                continue;
            };
            if is_sensor_pair(registry, manifold.body_a, manifold.body_b) {
                continue;
            }
            let (body_a_id, body_b_id) = (manifold.body_a, manifold.body_b);
            let points: Vec<(Vec3, Vec3, Vec3)> = manifold
                .points()
                .map(|p| (p.pivot_a, p.pivot_b, p.normal))
                .collect();

            for (pivot_a, pivot_b, normal) in points {
                let Some((transform_a, transform_b)) = body_transforms(registry, body_a_id, body_b_id)
                else {
                    continue;
                };
                let world_a = transform_a.to_world(pivot_a);
                let world_b = transform_b.to_world(pivot_b);
                let penetration = -(normal.dot(world_a - world_b));
                if penetration <= POSITION_ERROR_CUTOFF {
                    continue;
                }
                max_error = max_error.max(penetration);

                let correction =
                    (penetration * POSITION_CORRECTION_RATE).min(MAX_POSITION_CORRECTION);
                apply_position_correction(
                    registry, body_a_id, body_b_id, world_a, world_b, normal, correction,
                );
            }
        }

        for &constraint_id in &members.constraints {
            let Some(constraint) = registry.constraints.get(constraint_id) else {
                continue;
            };
            let (body_a_id, body_b_id) = (constraint.body_a, constraint.body_b);
            let joint = constraint.joint.clone();
            let Some((body_a, body_b)) = registry.bodies.get2_mut(body_a_id, body_b_id) else {
                continue;
            };

            let inv_mass_a = body_a.mass.inverse_mass;
            let inv_mass_b = body_b.mass.inverse_mass;
            let inv_inertia_a = body_a.mass.inverse_inertia_world;
            let inv_inertia_b = body_b.mass.inverse_inertia_world;
            let inv_inertia_local_a = body_a.mass.inverse_inertia;
            let inv_inertia_local_b = body_b.mass.inverse_inertia;

            let mut position_solver = PositionSolver {
                transform_a: &mut body_a.transform,
                transform_b: &mut body_b.transform,
                inv_mass_a,
                inv_mass_b,
                inv_inertia_a,
                inv_inertia_b,
                inv_inertia_local_a,
                inv_inertia_local_b,
                error_correction_rate: POSITION_CORRECTION_RATE,
                max_error: 0.0,
            };
            joint.solve_position(&mut position_solver);
            let joint_error = position_solver.max_error;

            if joint_error > 0.0 {
                body_a.update_world_inertia();
                body_b.update_world_inertia();
                max_error = max_error.max(joint_error);
            }
        }

        if max_error < POSITION_ERROR_CUTOFF {
            break;
        }
    }
}

fn body_transforms(
    registry: &Registry,
    a: EntityId,
    b: EntityId,
) -> Option<(Transform, Transform)> {
    Some((
        registry.bodies.get(a)?.transform,
        registry.bodies.get(b)?.transform,
    ))
}

/// Moves and rotates the pair along `direction` by `magnitude`, split by
/// inverse mass, without touching velocities.
fn apply_position_correction(
    registry: &mut Registry,
    body_a_id: EntityId,
    body_b_id: EntityId,
    world_a: Vec3,
    world_b: Vec3,
    direction: Vec3,
    magnitude: f32,
) {
    let Some((body_a, body_b)) = registry.bodies.get2_mut(body_a_id, body_b_id) else {
        return;
    };

    let w_a = body_a.mass.inverse_mass;
    let w_b = body_b.mass.inverse_mass;
    let total = w_a + w_b;
    if total <= f32::EPSILON {
        return;
    }

    if body_a.is_dynamic() {
        let share = magnitude * w_a / total;
        body_a.transform.position += direction * share;
        let r_a = world_a - body_a.transform.position;
        let angular = body_a.mass.inverse_inertia_world * r_a.cross(direction) * share;
        body_a.transform.orientation = rotate_by(body_a.transform.orientation, angular);
    }
    if body_b.is_dynamic() {
        let share = magnitude * w_b / total;
        body_b.transform.position -= direction * share;
        let r_b = world_b - body_b.transform.position;
        let angular = body_b.mass.inverse_inertia_world * r_b.cross(direction) * share;
        body_b.transform.orientation = rotate_by(body_b.transform.orientation, -angular);
    }
}

fn rotate_by(orientation: Quat, angular: Vec3) -> Quat {
    if angular.length_squared() < 1e-12 {
        return orientation;
    }
    let dq = Quat::from_xyzw(angular.x, angular.y, angular.z, 0.0) * orientation;
    Quat::from_xyzw(
        orientation.x + dq.x * 0.5,
        orientation.y + dq.y * 0.5,
        orientation.z + dq.z * 0.5,
        orientation.w + dq.w * 0.5,
    )
    .normalize()
}

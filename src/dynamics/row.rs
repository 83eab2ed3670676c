//! Constraint rows: the unit of work of the velocity solver. A row carries
//! a Jacobian over the two bodies' linear and angular velocities, an
//! effective mass, a right hand side and impulse limits. Friction uses
//! coupled row pairs clamped against the accumulated normal impulse.

use crate::core::types::Transform;
use crate::utils::allocator::EntityId;
use glam::{Mat3, Quat, Vec3};

/// Island-local view of one body during a solve: current velocities plus
/// the delta accumulated by the iterations.
#[derive(Debug, Clone)]
pub struct SolverBody {
    pub entity: EntityId,
    pub linvel: Vec3,
    pub angvel: Vec3,
    pub spin_rate: f32,
    pub spin_axis: Vec3,
    pub inv_mass: f32,
    pub inv_inertia: Mat3,
    /// Inverse of the x-axis inertia term, used by spin-coupled rows.
    pub spin_inv_inertia: f32,
    pub delta_linvel: Vec3,
    pub delta_angvel: Vec3,
    pub delta_spin: f32,
}

impl SolverBody {
    /// Angular velocity a spin-coupled row sees, including the scalar spin.
    fn angvel_with_spin(&self, use_spin: bool) -> Vec3 {
        if use_spin {
            self.angvel + self.spin_axis * self.spin_rate
        } else {
            self.angvel
        }
    }

    fn delta_angvel_with_spin(&self, use_spin: bool) -> Vec3 {
        if use_spin {
            self.delta_angvel + self.spin_axis * self.delta_spin
        } else {
            self.delta_angvel
        }
    }
}

/// Options applied while finishing a row's setup.
#[derive(Debug, Clone, Copy)]
pub struct RowOptions {
    /// Constraint error `C`.
    pub error: f32,
    /// Error reduction parameter: fraction of `C` fed back per second of
    /// step, pre-divided by dt by the caller.
    pub erp: f32,
    pub restitution: f32,
}

impl Default for RowOptions {
    fn default() -> Self {
        Self {
            error: 0.0,
            erp: 0.2,
            restitution: 0.0,
        }
    }
}

/// One solver row.
#[derive(Debug, Clone)]
pub struct ConstraintRow {
    pub body_a: usize,
    pub body_b: usize,
    /// `(J_linA, J_angA, J_linB, J_angB)`.
    pub j: [Vec3; 4],
    pub eff_mass: f32,
    pub rhs: f32,
    pub lower_limit: f32,
    pub upper_limit: f32,
    /// Persisted across steps for warm starting.
    pub impulse: f32,
    /// Couples the angular Jacobian to the body's scalar spin.
    pub use_spin: [bool; 2],
}

impl ConstraintRow {
    pub fn new(body_a: usize, body_b: usize, j: [Vec3; 4]) -> Self {
        Self {
            body_a,
            body_b,
            j,
            eff_mass: 0.0,
            rhs: 0.0,
            lower_limit: f32::NEG_INFINITY,
            upper_limit: f32::INFINITY,
            impulse: 0.0,
            use_spin: [false, false],
        }
    }

    pub fn limits(mut self, lower: f32, upper: f32) -> Self {
        self.lower_limit = lower;
        self.upper_limit = upper;
        self
    }

    pub fn with_spin(mut self) -> Self {
        self.use_spin = [true, true];
        self
    }
}

/// `1 / (J M⁻¹ Jᵀ)` for a row over the given pair.
fn effective_mass(row: &ConstraintRow, body_a: &SolverBody, body_b: &SolverBody) -> f32 {
    let j_invm_jt = row.j[0].dot(row.j[0]) * body_a.inv_mass
        + (body_a.inv_inertia * row.j[1]).dot(row.j[1])
        + row.j[2].dot(row.j[2]) * body_b.inv_mass
        + (body_b.inv_inertia * row.j[3]).dot(row.j[3]);
    if j_invm_jt > f32::EPSILON {
        1.0 / j_invm_jt
    } else {
        0.0
    }
}

fn relative_velocity(row: &ConstraintRow, body_a: &SolverBody, body_b: &SolverBody) -> f32 {
    row.j[0].dot(body_a.linvel)
        + row.j[1].dot(body_a.angvel_with_spin(row.use_spin[0]))
        + row.j[2].dot(body_b.linvel)
        + row.j[3].dot(body_b.angvel_with_spin(row.use_spin[1]))
}

/// Finishes a row: effective mass and `rhs = -(β·C + (1+e)·Jv)`.
pub fn prepare_row(
    row: &mut ConstraintRow,
    options: &RowOptions,
    body_a: &SolverBody,
    body_b: &SolverBody,
) {
    row.eff_mass = effective_mass(row, body_a, body_b);
    let relvel = relative_velocity(row, body_a, body_b);
    row.rhs = -(options.error * options.erp + relvel * (1.0 + options.restitution));
}

fn apply_impulse(row: &ConstraintRow, impulse: f32, body_a: &mut SolverBody, body_b: &mut SolverBody) {
    body_a.delta_linvel += row.j[0] * (impulse * body_a.inv_mass);
    body_a.delta_angvel += body_a.inv_inertia * row.j[1] * impulse;
    body_b.delta_linvel += row.j[2] * (impulse * body_b.inv_mass);
    body_b.delta_angvel += body_b.inv_inertia * row.j[3] * impulse;

    if row.use_spin[0] {
        body_a.delta_spin += row.j[1].dot(body_a.spin_axis) * impulse * body_a.spin_inv_inertia;
    }
    if row.use_spin[1] {
        body_b.delta_spin += row.j[3].dot(body_b.spin_axis) * impulse * body_b.spin_inv_inertia;
    }
}

/// Seeds the iteration with the impulse persisted from the previous step.
pub fn warm_start(row: &ConstraintRow, bodies: &mut [SolverBody]) {
    let (body_a, body_b) = pair_mut(bodies, row.body_a, row.body_b);
    apply_impulse(row, row.impulse, body_a, body_b);
}

/// One projected Gauss-Seidel step:
/// `Δλ = m_eff · (rhs − J·Δv)`, clamp `λ + Δλ` to the limits, apply the
/// clamped difference.
pub fn solve_row(row: &mut ConstraintRow, bodies: &mut [SolverBody]) -> f32 {
    let (body_a, body_b) = pair_mut(bodies, row.body_a, row.body_b);

    let delta_relvel = row.j[0].dot(body_a.delta_linvel)
        + row.j[1].dot(body_a.delta_angvel_with_spin(row.use_spin[0]))
        + row.j[2].dot(body_b.delta_linvel)
        + row.j[3].dot(body_b.delta_angvel_with_spin(row.use_spin[1]));

    let delta_impulse = (row.rhs - delta_relvel) * row.eff_mass;
    let impulse = (row.impulse + delta_impulse).clamp(row.lower_limit, row.upper_limit);
    let applied = impulse - row.impulse;
    row.impulse = impulse;

    apply_impulse(row, applied, body_a, body_b);
    applied
}

/// A pair of rows spanning the contact tangent plane, solved together so
/// their combined impulse stays inside the friction circle `μ·λ_n`.
#[derive(Debug, Clone)]
pub struct FrictionRowPair {
    pub body_a: usize,
    pub body_b: usize,
    pub rows: [FrictionRow; 2],
    pub friction_coefficient: f32,
    /// Index of the governing normal row in the row cache.
    pub normal_row: usize,
    pub use_spin: [bool; 2],
}

#[derive(Debug, Clone)]
pub struct FrictionRow {
    pub j: [Vec3; 4],
    pub eff_mass: f32,
    pub rhs: f32,
    pub impulse: f32,
}

impl FrictionRowPair {
    pub fn prepare(&mut self, body_a: &SolverBody, body_b: &SolverBody) {
        for row in &mut self.rows {
            let probe = ConstraintRow {
                body_a: self.body_a,
                body_b: self.body_b,
                j: row.j,
                eff_mass: 0.0,
                rhs: 0.0,
                lower_limit: 0.0,
                upper_limit: 0.0,
                impulse: 0.0,
                use_spin: self.use_spin,
            };
            row.eff_mass = effective_mass(&probe, body_a, body_b);
            row.rhs = -relative_velocity(&probe, body_a, body_b);
        }
    }

    pub fn warm_start(&self, bodies: &mut [SolverBody]) {
        let (body_a, body_b) = pair_mut(bodies, self.body_a, self.body_b);
        for row in &self.rows {
            let probe = self.probe(row);
            apply_impulse(&probe, row.impulse, body_a, body_b);
        }
    }

    /// Solves both tangent rows and clamps the combined impulse magnitude to
    /// `μ · λ_n`, scaling both components when the circle is exceeded.
    pub fn solve(&mut self, normal_impulse: f32, bodies: &mut [SolverBody]) {
        let (body_a, body_b) = pair_mut(bodies, self.body_a, self.body_b);

        let mut candidates = [0.0f32; 2];
        for (i, row) in self.rows.iter().enumerate() {
            let probe = self.probe(row);
            let delta_relvel = probe.j[0].dot(body_a.delta_linvel)
                + probe.j[1].dot(body_a.delta_angvel_with_spin(probe.use_spin[0]))
                + probe.j[2].dot(body_b.delta_linvel)
                + probe.j[3].dot(body_b.delta_angvel_with_spin(probe.use_spin[1]));
            candidates[i] = self.rows[i].impulse + (row.rhs - delta_relvel) * row.eff_mass;
        }

        let limit = self.friction_coefficient * normal_impulse.max(0.0);
        let len_sq = candidates[0] * candidates[0] + candidates[1] * candidates[1];
        if len_sq > limit * limit && len_sq > f32::EPSILON {
            let scale = limit / len_sq.sqrt();
            candidates[0] *= scale;
            candidates[1] *= scale;
        }

        for (i, row) in self.rows.iter_mut().enumerate() {
            let applied = candidates[i] - row.impulse;
            row.impulse = candidates[i];
            let probe = ConstraintRow {
                body_a: self.body_a,
                body_b: self.body_b,
                j: row.j,
                eff_mass: row.eff_mass,
                rhs: row.rhs,
                lower_limit: f32::NEG_INFINITY,
                upper_limit: f32::INFINITY,
                impulse: 0.0,
                use_spin: self.use_spin,
            };
            apply_impulse(&probe, applied, body_a, body_b);
        }
    }

    fn probe(&self, row: &FrictionRow) -> ConstraintRow {
        ConstraintRow {
            body_a: self.body_a,
            body_b: self.body_b,
            j: row.j,
            eff_mass: row.eff_mass,
            rhs: row.rhs,
            lower_limit: f32::NEG_INFINITY,
            upper_limit: f32::INFINITY,
            impulse: 0.0,
            use_spin: self.use_spin,
        }
    }
}

/// Single row about the contact normal resisting spinning, clamped by the
/// same `μ·λ_n` product as the friction circle.
#[derive(Debug, Clone)]
pub struct SpinFrictionRow {
    pub body_a: usize,
    pub body_b: usize,
    pub axis: Vec3,
    pub eff_mass: f32,
    pub impulse: f32,
    pub friction_coefficient: f32,
    pub normal_row: usize,
}

impl SpinFrictionRow {
    pub fn prepare(&mut self, body_a: &SolverBody, body_b: &SolverBody) {
        let j_invm_jt = (body_a.inv_inertia * self.axis).dot(self.axis)
            + (body_b.inv_inertia * self.axis).dot(self.axis);
        self.eff_mass = if j_invm_jt > f32::EPSILON {
            1.0 / j_invm_jt
        } else {
            0.0
        };
    }

    pub fn solve(&mut self, normal_impulse: f32, bodies: &mut [SolverBody]) {
        let (body_a, body_b) = pair_mut(bodies, self.body_a, self.body_b);
        let relvel = self.axis.dot(
            body_a.angvel + body_a.delta_angvel - body_b.angvel - body_b.delta_angvel,
        );
        let limit = self.friction_coefficient * normal_impulse.max(0.0);
        let impulse = (self.impulse - relvel * self.eff_mass).clamp(-limit, limit);
        let applied = impulse - self.impulse;
        self.impulse = impulse;

        body_a.delta_angvel += body_a.inv_inertia * self.axis * applied;
        body_b.delta_angvel -= body_b.inv_inertia * self.axis * applied;
    }
}

/// Position-level counterpart of the velocity rows: applies a direct
/// transform correction along a Jacobian, using the quaternion derivative
/// for the angular part, and refreshes the world inertias it holds so
/// consecutive corrections see current state. Tracks the largest error.
pub struct PositionSolver<'a> {
    pub transform_a: &'a mut Transform,
    pub transform_b: &'a mut Transform,
    pub inv_mass_a: f32,
    pub inv_mass_b: f32,
    pub inv_inertia_a: Mat3,
    pub inv_inertia_b: Mat3,
    pub inv_inertia_local_a: Mat3,
    pub inv_inertia_local_b: Mat3,
    pub error_correction_rate: f32,
    pub max_error: f32,
}

impl PositionSolver<'_> {
    /// One correction: the transforms move along `J` by
    /// `error · rate · m_eff`, without touching velocities.
    pub fn solve(&mut self, j: [Vec3; 4], error: f32) {
        let j_invm_jt = j[0].dot(j[0]) * self.inv_mass_a
            + (self.inv_inertia_a * j[1]).dot(j[1])
            + j[2].dot(j[2]) * self.inv_mass_b
            + (self.inv_inertia_b * j[3]).dot(j[3]);
        if j_invm_jt <= f32::EPSILON {
            return;
        }
        let correction = error * self.error_correction_rate / j_invm_jt;

        self.transform_a.position += j[0] * (self.inv_mass_a * correction);
        self.transform_b.position += j[2] * (self.inv_mass_b * correction);

        let angular_a = self.inv_inertia_a * j[1] * correction;
        self.transform_a.orientation = rotated_by(self.transform_a.orientation, angular_a);
        let angular_b = self.inv_inertia_b * j[3] * correction;
        self.transform_b.orientation = rotated_by(self.transform_b.orientation, angular_b);

        // World inertias under the corrected orientations.
        let basis_a = Mat3::from_quat(self.transform_a.orientation);
        self.inv_inertia_a = basis_a * self.inv_inertia_local_a * basis_a.transpose();
        let basis_b = Mat3::from_quat(self.transform_b.orientation);
        self.inv_inertia_b = basis_b * self.inv_inertia_local_b * basis_b.transpose();

        self.max_error = self.max_error.max(error.abs());
    }
}

/// Small-angle orientation update via the quaternion derivative.
fn rotated_by(orientation: Quat, angular: Vec3) -> Quat {
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

fn pair_mut(bodies: &mut [SolverBody], a: usize, b: usize) -> (&mut SolverBody, &mut SolverBody) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = bodies.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = bodies.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(inv_mass: f32) -> SolverBody {
        SolverBody {
            entity: EntityId::default(),
            linvel: Vec3::ZERO,
            angvel: Vec3::ZERO,
            spin_rate: 0.0,
            spin_axis: Vec3::X,
            inv_mass,
            inv_inertia: Mat3::IDENTITY * inv_mass,
            spin_inv_inertia: inv_mass,
            delta_linvel: Vec3::ZERO,
            delta_angvel: Vec3::ZERO,
            delta_spin: 0.0,
        }
    }

    #[test]
    fn unilateral_row_never_pulls() {
        let mut bodies = vec![body(1.0), body(0.0)];
        bodies[0].linvel = Vec3::new(0.0, 1.0, 0.0); // separating already

        let mut row = ConstraintRow::new(0, 1, [Vec3::Y, Vec3::ZERO, -Vec3::Y, Vec3::ZERO])
            .limits(0.0, f32::INFINITY);
        prepare_row(&mut row, &RowOptions::default(), &bodies[0], &bodies[1]);
        solve_row(&mut row, &mut bodies);

        assert_eq!(row.impulse, 0.0);
        assert_eq!(bodies[0].delta_linvel, Vec3::ZERO);
    }

    #[test]
    fn normal_row_stops_approach_velocity() {
        let mut bodies = vec![body(1.0), body(0.0)];
        bodies[0].linvel = Vec3::new(0.0, -2.0, 0.0);

        let mut row = ConstraintRow::new(0, 1, [Vec3::Y, Vec3::ZERO, -Vec3::Y, Vec3::ZERO])
            .limits(0.0, f32::INFINITY);
        prepare_row(&mut row, &RowOptions::default(), &bodies[0], &bodies[1]);

        for _ in 0..4 {
            solve_row(&mut row, &mut bodies);
        }

        let final_velocity = bodies[0].linvel + bodies[0].delta_linvel;
        assert!(final_velocity.y.abs() < 1e-4);
        assert!((row.impulse - 2.0).abs() < 1e-4);
    }

    #[test]
    fn friction_impulse_stays_inside_circle() {
        let mut bodies = vec![body(1.0), body(0.0)];
        bodies[0].linvel = Vec3::new(5.0, 0.0, 0.0); // fast slide

        let mut pair = FrictionRowPair {
            body_a: 0,
            body_b: 1,
            rows: [
                FrictionRow {
                    j: [Vec3::X, Vec3::ZERO, -Vec3::X, Vec3::ZERO],
                    eff_mass: 0.0,
                    rhs: 0.0,
                    impulse: 0.0,
                },
                FrictionRow {
                    j: [Vec3::Z, Vec3::ZERO, -Vec3::Z, Vec3::ZERO],
                    eff_mass: 0.0,
                    rhs: 0.0,
                    impulse: 0.0,
                },
            ],
            friction_coefficient: 0.5,
            normal_row: 0,
            use_spin: [false, false],
        };
        let (a, b) = (bodies[0].clone(), bodies[1].clone());
        pair.prepare(&a, &b);
        pair.solve(1.0, &mut bodies);

        let total = (pair.rows[0].impulse.powi(2) + pair.rows[1].impulse.powi(2)).sqrt();
        assert!(total <= 0.5 + 1e-5);
    }

    #[test]
    fn warm_start_applies_persisted_impulse() {
        let mut bodies = vec![body(1.0), body(0.0)];
        let mut row = ConstraintRow::new(0, 1, [Vec3::Y, Vec3::ZERO, -Vec3::Y, Vec3::ZERO]);
        row.impulse = 2.0;
        warm_start(&row, &mut bodies);
        assert!((bodies[0].delta_linvel.y - 2.0).abs() < 1e-6);
    }
}

//! Joint constraints. Every kind implements [`ConstraintPrepare`], turning
//! its geometry into solver rows for the current step; storage is a tagged
//! enum so the solver iterates a homogeneous list without virtual dispatch.

use crate::core::graph::EdgeIndex;
use crate::core::types::Transform;
use crate::dynamics::row::{
    prepare_row, ConstraintRow, PositionSolver, RowOptions, SolverBody,
};
use crate::utils::allocator::EntityId;
use glam::{Quat, Vec3};

/// Collected rows for one island solve, with per-constraint ranges so
/// converged impulses can be written back for warm starting.
#[derive(Default)]
pub struct RowCache {
    pub rows: Vec<ConstraintRow>,
    pub friction: Vec<crate::dynamics::row::FrictionRowPair>,
    pub rolling: Vec<crate::dynamics::row::FrictionRowPair>,
    pub spinning: Vec<crate::dynamics::row::SpinFrictionRow>,
    ranges: Vec<(EntityId, std::ops::Range<usize>)>,
}

impl RowCache {
    pub fn clear(&mut self) {
        self.rows.clear();
        self.friction.clear();
        self.rolling.clear();
        self.spinning.clear();
        self.ranges.clear();
    }

    pub fn begin_constraint(&mut self) -> usize {
        self.rows.len()
    }

    pub fn end_constraint(&mut self, entity: EntityId, start: usize) {
        self.ranges.push((entity, start..self.rows.len()));
    }

    pub fn constraint_ranges(&self) -> &[(EntityId, std::ops::Range<usize>)] {
        &self.ranges
    }
}

/// Everything a joint needs to emit rows for one step.
pub struct PrepareContext<'a> {
    pub body_a: usize,
    pub body_b: usize,
    pub transform_a: &'a Transform,
    pub transform_b: &'a Transform,
    pub dt: f32,
}

/// Implemented by every joint kind: produce constraint rows for the pair.
pub trait ConstraintPrepare {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache);

    /// Receives the converged impulses of the rows this joint emitted, in
    /// emission order, for warm starting the next step.
    fn store_impulses(&mut self, impulses: &[f32]);

    /// Position-level correction run after integration. Most joints rely on
    /// their velocity rows and the ERP feedback alone; kinds with a
    /// positional contract override this.
    fn solve_position(&self, _solver: &mut PositionSolver) {}
}

/// A constraint entity: a graph edge carrying one joint.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub id: EntityId,
    pub body_a: EntityId,
    pub body_b: EntityId,
    pub joint: Joint,
    pub(crate) edge: EdgeIndex,
}

/// Tagged storage over all joint kinds.
#[derive(Debug, Clone)]
pub enum Joint {
    Point(PointJoint),
    Distance(DistanceJoint),
    SoftDistance(SoftDistanceJoint),
    Hinge(HingeJoint),
    Generic(GenericJoint),
    CvJoint(CvJoint),
    ConeLimit(ConeLimitJoint),
    Gravity(GravityJoint),
    AntiRollBar(AntiRollBarJoint),
    DoubleWishbone(DoubleWishboneJoint),
    TieRod(TieRodJoint),
    Differential(DifferentialJoint),
    TireCarcass(TireCarcassJoint),
    SpringDamper(SpringDamperJoint),
    SpinEquality(SpinEqualityJoint),
    TripleSpinGear(TripleSpinGearJoint),
}

impl ConstraintPrepare for Joint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        match self {
            Joint::Point(j) => j.prepare(ctx, bodies, cache),
            Joint::Distance(j) => j.prepare(ctx, bodies, cache),
            Joint::SoftDistance(j) => j.prepare(ctx, bodies, cache),
            Joint::Hinge(j) => j.prepare(ctx, bodies, cache),
            Joint::Generic(j) => j.prepare(ctx, bodies, cache),
            Joint::CvJoint(j) => j.prepare(ctx, bodies, cache),
            Joint::ConeLimit(j) => j.prepare(ctx, bodies, cache),
            Joint::Gravity(j) => j.prepare(ctx, bodies, cache),
            Joint::AntiRollBar(j) => j.prepare(ctx, bodies, cache),
            Joint::DoubleWishbone(j) => j.prepare(ctx, bodies, cache),
            Joint::TieRod(j) => j.prepare(ctx, bodies, cache),
            Joint::Differential(j) => j.prepare(ctx, bodies, cache),
            Joint::TireCarcass(j) => j.prepare(ctx, bodies, cache),
            Joint::SpringDamper(j) => j.prepare(ctx, bodies, cache),
            Joint::SpinEquality(j) => j.prepare(ctx, bodies, cache),
            Joint::TripleSpinGear(j) => j.prepare(ctx, bodies, cache),
        }
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        match self {
            Joint::Point(j) => j.store_impulses(impulses),
            Joint::Distance(j) => j.store_impulses(impulses),
            Joint::SoftDistance(j) => j.store_impulses(impulses),
            Joint::Hinge(j) => j.store_impulses(impulses),
            Joint::Generic(j) => j.store_impulses(impulses),
            Joint::CvJoint(j) => j.store_impulses(impulses),
            Joint::ConeLimit(j) => j.store_impulses(impulses),
            Joint::Gravity(j) => j.store_impulses(impulses),
            Joint::AntiRollBar(j) => j.store_impulses(impulses),
            Joint::DoubleWishbone(j) => j.store_impulses(impulses),
            Joint::TieRod(j) => j.store_impulses(impulses),
            Joint::Differential(j) => j.store_impulses(impulses),
            Joint::TireCarcass(j) => j.store_impulses(impulses),
            Joint::SpringDamper(j) => j.store_impulses(impulses),
            Joint::SpinEquality(j) => j.store_impulses(impulses),
            Joint::TripleSpinGear(j) => j.store_impulses(impulses),
        }
    }

    fn solve_position(&self, solver: &mut PositionSolver) {
        match self {
            Joint::Point(j) => j.solve_position(solver),
            Joint::Distance(j) => j.solve_position(solver),
            Joint::SoftDistance(j) => j.solve_position(solver),
            Joint::Hinge(j) => j.solve_position(solver),
            Joint::Generic(j) => j.solve_position(solver),
            Joint::CvJoint(j) => j.solve_position(solver),
            Joint::ConeLimit(j) => j.solve_position(solver),
            Joint::Gravity(j) => j.solve_position(solver),
            Joint::AntiRollBar(j) => j.solve_position(solver),
            Joint::DoubleWishbone(j) => j.solve_position(solver),
            Joint::TieRod(j) => j.solve_position(solver),
            Joint::Differential(j) => j.solve_position(solver),
            Joint::TireCarcass(j) => j.solve_position(solver),
            Joint::SpringDamper(j) => j.solve_position(solver),
            Joint::SpinEquality(j) => j.solve_position(solver),
            Joint::TripleSpinGear(j) => j.solve_position(solver),
        }
    }
}

fn copy_impulses(stored: &mut [f32], impulses: &[f32]) {
    for (slot, &impulse) in stored.iter_mut().zip(impulses) {
        *slot = impulse;
    }
}

/// Emits the three rows locking the world-space offset between two local
/// pivots, shared by several joints.
#[allow(clippy::too_many_arguments)]
fn push_point_rows(
    ctx: &PrepareContext,
    bodies: &[SolverBody],
    cache: &mut RowCache,
    pivot_a: Vec3,
    pivot_b: Vec3,
    impulses: &[f32; 3],
    erp: f32,
) {
    let world_a = ctx.transform_a.to_world(pivot_a);
    let world_b = ctx.transform_b.to_world(pivot_b);
    let r_a = world_a - ctx.transform_a.position;
    let r_b = world_b - ctx.transform_b.position;
    let error = world_a - world_b;

    for (i, axis) in [Vec3::X, Vec3::Y, Vec3::Z].into_iter().enumerate() {
        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [axis, r_a.cross(axis), -axis, -(r_b.cross(axis))],
        );
        row.impulse = impulses[i];
        prepare_row(
            &mut row,
            &RowOptions {
                error: error.dot(axis),
                erp: erp / ctx.dt,
                restitution: 0.0,
            },
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        cache.rows.push(row);
    }
}

/// Ball-and-socket: pins two local pivots together.
#[derive(Debug, Clone, Default)]
pub struct PointJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub impulse: [f32; 3],
}

impl ConstraintPrepare for PointJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        push_point_rows(ctx, bodies, cache, self.pivot_a, self.pivot_b, &self.impulse, 0.2);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(&mut self.impulse, impulses);
    }
}

/// Rigid rod keeping two pivots at a fixed distance.
#[derive(Debug, Clone, Default)]
pub struct DistanceJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub distance: f32,
    pub impulse: f32,
}

impl ConstraintPrepare for DistanceJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let world_a = ctx.transform_a.to_world(self.pivot_a);
        let world_b = ctx.transform_b.to_world(self.pivot_b);
        let delta = world_a - world_b;
        let length = delta.length();
        // Coincident pivots leave the axis undefined; pick +x.
        let dir = if length > 1e-6 { delta / length } else { Vec3::X };
        let r_a = world_a - ctx.transform_a.position;
        let r_b = world_b - ctx.transform_b.position;

        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [dir, r_a.cross(dir), -dir, -(r_b.cross(dir))],
        );
        row.impulse = self.impulse;
        prepare_row(
            &mut row,
            &RowOptions {
                error: length - self.distance,
                erp: 0.2 / ctx.dt,
                restitution: 0.0,
            },
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        cache.rows.push(row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Spring-damper acting along the pivot axis: the row's impulse is limited
/// to what the spring and damper can exert over one step.
#[derive(Debug, Clone, Default)]
pub struct SoftDistanceJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub rest_length: f32,
    pub stiffness: f32,
    pub damping: f32,
    pub impulse: f32,
}

impl ConstraintPrepare for SoftDistanceJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let world_a = ctx.transform_a.to_world(self.pivot_a);
        let world_b = ctx.transform_b.to_world(self.pivot_b);
        let delta = world_a - world_b;
        let length = delta.length();
        let dir = if length > 1e-6 { delta / length } else { Vec3::X };
        let r_a = world_a - ctx.transform_a.position;
        let r_b = world_b - ctx.transform_b.position;

        let stretch = length - self.rest_length;
        let spring_impulse = self.stiffness * stretch * ctx.dt;
        let damper_impulse = (self.damping * ctx.dt).max(0.0);

        let body_a = &bodies[ctx.body_a];
        let body_b = &bodies[ctx.body_b];
        let relspd = dir.dot(body_a.linvel + body_a.angvel.cross(r_a))
            - dir.dot(body_b.linvel + body_b.angvel.cross(r_b));
        let damping_limit = damper_impulse * relspd.abs() + spring_impulse.abs();

        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [dir, r_a.cross(dir), -dir, -(r_b.cross(dir))],
        )
        .limits(-damping_limit, damping_limit);
        row.impulse = self.impulse.clamp(-damping_limit, damping_limit);
        prepare_row(
            &mut row,
            &RowOptions {
                error: stretch,
                erp: 0.2 / ctx.dt,
                restitution: 0.0,
            },
            body_a,
            body_b,
        );
        cache.rows.push(row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Hinge: a point joint plus two angular rows keeping the hinge axes
/// aligned, with an optional swing limit about the axis.
#[derive(Debug, Clone)]
pub struct HingeJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    /// Hinge axis in each body's object space.
    pub axis_a: Vec3,
    pub axis_b: Vec3,
    pub limit: Option<(f32, f32)>,
    pub impulse: [f32; 6],
}

impl Default for HingeJoint {
    fn default() -> Self {
        Self {
            pivot_a: Vec3::ZERO,
            pivot_b: Vec3::ZERO,
            axis_a: Vec3::X,
            axis_b: Vec3::X,
            limit: None,
            impulse: [0.0; 6],
        }
    }
}

impl ConstraintPrepare for HingeJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let point_impulse = [self.impulse[0], self.impulse[1], self.impulse[2]];
        push_point_rows(ctx, bodies, cache, self.pivot_a, self.pivot_b, &point_impulse, 0.2);

        let axis_a = ctx.transform_a.orientation * self.axis_a;
        let axis_b = ctx.transform_b.orientation * self.axis_b;

        // Two rows orthogonal to the hinge axis kill the off-axis relative
        // rotation.
        let (ortho_u, ortho_v) = orthonormal_basis(axis_a);
        for (i, ortho) in [ortho_u, ortho_v].into_iter().enumerate() {
            let mut row = ConstraintRow::new(
                ctx.body_a,
                ctx.body_b,
                [Vec3::ZERO, ortho, Vec3::ZERO, -ortho],
            );
            row.impulse = self.impulse[3 + i];
            prepare_row(
                &mut row,
                &RowOptions {
                    error: axis_b.dot(ortho),
                    erp: 0.2 / ctx.dt,
                    restitution: 0.0,
                },
                &bodies[ctx.body_a],
                &bodies[ctx.body_b],
            );
            cache.rows.push(row);
        }

        if let Some((min, max)) = self.limit {
            let angle = hinge_angle(ctx, axis_a);
            let (error, lower, upper) = if angle < min {
                (angle - min, 0.0, f32::INFINITY)
            } else if angle > max {
                (angle - max, f32::NEG_INFINITY, 0.0)
            } else {
                (0.0, 0.0, 0.0)
            };
            let mut row = ConstraintRow::new(
                ctx.body_a,
                ctx.body_b,
                [Vec3::ZERO, axis_a, Vec3::ZERO, -axis_a],
            )
            .limits(lower, upper);
            row.impulse = self.impulse[5].clamp(lower, upper);
            prepare_row(
                &mut row,
                &RowOptions {
                    error,
                    erp: 0.2 / ctx.dt,
                    restitution: 0.0,
                },
                &bodies[ctx.body_a],
                &bodies[ctx.body_b],
            );
            cache.rows.push(row);
        }
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(&mut self.impulse, impulses);
    }
}

/// Relative angle of B about the hinge axis, measured between the
/// projections of a reference direction.
fn hinge_angle(ctx: &PrepareContext, axis: Vec3) -> f32 {
    let (ref_u, ref_v) = orthonormal_basis(axis);
    let marker = ctx.transform_b.orientation * ref_u;
    let projected = marker - axis * marker.dot(axis);
    projected.dot(ref_v).atan2(projected.dot(ref_u))
}

/// Locks all six degrees of freedom between the two bodies.
#[derive(Debug, Clone, Default)]
pub struct GenericJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub impulse: [f32; 6],
}

impl ConstraintPrepare for GenericJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let point_impulse = [self.impulse[0], self.impulse[1], self.impulse[2]];
        push_point_rows(ctx, bodies, cache, self.pivot_a, self.pivot_b, &point_impulse, 0.2);

        // The relative orientation error as a rotation vector, one row per
        // world axis.
        let rel = ctx.transform_b.orientation * ctx.transform_a.orientation.conjugate();
        let (axis, angle) = rel.to_axis_angle();
        let error_vec = if angle.abs() > 1e-6 { axis * angle } else { Vec3::ZERO };

        for (i, world_axis) in [Vec3::X, Vec3::Y, Vec3::Z].into_iter().enumerate() {
            let mut row = ConstraintRow::new(
                ctx.body_a,
                ctx.body_b,
                [Vec3::ZERO, world_axis, Vec3::ZERO, -world_axis],
            );
            row.impulse = self.impulse[3 + i];
            prepare_row(
                &mut row,
                &RowOptions {
                    error: -error_vec.dot(world_axis),
                    erp: 0.2 / ctx.dt,
                    restitution: 0.0,
                },
                &bodies[ctx.body_a],
                &bodies[ctx.body_b],
            );
            cache.rows.push(row);
        }
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(&mut self.impulse, impulses);
    }
}

/// Constant-velocity joint: pins the pivots and keeps the drive axes
/// co-rotating without constraining the twist angle.
#[derive(Debug, Clone)]
pub struct CvJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub axis_a: Vec3,
    pub axis_b: Vec3,
    pub impulse: [f32; 5],
}

impl Default for CvJoint {
    fn default() -> Self {
        Self {
            pivot_a: Vec3::ZERO,
            pivot_b: Vec3::ZERO,
            axis_a: Vec3::X,
            axis_b: Vec3::X,
            impulse: [0.0; 5],
        }
    }
}

impl ConstraintPrepare for CvJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let point_impulse = [self.impulse[0], self.impulse[1], self.impulse[2]];
        push_point_rows(ctx, bodies, cache, self.pivot_a, self.pivot_b, &point_impulse, 0.2);

        let axis_a = ctx.transform_a.orientation * self.axis_a;
        let axis_b = ctx.transform_b.orientation * self.axis_b;
        let (ortho_u, ortho_v) = orthonormal_basis(axis_a);
        for (i, ortho) in [ortho_u, ortho_v].into_iter().enumerate() {
            let mut row = ConstraintRow::new(
                ctx.body_a,
                ctx.body_b,
                [Vec3::ZERO, ortho, Vec3::ZERO, -ortho],
            );
            row.impulse = self.impulse[3 + i];
            prepare_row(
                &mut row,
                &RowOptions {
                    error: axis_b.dot(ortho),
                    erp: 0.2 / ctx.dt,
                    restitution: 0.0,
                },
                &bodies[ctx.body_a],
                &bodies[ctx.body_b],
            );
            cache.rows.push(row);
        }
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(&mut self.impulse, impulses);
    }

    /// Angular correction along the twist axes followed by a correction
    /// joining the pivot points together.
    fn solve_position(&self, solver: &mut PositionSolver) {
        let twist_axis_a = solver.transform_a.orientation * self.axis_a;
        let twist_axis_b = solver.transform_b.orientation * self.axis_b;
        let angle = twist_angle(
            solver.transform_a.orientation,
            self.axis_a,
            solver.transform_b.orientation,
            self.axis_b,
        );
        solver.solve(
            [Vec3::ZERO, twist_axis_a, Vec3::ZERO, -twist_axis_b],
            angle,
        );

        let pivot_a = solver.transform_a.to_world(self.pivot_a);
        let pivot_b = solver.transform_b.to_world(self.pivot_b);
        let dir = pivot_a - pivot_b;
        let error = dir.length();
        if error > 1e-6 {
            let dir = dir / error;
            let r_a = pivot_a - solver.transform_a.position;
            let r_b = pivot_b - solver.transform_b.position;
            solver.solve([dir, r_a.cross(dir), -dir, -(r_b.cross(dir))], -error);
        }
    }
}

/// Signed twist of frame B ahead of frame A about the drive axis, measured
/// between reference directions orthogonal to each body's axis.
fn twist_angle(orientation_a: Quat, axis_a: Vec3, orientation_b: Quat, axis_b: Vec3) -> f32 {
    let world_axis = orientation_a * axis_a;
    let (ref_a, _) = orthonormal_basis(axis_a);
    let (ref_b, _) = orthonormal_basis(axis_b);
    let marker_a = orientation_a * ref_a;
    let marker_b = orientation_b * ref_b;

    let projected_a = (marker_a - world_axis * marker_a.dot(world_axis)).normalize_or_zero();
    let projected_b = (marker_b - world_axis * marker_b.dot(world_axis)).normalize_or_zero();
    if projected_a == Vec3::ZERO || projected_b == Vec3::ZERO {
        return 0.0;
    }

    let sin = projected_a.cross(projected_b).dot(world_axis);
    let cos = projected_a.dot(projected_b);
    sin.atan2(cos)
}

/// Keeps body B's axis inside a cone around body A's axis. Emits a single
/// unilateral angular row while outside the cone.
#[derive(Debug, Clone)]
pub struct ConeLimitJoint {
    pub axis_a: Vec3,
    pub axis_b: Vec3,
    pub half_angle: f32,
    pub impulse: f32,
}

impl Default for ConeLimitJoint {
    fn default() -> Self {
        Self {
            axis_a: Vec3::X,
            axis_b: Vec3::X,
            half_angle: std::f32::consts::FRAC_PI_4,
            impulse: 0.0,
        }
    }
}

impl ConstraintPrepare for ConeLimitJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let axis_a = ctx.transform_a.orientation * self.axis_a;
        let axis_b = ctx.transform_b.orientation * self.axis_b;
        let angle = axis_a.dot(axis_b).clamp(-1.0, 1.0).acos();
        if angle <= self.half_angle {
            return;
        }

        // Push about the axis that reduces the cone angle.
        let correction_axis = axis_b.cross(axis_a);
        if correction_axis.length_squared() < 1e-12 {
            return;
        }
        let correction_axis = correction_axis.normalize();

        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [Vec3::ZERO, correction_axis, Vec3::ZERO, -correction_axis],
        )
        .limits(0.0, f32::INFINITY);
        row.impulse = self.impulse.max(0.0);
        prepare_row(
            &mut row,
            &RowOptions {
                error: -(angle - self.half_angle),
                erp: 0.2 / ctx.dt,
                restitution: 0.0,
            },
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        cache.rows.push(row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Mutual Newtonian attraction between the pair, expressed as an equality
/// row whose impulse is exactly the gravitational impulse for this step.
#[derive(Debug, Clone)]
pub struct GravityJoint {
    pub gravitational_constant: f32,
    pub impulse: f32,
}

impl Default for GravityJoint {
    fn default() -> Self {
        Self {
            gravitational_constant: 6.674e-11,
            impulse: 0.0,
        }
    }
}

impl ConstraintPrepare for GravityJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let body_a = &bodies[ctx.body_a];
        let body_b = &bodies[ctx.body_b];
        if body_a.inv_mass == 0.0 || body_b.inv_mass == 0.0 {
            return;
        }

        let delta = ctx.transform_b.position - ctx.transform_a.position;
        let dist_sq = delta.length_squared().max(1e-6);
        let dir = delta / dist_sq.sqrt();

        let mass_a = 1.0 / body_a.inv_mass;
        let mass_b = 1.0 / body_b.inv_mass;
        let force = self.gravitational_constant * mass_a * mass_b / dist_sq;
        let impulse = force * ctx.dt;

        // Equality row: lower == upper forces exactly this impulse.
        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [dir, Vec3::ZERO, -dir, Vec3::ZERO],
        )
        .limits(impulse, impulse);
        row.impulse = 0.0;
        prepare_row(
            &mut row,
            &RowOptions {
                error: 0.0,
                erp: 0.0,
                restitution: 0.0,
            },
            body_a,
            body_b,
        );
        // The rhs must not fight the equality limits.
        row.rhs = 0.0;
        cache.rows.push(row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Anti-roll bar: torsion spring resisting the roll-angle difference
/// between two suspension sides.
#[derive(Debug, Clone)]
pub struct AntiRollBarJoint {
    pub axis: Vec3,
    pub stiffness: f32,
    pub impulse: f32,
}

impl Default for AntiRollBarJoint {
    fn default() -> Self {
        Self {
            axis: Vec3::X,
            stiffness: 1000.0,
            impulse: 0.0,
        }
    }
}

impl ConstraintPrepare for AntiRollBarJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let axis = ctx.transform_a.orientation * self.axis;
        let rel = ctx.transform_b.orientation * ctx.transform_a.orientation.conjugate();
        let (rel_axis, rel_angle) = rel.to_axis_angle();
        let roll = rel_axis.dot(axis) * rel_angle;

        let max_impulse = (self.stiffness * roll.abs() * ctx.dt).max(0.0);
        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [Vec3::ZERO, axis, Vec3::ZERO, -axis],
        )
        .limits(-max_impulse, max_impulse);
        row.impulse = self.impulse.clamp(-max_impulse, max_impulse);
        prepare_row(
            &mut row,
            &RowOptions {
                error: roll,
                erp: 0.2 / ctx.dt,
                restitution: 0.0,
            },
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        cache.rows.push(row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Double wishbone linkage: the chassis (A) holds the steering knuckle (B)
/// through rigid upper and lower control arms.
#[derive(Debug, Clone, Default)]
pub struct DoubleWishboneJoint {
    pub upper_pivot_a: Vec3,
    pub upper_pivot_b: Vec3,
    pub upper_length: f32,
    pub lower_pivot_a: Vec3,
    pub lower_pivot_b: Vec3,
    pub lower_length: f32,
    pub impulse: [f32; 2],
}

impl ConstraintPrepare for DoubleWishboneJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let arms = [
            (self.upper_pivot_a, self.upper_pivot_b, self.upper_length, self.impulse[0]),
            (self.lower_pivot_a, self.lower_pivot_b, self.lower_length, self.impulse[1]),
        ];

        for (pivot_a, pivot_b, length, impulse) in arms {
            let world_a = ctx.transform_a.to_world(pivot_a);
            let world_b = ctx.transform_b.to_world(pivot_b);
            let delta = world_a - world_b;
            let current = delta.length();
            let dir = if current > 1e-6 { delta / current } else { Vec3::X };
            let r_a = world_a - ctx.transform_a.position;
            let r_b = world_b - ctx.transform_b.position;

            let mut row = ConstraintRow::new(
                ctx.body_a,
                ctx.body_b,
                [dir, r_a.cross(dir), -dir, -(r_b.cross(dir))],
            );
            row.impulse = impulse;
            prepare_row(
                &mut row,
                &RowOptions {
                    error: current - length,
                    erp: 0.2 / ctx.dt,
                    restitution: 0.0,
                },
                &bodies[ctx.body_a],
                &bodies[ctx.body_b],
            );
            cache.rows.push(row);
        }
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(&mut self.impulse, impulses);
    }
}

/// Tie rod: a single rigid link between the steering rack and the knuckle.
#[derive(Debug, Clone, Default)]
pub struct TieRodJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub length: f32,
    pub impulse: f32,
}

impl ConstraintPrepare for TieRodJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        DistanceJoint {
            pivot_a: self.pivot_a,
            pivot_b: self.pivot_b,
            distance: self.length,
            impulse: self.impulse,
        }
        .prepare(ctx, bodies, cache);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Open differential between two drive shafts: their spin rates average to
/// the carrier ratio, solved as a spin-coupled equality row.
#[derive(Debug, Clone)]
pub struct DifferentialJoint {
    pub ratio: f32,
    pub impulse: f32,
}

impl Default for DifferentialJoint {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            impulse: 0.0,
        }
    }
}

impl ConstraintPrepare for DifferentialJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let axis_a = bodies[ctx.body_a].spin_axis;
        let axis_b = bodies[ctx.body_b].spin_axis;
        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [Vec3::ZERO, axis_a, Vec3::ZERO, -axis_b * self.ratio],
        )
        .with_spin();
        row.impulse = self.impulse;
        prepare_row(
            &mut row,
            &RowOptions::default(),
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        cache.rows.push(row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Tire carcass: spring-damper pinning the tire ring to the wheel hub,
/// plus a spin-equality row transmitting drive torque.
#[derive(Debug, Clone)]
pub struct TireCarcassJoint {
    pub stiffness: f32,
    pub damping: f32,
    pub impulse: [f32; 4],
}

impl Default for TireCarcassJoint {
    fn default() -> Self {
        Self {
            stiffness: 50_000.0,
            damping: 500.0,
            impulse: [0.0; 4],
        }
    }
}

impl ConstraintPrepare for TireCarcassJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let delta = ctx.transform_a.position - ctx.transform_b.position;

        for (i, axis) in [Vec3::X, Vec3::Y, Vec3::Z].into_iter().enumerate() {
            let stretch = delta.dot(axis);
            let max_impulse =
                (self.stiffness * stretch.abs() + self.damping) * ctx.dt;
            let mut row = ConstraintRow::new(
                ctx.body_a,
                ctx.body_b,
                [axis, Vec3::ZERO, -axis, Vec3::ZERO],
            )
            .limits(-max_impulse, max_impulse);
            row.impulse = self.impulse[i].clamp(-max_impulse, max_impulse);
            prepare_row(
                &mut row,
                &RowOptions {
                    error: stretch,
                    erp: 0.2 / ctx.dt,
                    restitution: 0.0,
                },
                &bodies[ctx.body_a],
                &bodies[ctx.body_b],
            );
            cache.rows.push(row);
        }

        let axis_a = bodies[ctx.body_a].spin_axis;
        let axis_b = bodies[ctx.body_b].spin_axis;
        let mut spin_row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [Vec3::ZERO, axis_a, Vec3::ZERO, -axis_b],
        )
        .with_spin();
        spin_row.impulse = self.impulse[3];
        prepare_row(
            &mut spin_row,
            &RowOptions::default(),
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        cache.rows.push(spin_row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(&mut self.impulse, impulses);
    }
}

/// Coilover: soft distance with a preload offset.
#[derive(Debug, Clone, Default)]
pub struct SpringDamperJoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub rest_length: f32,
    pub preload: f32,
    pub stiffness: f32,
    pub damping: f32,
    pub impulse: f32,
}

impl ConstraintPrepare for SpringDamperJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        SoftDistanceJoint {
            pivot_a: self.pivot_a,
            pivot_b: self.pivot_b,
            rest_length: (self.rest_length - self.preload).max(0.0),
            stiffness: self.stiffness,
            damping: self.damping,
            impulse: self.impulse,
        }
        .prepare(ctx, bodies, cache);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Locks the two bodies' spin rates together.
#[derive(Debug, Clone, Default)]
pub struct SpinEqualityJoint {
    pub impulse: f32,
}

impl ConstraintPrepare for SpinEqualityJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        DifferentialJoint {
            ratio: 1.0,
            impulse: self.impulse,
        }
        .prepare(ctx, bodies, cache);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Gear coupling between two spinning bodies: `spin_a + ratio · spin_b = 0`.
#[derive(Debug, Clone)]
pub struct TripleSpinGearJoint {
    pub ratio: f32,
    pub impulse: f32,
}

impl Default for TripleSpinGearJoint {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            impulse: 0.0,
        }
    }
}

impl ConstraintPrepare for TripleSpinGearJoint {
    fn prepare(&self, ctx: &PrepareContext, bodies: &[SolverBody], cache: &mut RowCache) {
        let axis_a = bodies[ctx.body_a].spin_axis;
        let axis_b = bodies[ctx.body_b].spin_axis;
        let mut row = ConstraintRow::new(
            ctx.body_a,
            ctx.body_b,
            [Vec3::ZERO, axis_a, Vec3::ZERO, axis_b * self.ratio],
        )
        .with_spin();
        row.impulse = self.impulse;
        prepare_row(
            &mut row,
            &RowOptions::default(),
            &bodies[ctx.body_a],
            &bodies[ctx.body_b],
        );
        cache.rows.push(row);
    }

    fn store_impulses(&mut self, impulses: &[f32]) {
        copy_impulses(std::slice::from_mut(&mut self.impulse), impulses);
    }
}

/// Any unit vector pair orthogonal to `axis`.
fn orthonormal_basis(axis: Vec3) -> (Vec3, Vec3) {
    let helper = if axis.x.abs() < 0.9 { Vec3::X } else { Vec3::Y };
    let u = axis.cross(helper).normalize();
    let v = axis.cross(u);
    (u, v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat3;

    fn solver_body(inv_mass: f32) -> SolverBody {
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
    fn point_joint_emits_three_rows_with_position_error() {
        let bodies = vec![solver_body(1.0), solver_body(1.0)];
        let transform_a = Transform::from_position(Vec3::new(0.0, 1.0, 0.0));
        let transform_b = Transform::default();
        let ctx = PrepareContext {
            body_a: 0,
            body_b: 1,
            transform_a: &transform_a,
            transform_b: &transform_b,
            dt: 1.0 / 60.0,
        };

        let mut cache = RowCache::default();
        PointJoint::default().prepare(&ctx, &bodies, &mut cache);

        assert_eq!(cache.rows.len(), 3);
        // The y row sees the 1m offset and pushes against it.
        assert!(cache.rows[1].rhs < 0.0);
        assert_eq!(cache.rows[0].rhs, 0.0);
    }

    #[test]
    fn cone_limit_is_quiet_inside_the_cone() {
        let bodies = vec![solver_body(1.0), solver_body(1.0)];
        let transform_a = Transform::default();
        let transform_b = Transform::default();
        let ctx = PrepareContext {
            body_a: 0,
            body_b: 1,
            transform_a: &transform_a,
            transform_b: &transform_b,
            dt: 1.0 / 60.0,
        };

        let mut cache = RowCache::default();
        ConeLimitJoint::default().prepare(&ctx, &bodies, &mut cache);
        assert!(cache.rows.is_empty());
    }

    #[test]
    fn cvjoint_position_correction_reduces_twist_and_pivot_drift() {
        let mut transform_a = Transform::default();
        let mut transform_b =
            Transform::new(Vec3::new(0.2, 0.0, 0.0), Quat::from_rotation_x(0.4));
        let joint = CvJoint::default();

        let mut first_error = 0.0;
        for i in 0..20 {
            let mut solver = PositionSolver {
                transform_a: &mut transform_a,
                transform_b: &mut transform_b,
                inv_mass_a: 1.0,
                inv_mass_b: 1.0,
                inv_inertia_a: Mat3::IDENTITY,
                inv_inertia_b: Mat3::IDENTITY,
                inv_inertia_local_a: Mat3::IDENTITY,
                inv_inertia_local_b: Mat3::IDENTITY,
                error_correction_rate: 0.2,
                max_error: 0.0,
            };
            joint.solve_position(&mut solver);
            if i == 0 {
                first_error = solver.max_error;
            }
        }
        assert!(first_error > 0.0);

        let twist = twist_angle(
            transform_a.orientation,
            Vec3::X,
            transform_b.orientation,
            Vec3::X,
        );
        assert!(twist.abs() < 0.1, "residual twist {twist}");

        let drift = (transform_a.to_world(joint.pivot_a)
            - transform_b.to_world(joint.pivot_b))
        .length();
        assert!(drift < 0.05, "residual pivot drift {drift}");
    }

    #[test]
    fn spin_rows_couple_the_spin_degree() {
        let mut bodies = vec![solver_body(1.0), solver_body(1.0)];
        bodies[0].spin_rate = 10.0;
        let transform_a = Transform::default();
        let transform_b = Transform::default();
        let ctx = PrepareContext {
            body_a: 0,
            body_b: 1,
            transform_a: &transform_a,
            transform_b: &transform_b,
            dt: 1.0 / 60.0,
        };

        let mut cache = RowCache::default();
        SpinEqualityJoint::default().prepare(&ctx, &bodies, &mut cache);
        assert_eq!(cache.rows.len(), 1);
        assert!(cache.rows[0].use_spin.iter().all(|&s| s));
        // Spin rate difference shows up as approach velocity.
        assert!(cache.rows[0].rhs < 0.0);
    }
}

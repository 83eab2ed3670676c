use crate::config::{CONTACT_BREAKING_THRESHOLD, CONTACT_CACHING_THRESHOLD, MAX_CONTACTS};
use crate::core::graph::EdgeIndex;
use crate::core::types::{ContactMaterial, Transform};
use crate::utils::allocator::EntityId;
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Which body's object space the contact normal is stored in. Detached
/// normals are kept in world space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalAttachment {
    None,
    BodyA,
    BodyB,
}

/// One candidate closest-feature point produced by a collision routine, in
/// object space of each body.
#[derive(Debug, Clone, Copy)]
pub struct CollidePoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    /// World-space contact normal, pointing from B toward A.
    pub normal: Vec3,
    pub local_normal: Vec3,
    pub normal_attachment: NormalAttachment,
    pub distance: f32,
    /// Child shape index for compound bodies, surfaced by raycasts and
    /// events.
    pub feature: Option<u32>,
}

/// Up to [`MAX_CONTACTS`] candidate points from one narrowphase invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollisionResult {
    points: [Option<CollidePoint>; MAX_CONTACTS],
    num: usize,
}

impl CollisionResult {
    pub fn push(&mut self, point: CollidePoint) {
        if self.num < MAX_CONTACTS {
            self.points[self.num] = Some(point);
            self.num += 1;
        } else {
            // Keep the deepest four candidates.
            let mut shallowest = 0;
            for i in 1..MAX_CONTACTS {
                if self.points[i].unwrap().distance > self.points[shallowest].unwrap().distance {
                    shallowest = i;
                }
            }
            if point.distance < self.points[shallowest].unwrap().distance {
                self.points[shallowest] = Some(point);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollidePoint> {
        self.points[..self.num].iter().filter_map(|p| p.as_ref())
    }

    pub fn get(&self, index: usize) -> &CollidePoint {
        self.points[index].as_ref().unwrap()
    }

    /// Swaps the A/B roles of every point, used by the symmetric dispatch
    /// entries that forward to the canonical pair.
    pub fn swapped(mut self) -> Self {
        for slot in self.points.iter_mut().flatten() {
            std::mem::swap(&mut slot.pivot_a, &mut slot.pivot_b);
            slot.normal = -slot.normal;
            slot.local_normal = -slot.local_normal;
            slot.normal_attachment = match slot.normal_attachment {
                NormalAttachment::BodyA => NormalAttachment::BodyB,
                NormalAttachment::BodyB => NormalAttachment::BodyA,
                NormalAttachment::None => NormalAttachment::None,
            };
        }
        self
    }
}

/// A persistent contact point. Accumulated impulses survive across steps to
/// warm start the solver.
#[derive(Debug, Clone, Copy)]
pub struct ContactPoint {
    pub pivot_a: Vec3,
    pub pivot_b: Vec3,
    pub normal: Vec3,
    pub local_normal: Vec3,
    pub normal_attachment: NormalAttachment,
    pub distance: f32,
    /// Steps since this point was created.
    pub lifetime: u32,
    pub material: ContactMaterial,
    pub feature: Option<u32>,
    pub normal_impulse: f32,
    pub friction_impulse: [f32; 2],
    pub rolling_impulse: [f32; 2],
    pub spinning_impulse: f32,
}

impl ContactPoint {
    fn from_candidate(candidate: &CollidePoint, material: ContactMaterial) -> Self {
        Self {
            pivot_a: candidate.pivot_a,
            pivot_b: candidate.pivot_b,
            normal: candidate.normal,
            local_normal: candidate.local_normal,
            normal_attachment: candidate.normal_attachment,
            distance: candidate.distance,
            lifetime: 0,
            material,
            feature: candidate.feature,
            normal_impulse: 0.0,
            friction_impulse: [0.0; 2],
            rolling_impulse: [0.0; 2],
            spinning_impulse: 0.0,
        }
    }

    /// Overwrites the geometry from a matching candidate, keeping the
    /// accumulated impulses for warm starting.
    fn merge(&mut self, candidate: &CollidePoint) {
        self.pivot_a = candidate.pivot_a;
        self.pivot_b = candidate.pivot_b;
        self.normal = candidate.normal;
        self.local_normal = candidate.local_normal;
        self.normal_attachment = candidate.normal_attachment;
        self.distance = candidate.distance;
        self.feature = candidate.feature;
    }
}

/// Net change applied by one manifold update.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifoldDelta {
    pub created: usize,
    pub destroyed: usize,
}

/// Persistent contact set between two bodies. Holds at most four points;
/// the set is maintained by narrowphase every step.
#[derive(Debug, Clone)]
pub struct ContactManifold {
    pub body_a: EntityId,
    pub body_b: EntityId,
    /// The manifold is destroyed once every point separates beyond this.
    pub separation_threshold: f32,
    points: [Option<ContactPoint>; MAX_CONTACTS],
    pub(crate) edge: EdgeIndex,
}

impl ContactManifold {
    pub fn new(body_a: EntityId, body_b: EntityId, separation_threshold: f32) -> Self {
        Self {
            body_a,
            body_b,
            separation_threshold,
            points: [None; MAX_CONTACTS],
            edge: u32::MAX,
        }
    }

    pub fn num_points(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }

    pub fn points(&self) -> impl Iterator<Item = &ContactPoint> {
        self.points.iter().filter_map(|p| p.as_ref())
    }

    pub fn points_mut(&mut self) -> impl Iterator<Item = &mut ContactPoint> {
        self.points.iter_mut().filter_map(|p| p.as_mut())
    }

    /// Points paired with their stable slot index.
    pub fn point_slots(&self) -> impl Iterator<Item = (usize, &ContactPoint)> {
        self.points
            .iter()
            .enumerate()
            .filter_map(|(slot, p)| p.as_ref().map(|p| (slot, p)))
    }

    pub fn point_at_mut(&mut self, slot: usize) -> Option<&mut ContactPoint> {
        self.points[slot].as_mut()
    }

    /// Adopts another manifold's point set, including accumulated impulses.
    /// Used when merging worker results back into the shared store.
    pub fn copy_points_from(&mut self, other: &ContactManifold) {
        self.points = other.points;
    }

    /// Deepest penetration across points, positive when separated.
    pub fn min_distance(&self) -> f32 {
        self.points()
            .map(|p| p.distance)
            .fold(f32::INFINITY, f32::min)
    }

    /// Recomputes each point's separation by transforming the stored pivots
    /// to world space and projecting onto the normal. Attached normals are
    /// re-rotated first.
    pub fn update_distances(&mut self, transform_a: &Transform, transform_b: &Transform) {
        for point in self.points_mut() {
            point.normal = match point.normal_attachment {
                NormalAttachment::BodyA => transform_a.orientation * point.local_normal,
                NormalAttachment::BodyB => transform_b.orientation * point.local_normal,
                NormalAttachment::None => point.normal,
            };
            let pivot_a = transform_a.to_world(point.pivot_a);
            let pivot_b = transform_b.to_world(point.pivot_b);
            point.distance = point.normal.dot(pivot_a - pivot_b);
        }
    }

    /// Merges a fresh collision result into the persistent set: existing
    /// points absorb their nearest candidate, separated points retire, and
    /// remaining candidates are inserted, displacing the point whose removal
    /// leaves the deepest, largest-area subset when full.
    pub fn merge_result(
        &mut self,
        result: &CollisionResult,
        transform_a: &Transform,
        transform_b: &Transform,
        tire: bool,
        mix_material: impl Fn() -> ContactMaterial,
    ) -> ManifoldDelta {
        let mut delta = ManifoldDelta::default();
        let mut merged = [false; MAX_CONTACTS];

        for slot in 0..MAX_CONTACTS {
            let Some(point) = &mut self.points[slot] else {
                continue;
            };
            point.lifetime += 1;

            let nearest = if tire {
                find_nearest_tire(point, result, &merged)
            } else {
                find_nearest(point, result, &merged)
            };

            match nearest {
                Some(index) => {
                    point.merge(result.get(index));
                    merged[index] = true;
                }
                None => {
                    if should_retire(point, transform_a, transform_b) {
                        self.points[slot] = None;
                        delta.destroyed += 1;
                    }
                }
            }
        }

        for (index, candidate) in result.iter().enumerate() {
            if merged[index] {
                continue;
            }
            if let Some(free) = self.points.iter().position(|p| p.is_none()) {
                self.points[free] = Some(ContactPoint::from_candidate(candidate, mix_material()));
                delta.created += 1;
            } else {
                let replace = self.insertion_index(candidate);
                if replace < MAX_CONTACTS {
                    self.points[replace] =
                        Some(ContactPoint::from_candidate(candidate, mix_material()));
                    delta.created += 1;
                    delta.destroyed += 1;
                }
            }
        }

        delta
    }

    /// Which of the four resident points the candidate should displace, or
    /// [`MAX_CONTACTS`] when the candidate should be dropped instead. Five
    /// subsets compete: the four that trade one existing point for the
    /// candidate, and the untouched current set. The deepest point, the
    /// candidate included, is never displaced.
    fn insertion_index(&self, candidate: &CollidePoint) -> usize {
        debug_assert!(self.num_points() == MAX_CONTACTS);

        let mut deepest = MAX_CONTACTS;
        let mut min_dist = candidate.distance;
        for (i, point) in self.points.iter().enumerate() {
            let point = point.as_ref().unwrap();
            if point.distance < min_dist {
                min_dist = point.distance;
                deepest = i;
            }
        }

        let pivot = |i: usize| self.points[i].as_ref().unwrap().pivot_a;
        let p = [pivot(0), pivot(1), pivot(2), pivot(3)];
        let c = candidate.pivot_a;

        let mut areas = [0.0f32; MAX_CONTACTS + 1];
        if deepest != 0 {
            areas[0] = area_4_points(c, p[1], p[2], p[3]);
        }
        if deepest != 1 {
            areas[1] = area_4_points(c, p[0], p[2], p[3]);
        }
        if deepest != 2 {
            areas[2] = area_4_points(c, p[0], p[1], p[3]);
        }
        if deepest != 3 {
            areas[3] = area_4_points(c, p[0], p[1], p[2]);
        }
        if deepest != MAX_CONTACTS {
            // The candidate is not the deepest point, so keeping the
            // current four and rejecting it is also an option.
            areas[MAX_CONTACTS] = area_4_points(p[0], p[1], p[2], p[3]);
        }

        let mut largest_index = MAX_CONTACTS;
        let mut largest_area = 0.0f32;
        for (i, &area) in areas.iter().enumerate() {
            if area > largest_area {
                largest_area = area;
                largest_index = i;
            }
        }

        largest_index
    }

    pub(crate) fn edge_index(&self) -> EdgeIndex {
        self.edge
    }
}

/// Area proxy of the quadrilateral spanned by four points: the largest
/// squared cross product over the three ways of pairing them into
/// diagonals. Robust to any vertex ordering.
fn area_4_points(p0: Vec3, p1: Vec3, p2: Vec3, p3: Vec3) -> f32 {
    let a = [p0 - p1, p0 - p2, p0 - p3];
    let b = [p2 - p3, p1 - p3, p1 - p2];
    let t0 = a[0].cross(b[0]).length_squared();
    let t1 = a[1].cross(b[1]).length_squared();
    let t2 = a[2].cross(b[2]).length_squared();
    t0.max(t1).max(t2)
}

/// Nearest candidate to an existing point by either pivot, within the
/// caching threshold.
fn find_nearest(
    point: &ContactPoint,
    result: &CollisionResult,
    merged: &[bool; MAX_CONTACTS],
) -> Option<usize> {
    let mut shortest = CONTACT_CACHING_THRESHOLD * CONTACT_CACHING_THRESHOLD;
    let mut nearest = None;

    for (index, candidate) in result.iter().enumerate() {
        if merged[index] {
            continue;
        }
        let da = (candidate.pivot_a - point.pivot_a).length_squared();
        if da < shortest {
            shortest = da;
            nearest = Some(index);
        }
        let db = (candidate.pivot_b - point.pivot_b).length_squared();
        if db < shortest {
            shortest = db;
            nearest = Some(index);
        }
    }

    nearest
}

/// Tire variant: distance is measured in the plane orthogonal to the spin
/// axis (the body's local x), so candidates aligned along the axle always
/// merge with the point they wrap around the tire with.
fn find_nearest_tire(
    point: &ContactPoint,
    result: &CollisionResult,
    merged: &[bool; MAX_CONTACTS],
) -> Option<usize> {
    let mut shortest = CONTACT_CACHING_THRESHOLD * CONTACT_CACHING_THRESHOLD;
    let mut nearest = None;
    let in_plane = |v: Vec3| Vec2::new(v.y, v.z);

    for (index, candidate) in result.iter().enumerate() {
        if merged[index] {
            continue;
        }
        let dist = (in_plane(candidate.pivot_a) - in_plane(point.pivot_a)).length_squared();
        if dist < shortest {
            shortest = dist;
            nearest = Some(index);
        }
    }

    nearest
}

/// A point retires when its normal separation exceeds the breaking threshold
/// or its pivots drift apart tangentially beyond the same threshold.
fn should_retire(point: &ContactPoint, transform_a: &Transform, transform_b: &Transform) -> bool {
    let pivot_a = transform_a.to_world(point.pivot_a);
    let pivot_b = transform_b.to_world(point.pivot_b);
    let separation = point.normal.dot(pivot_a - pivot_b);
    if separation > CONTACT_BREAKING_THRESHOLD {
        return true;
    }

    let drift = (pivot_a - pivot_b) - point.normal * separation;
    drift.length_squared() > CONTACT_BREAKING_THRESHOLD * CONTACT_BREAKING_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(pivot: Vec3, distance: f32) -> CollidePoint {
        CollidePoint {
            pivot_a: pivot,
            pivot_b: pivot,
            normal: Vec3::Y,
            local_normal: Vec3::Y,
            normal_attachment: NormalAttachment::None,
            distance,
            feature: None,
        }
    }

    fn manifold_with(points: &[CollidePoint]) -> ContactManifold {
        let mut manifold = ContactManifold::new(EntityId::new(0, 0), EntityId::new(1, 0), 0.1);
        let mut result = CollisionResult::default();
        for &p in points {
            result.push(p);
        }
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
    fn nearby_candidate_merges_and_keeps_impulse() {
        let mut manifold = manifold_with(&[candidate(Vec3::ZERO, -0.01)]);
        manifold.points_mut().next().unwrap().normal_impulse = 3.0;

        let mut result = CollisionResult::default();
        result.push(candidate(Vec3::new(0.005, 0.0, 0.0), -0.02));
        let delta = manifold.merge_result(
            &result,
            &Transform::default(),
            &Transform::default(),
            false,
            ContactMaterial::default,
        );

        assert_eq!(delta.created, 0);
        assert_eq!(manifold.num_points(), 1);
        let point = manifold.points().next().unwrap();
        assert_eq!(point.normal_impulse, 3.0);
        assert_eq!(point.lifetime, 1);
        assert!((point.distance + 0.02).abs() < 1e-6);
    }

    #[test]
    fn far_candidate_inserts_new_point() {
        let mut manifold = manifold_with(&[candidate(Vec3::ZERO, -0.01)]);
        let mut result = CollisionResult::default();
        result.push(candidate(Vec3::ZERO, -0.01));
        result.push(candidate(Vec3::new(0.5, 0.0, 0.0), -0.02));
        let delta = manifold.merge_result(
            &result,
            &Transform::default(),
            &Transform::default(),
            false,
            ContactMaterial::default,
        );
        assert_eq!(delta.created, 1);
        assert_eq!(manifold.num_points(), 2);
    }

    #[test]
    fn full_manifold_keeps_deepest_point() {
        let mut manifold = manifold_with(&[
            candidate(Vec3::new(0.0, 0.0, 0.0), -0.5),
            candidate(Vec3::new(1.0, 0.0, 0.0), -0.01),
            candidate(Vec3::new(1.0, 0.0, 1.0), -0.01),
            candidate(Vec3::new(0.0, 0.0, 1.0), -0.01),
        ]);
        assert_eq!(manifold.num_points(), 4);

        let mut result = CollisionResult::default();
        result.push(candidate(Vec3::new(0.5, 0.0, 2.0), -0.02));
        manifold.merge_result(
            &result,
            &Transform::default(),
            &Transform::default(),
            false,
            ContactMaterial::default,
        );

        assert_eq!(manifold.num_points(), 4);
        // The deepest point survives the replacement.
        assert!(manifold.points().any(|p| (p.distance + 0.5).abs() < 1e-6));
    }

    #[test]
    fn worse_candidate_is_rejected_when_manifold_is_full() {
        // Four corners of a unit square; an interior candidate shrinks every
        // replacement subset, so the current set must win.
        let mut manifold = manifold_with(&[
            candidate(Vec3::new(0.0, 0.0, 0.0), -0.5),
            candidate(Vec3::new(1.0, 0.0, 0.0), -0.01),
            candidate(Vec3::new(1.0, 0.0, 1.0), -0.01),
            candidate(Vec3::new(0.0, 0.0, 1.0), -0.01),
        ]);
        for point in manifold.points_mut() {
            point.normal_impulse = 2.0;
        }

        let mut result = CollisionResult::default();
        result.push(candidate(Vec3::new(0.5, 0.0, 0.5), -0.02));
        let delta = manifold.merge_result(
            &result,
            &Transform::default(),
            &Transform::default(),
            false,
            ContactMaterial::default,
        );

        assert_eq!(delta.created, 0);
        assert_eq!(delta.destroyed, 0);
        assert_eq!(manifold.num_points(), 4);
        // The established points keep their warm-start impulses.
        assert!(manifold.points().all(|p| p.normal_impulse == 2.0));
    }

    #[test]
    fn separated_point_retires() {
        let mut manifold = manifold_with(&[candidate(Vec3::ZERO, -0.01)]);

        // Move body A away so the stored pivots separate along the normal.
        let lifted = Transform::from_position(Vec3::new(0.0, 0.1, 0.0));
        let delta = manifold.merge_result(
            &CollisionResult::default(),
            &lifted,
            &Transform::default(),
            false,
            ContactMaterial::default,
        );

        assert_eq!(delta.destroyed, 1);
        assert_eq!(manifold.num_points(), 0);
    }
}

//! Narrowphase: refreshes every live manifold's contact points from the
//! per-shape-pair closest-feature routines, retiring separated points and
//! mixing materials for new ones. Collision results are computed in
//! parallel; the merge back into the manifolds is serial.

use super::collide::collide;
use super::contact::CollisionResult;
use crate::core::registry::{ContactEvent, Registry};
use crate::core::types::ContactMaterial;
use crate::shapes::Shape;
use crate::utils::allocator::EntityId;
use rayon::prelude::*;

/// Outcome of one narrowphase pass.
#[derive(Debug, Default)]
pub struct NarrowphaseResult {
    /// Manifolds whose last point retired and whose bodies separated; the
    /// caller destroys these entities.
    pub destroyed: Vec<EntityId>,
}

/// Updates the given manifolds in place. Sleeping islands' manifolds are
/// expected to be excluded by the caller.
pub fn update_manifolds(registry: &mut Registry, manifold_ids: &[EntityId]) -> NarrowphaseResult {
    // Closest features per manifold, in parallel. Reads only.
    let computed: Vec<(EntityId, CollisionResult)> = manifold_ids
        .par_iter()
        .filter_map(|&id| {
            let manifold = registry.manifolds.get(id)?;
            let body_a = registry.bodies.get(manifold.body_a)?;
            let body_b = registry.bodies.get(manifold.body_b)?;
            // Candidates appear once within the breaking threshold; the
            // larger separation threshold only governs manifold death.
            let result = collide(
                &body_a.shape,
                &body_a.transform,
                &body_b.shape,
                &body_b.transform,
                crate::config::CONTACT_BREAKING_THRESHOLD,
            );
            Some((id, result))
        })
        .collect();

    let mut outcome = NarrowphaseResult::default();

    for (id, result) in computed {
        let Some(manifold) = registry.manifolds.get(id) else {
            continue;
        };
        let (body_a_id, body_b_id) = (manifold.body_a, manifold.body_b);
        let (Some(body_a), Some(body_b)) = (
            registry.bodies.get(body_a_id),
            registry.bodies.get(body_b_id),
        ) else {
            continue;
        };
        let transform_a = body_a.transform;
        let transform_b = body_b.transform;

        // Tires use the in-plane nearest-point metric: body A spinning
        // about its cylinder axis.
        let tire = body_a.spin.is_some() && matches!(body_a.shape, Shape::Cylinder { .. });

        let material = match (&body_a.material, &body_b.material) {
            (Some(a), Some(b)) => registry.material_table.mix(a, b),
            _ => ContactMaterial::default(),
        };

        let aabb_a = body_a.aabb;
        let aabb_b = body_b.aabb;

        let manifold = registry.manifolds.get_mut(id).unwrap();
        let num_before = manifold.num_points();

        manifold.update_distances(&transform_a, &transform_b);
        manifold.merge_result(&result, &transform_a, &transform_b, tire, || material);

        let num_after = manifold.num_points();
        if num_before == 0 && num_after > 0 {
            registry.events.push(ContactEvent::Started {
                manifold: id,
                body_a: body_a_id,
                body_b: body_b_id,
            });
        } else if num_before > 0 && num_after == 0 {
            registry.events.push(ContactEvent::Ended {
                manifold: id,
                body_a: body_a_id,
                body_b: body_b_id,
            });
        }

        // The manifold dies once every point has retired and the bodies'
        // bounds drifted past the separation threshold.
        if num_after == 0 {
            let separation_threshold = manifold.separation_threshold;
            let gap = aabb_gap(&aabb_a, &aabb_b);
            if gap > separation_threshold {
                outcome.destroyed.push(id);
            }
        }
    }

    outcome
}

/// Largest per-axis gap between two AABBs; negative when overlapping.
fn aabb_gap(a: &crate::shapes::Aabb, b: &crate::shapes::Aabb) -> f32 {
    let mut gap = f32::NEG_INFINITY;
    for axis in 0..3 {
        let g = (b.min[axis] - a.max[axis]).max(a.min[axis] - b.max[axis]);
        gap = gap.max(g);
    }
    gap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::Aabb;
    use glam::Vec3;

    #[test]
    fn gap_is_negative_for_overlap() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        assert!(aabb_gap(&a, &b) < 0.0);
    }

    #[test]
    fn gap_measures_axis_separation() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::new(1.5, 0.0, 0.0), Vec3::new(2.5, 1.0, 1.0));
        assert!((aabb_gap(&a, &b) - 0.5).abs() < 1e-6);
    }
}

//! Broadphase: two incrementally-updated AABB trees (one for dynamic
//! bodies, one for static and kinematic bodies) and the pair-discovery pass
//! that creates contact manifolds for new overlaps.

use crate::config::CONTACT_BREAKING_THRESHOLD;
use crate::core::registry::Registry;
use crate::shapes::{Aabb, Shape};
use crate::utils::allocator::EntityId;
use glam::Vec3;
use rayon::prelude::*;
use std::collections::HashMap;

const NULL_NODE: u32 = u32::MAX;

/// Fat margin applied to leaves so small movements don't force
/// re-insertion.
const FAT_MARGIN: f32 = 0.1;

#[derive(Debug, Clone)]
struct TreeNode {
    aabb: Aabb,
    parent: u32,
    left: u32,
    right: u32,
    height: i32,
    entity: EntityId,
}

impl TreeNode {
    fn is_leaf(&self) -> bool {
        self.left == NULL_NODE
    }
}

/// Self-balancing dynamic AABB tree with fat leaves, O(log n) insert,
/// remove and update.
pub struct AabbTree {
    nodes: Vec<TreeNode>,
    free: Vec<u32>,
    root: u32,
}

impl Default for AabbTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AabbTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NULL_NODE,
        }
    }

    fn alloc(&mut self, node: TreeNode) -> u32 {
        if let Some(index) = self.free.pop() {
            self.nodes[index as usize] = node;
            index
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    pub fn insert(&mut self, aabb: Aabb, entity: EntityId) -> u32 {
        let leaf = self.alloc(TreeNode {
            aabb: aabb.inflated(FAT_MARGIN),
            parent: NULL_NODE,
            left: NULL_NODE,
            right: NULL_NODE,
            height: 0,
            entity,
        });
        self.insert_leaf(leaf);
        leaf
    }

    pub fn remove(&mut self, proxy: u32) {
        self.remove_leaf(proxy);
        self.free.push(proxy);
    }

    /// Moves a proxy. Returns true when the tight AABB escaped the fat one
    /// and the leaf was re-inserted.
    pub fn update(&mut self, proxy: u32, aabb: Aabb) -> bool {
        if self.nodes[proxy as usize].aabb.contains(&aabb) {
            return false;
        }
        self.remove_leaf(proxy);
        self.nodes[proxy as usize].aabb = aabb.inflated(FAT_MARGIN);
        self.insert_leaf(proxy);
        true
    }

    pub fn query(&self, aabb: &Aabb, mut f: impl FnMut(EntityId)) {
        if self.root == NULL_NODE {
            return;
        }
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];
            if !node.aabb.overlaps(aabb) {
                continue;
            }
            if node.is_leaf() {
                f(node.entity);
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }

    pub fn query_segment(&self, p0: Vec3, p1: Vec3, mut f: impl FnMut(EntityId)) {
        if self.root == NULL_NODE {
            return;
        }
        let mut stack = vec![self.root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index as usize];
            if node.aabb.intersect_segment(p0, p1).is_none() {
                continue;
            }
            if node.is_leaf() {
                f(node.entity);
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }

    fn insert_leaf(&mut self, leaf: u32) {
        if self.root == NULL_NODE {
            self.root = leaf;
            self.nodes[leaf as usize].parent = NULL_NODE;
            return;
        }

        // Descend toward the sibling that grows the least surface area.
        let leaf_aabb = self.nodes[leaf as usize].aabb;
        let mut index = self.root;
        while !self.nodes[index as usize].is_leaf() {
            let node = &self.nodes[index as usize];
            let left = node.left;
            let right = node.right;

            let combined = node.aabb.union(&leaf_aabb);
            let cost_parent = 2.0 * combined.surface_area();
            let inherit = 2.0 * (combined.surface_area() - node.aabb.surface_area());

            let cost_child = |child: u32, nodes: &[TreeNode]| {
                let child_node = &nodes[child as usize];
                let merged = child_node.aabb.union(&leaf_aabb);
                let direct = if child_node.is_leaf() {
                    merged.surface_area()
                } else {
                    merged.surface_area() - child_node.aabb.surface_area()
                };
                direct + inherit
            };

            let cost_left = cost_child(left, &self.nodes);
            let cost_right = cost_child(right, &self.nodes);
            if cost_parent < cost_left && cost_parent < cost_right {
                break;
            }
            index = if cost_left < cost_right { left } else { right };
        }

        let sibling = index;
        let old_parent = self.nodes[sibling as usize].parent;
        let new_parent = self.alloc(TreeNode {
            aabb: leaf_aabb.union(&self.nodes[sibling as usize].aabb),
            parent: old_parent,
            left: sibling,
            right: leaf,
            height: self.nodes[sibling as usize].height + 1,
            entity: EntityId::default(),
        });

        self.nodes[sibling as usize].parent = new_parent;
        self.nodes[leaf as usize].parent = new_parent;

        if old_parent == NULL_NODE {
            self.root = new_parent;
        } else if self.nodes[old_parent as usize].left == sibling {
            self.nodes[old_parent as usize].left = new_parent;
        } else {
            self.nodes[old_parent as usize].right = new_parent;
        }

        self.refit_upwards(new_parent);
    }

    fn remove_leaf(&mut self, leaf: u32) {
        if leaf == self.root {
            self.root = NULL_NODE;
            return;
        }

        let parent = self.nodes[leaf as usize].parent;
        let grandparent = self.nodes[parent as usize].parent;
        let sibling = if self.nodes[parent as usize].left == leaf {
            self.nodes[parent as usize].right
        } else {
            self.nodes[parent as usize].left
        };

        if grandparent == NULL_NODE {
            self.root = sibling;
            self.nodes[sibling as usize].parent = NULL_NODE;
        } else {
            if self.nodes[grandparent as usize].left == parent {
                self.nodes[grandparent as usize].left = sibling;
            } else {
                self.nodes[grandparent as usize].right = sibling;
            }
            self.nodes[sibling as usize].parent = grandparent;
            self.refit_upwards(grandparent);
        }
        self.free.push(parent);
    }

    /// Walks to the root refreshing bounds and heights, rebalancing with
    /// AVL-style rotations.
    fn refit_upwards(&mut self, start: u32) {
        let mut index = start;
        while index != NULL_NODE {
            index = self.balance(index);

            let left = self.nodes[index as usize].left;
            let right = self.nodes[index as usize].right;
            self.nodes[index as usize].height = 1 + self.nodes[left as usize]
                .height
                .max(self.nodes[right as usize].height);
            self.nodes[index as usize].aabb = self.nodes[left as usize]
                .aabb
                .union(&self.nodes[right as usize].aabb);

            index = self.nodes[index as usize].parent;
        }
    }

    /// One rotation when the subtree is out of balance; returns the new
    /// subtree root.
    fn balance(&mut self, index: u32) -> u32 {
        let node = self.nodes[index as usize].clone();
        if node.is_leaf() || node.height < 2 {
            return index;
        }

        let left = node.left;
        let right = node.right;
        let balance = self.nodes[right as usize].height - self.nodes[left as usize].height;

        if balance > 1 {
            self.rotate(index, right)
        } else if balance < -1 {
            self.rotate(index, left)
        } else {
            index
        }
    }

    /// Promotes the taller child `up` over its parent `index`.
    fn rotate(&mut self, index: u32, up: u32) -> u32 {
        let up_left = self.nodes[up as usize].left;
        let up_right = self.nodes[up as usize].right;
        let parent = self.nodes[index as usize].parent;

        // Promote the taller grandchild under `up`, hand the other back.
        let (promoted, demoted) =
            if self.nodes[up_left as usize].height >= self.nodes[up_right as usize].height {
                (up_left, up_right)
            } else {
                (up_right, up_left)
            };

        self.nodes[up as usize].left = index;
        self.nodes[up as usize].right = promoted;
        self.nodes[up as usize].parent = parent;
        self.nodes[index as usize].parent = up;

        if self.nodes[index as usize].left == up {
            self.nodes[index as usize].left = demoted;
        } else {
            self.nodes[index as usize].right = demoted;
        }
        self.nodes[demoted as usize].parent = index;

        if parent == NULL_NODE {
            self.root = up;
        } else if self.nodes[parent as usize].left == index {
            self.nodes[parent as usize].left = up;
        } else {
            self.nodes[parent as usize].right = up;
        }

        let fix = |nodes: &mut Vec<TreeNode>, i: u32| {
            let l = nodes[i as usize].left;
            let r = nodes[i as usize].right;
            nodes[i as usize].height = 1 + nodes[l as usize].height.max(nodes[r as usize].height);
            nodes[i as usize].aabb = nodes[l as usize].aabb.union(&nodes[r as usize].aabb);
        };
        fix(&mut self.nodes, index);
        fix(&mut self.nodes, up);

        up
    }
}

/// Broadphase driver: keeps body proxies in the right tree, refits moved
/// leaves, and turns fresh AABB overlaps into manifold edges.
#[derive(Default)]
pub struct Broadphase {
    dynamic_tree: AabbTree,
    static_tree: AabbTree,
    /// Body → (proxy index, lives-in-dynamic-tree).
    proxies: HashMap<EntityId, (u32, bool)>,
}

impl Broadphase {
    pub fn new() -> Self {
        Self::default()
    }

    /// One broadphase pass over the registry. Contact events are not
    /// emitted here: a manifold only counts as a contact once narrowphase
    /// finds its first point.
    pub fn update(&mut self, registry: &mut Registry) {
        self.sync_proxies(registry);
        for (body_a, body_b) in self.discover_pairs(registry) {
            registry.create_manifold(body_a, body_b);
        }
    }

    /// Creates missing proxies, refits moved bounds, and drops proxies of
    /// destroyed bodies. The dynamic tree is refit every step; the static
    /// tree only when a static body actually changed.
    fn sync_proxies(&mut self, registry: &Registry) {
        let Self {
            proxies,
            dynamic_tree,
            static_tree,
        } = self;

        proxies.retain(|&entity, &mut (proxy, in_dynamic)| {
            if registry.bodies.contains(entity) {
                true
            } else {
                if in_dynamic {
                    dynamic_tree.remove(proxy);
                } else {
                    static_tree.remove(proxy);
                }
                false
            }
        });

        for (id, body) in registry.bodies.iter_with_ids() {
            match self.proxies.get(&id).copied() {
                Some((proxy, in_dynamic)) => {
                    let tree = if in_dynamic {
                        &mut self.dynamic_tree
                    } else {
                        &mut self.static_tree
                    };
                    tree.update(proxy, body.aabb);
                }
                None => {
                    let in_dynamic = body.is_dynamic();
                    let proxy = if in_dynamic {
                        self.dynamic_tree.insert(body.aabb, id)
                    } else {
                        self.static_tree.insert(body.aabb, id)
                    };
                    self.proxies.insert(id, (proxy, in_dynamic));
                }
            }
        }
    }

    /// Queries both trees with every dynamic leaf, inflated by the
    /// contact-breaking threshold, and returns unordered pairs that pass
    /// the filters and have no manifold yet.
    fn discover_pairs(&self, registry: &Registry) -> Vec<(EntityId, EntityId)> {
        let dynamic_bodies: Vec<EntityId> = registry
            .bodies
            .iter_with_ids()
            .filter(|(_, body)| body.is_dynamic())
            .map(|(id, _)| id)
            .collect();

        let mut pairs: Vec<(EntityId, EntityId)> = dynamic_bodies
            .par_iter()
            .flat_map_iter(|&body_id| {
                let mut found = Vec::new();
                let body = registry.bodies.get(body_id).unwrap();
                let query = body.aabb.inflated(CONTACT_BREAKING_THRESHOLD);

                let mut consider = |other_id: EntityId| {
                    if other_id == body_id {
                        return;
                    }
                    let Some(other) = registry.bodies.get(other_id) else {
                        return;
                    };
                    // Each unordered pair is reported by one side only; a
                    // dynamic-dynamic pair goes to the smaller handle.
                    if other.is_dynamic() && EntityId::ordered_pair(body_id, other_id).0 != body_id
                    {
                        return;
                    }
                    if !body.filter.test(&other.filter) {
                        return;
                    }
                    if !shapes_compatible(&body.shape, &other.shape) {
                        return;
                    }
                    if registry.is_collision_excluded(body_id, other_id) {
                        return;
                    }
                    if registry.manifold_exists(body_id, other_id) {
                        return;
                    }
                    found.push(EntityId::ordered_pair(body_id, other_id));
                };

                self.dynamic_tree.query(&query, &mut consider);
                self.static_tree.query(&query, &mut consider);
                found
            })
            .collect();

        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// Segment query against both trees.
    pub fn query_segment(&self, p0: Vec3, p1: Vec3, mut f: impl FnMut(EntityId)) {
        self.dynamic_tree.query_segment(p0, p1, &mut f);
        self.static_tree.query_segment(p0, p1, &mut f);
    }

    /// Volume query against both trees.
    pub fn query_aabb(&self, aabb: &Aabb, mut f: impl FnMut(EntityId)) {
        self.dynamic_tree.query(aabb, &mut f);
        self.static_tree.query(aabb, &mut f);
    }
}

/// Whether two shapes could ever collide; plane-plane and mesh-mesh pairs
/// have no routine and produce no manifolds.
pub fn shapes_compatible(a: &Shape, b: &Shape) -> bool {
    let concave = |s: &Shape| {
        matches!(
            s,
            Shape::Plane { .. } | Shape::Mesh { .. } | Shape::PagedMesh { .. }
        )
    };
    !(concave(a) && concave(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(index: u32) -> EntityId {
        EntityId::new(index, 0)
    }

    fn unit_aabb(center: Vec3) -> Aabb {
        Aabb::new(center - Vec3::splat(0.5), center + Vec3::splat(0.5))
    }

    #[test]
    fn query_finds_inserted_leaves() {
        let mut tree = AabbTree::new();
        for i in 0..32 {
            tree.insert(unit_aabb(Vec3::new(i as f32 * 3.0, 0.0, 0.0)), entity(i));
        }

        let mut hits = Vec::new();
        tree.query(&unit_aabb(Vec3::new(9.0, 0.0, 0.0)), |e| hits.push(e));
        assert_eq!(hits, vec![entity(3)]);
    }

    #[test]
    fn update_within_fat_bounds_is_cheap() {
        let mut tree = AabbTree::new();
        let proxy = tree.insert(unit_aabb(Vec3::ZERO), entity(0));
        assert!(!tree.update(proxy, unit_aabb(Vec3::splat(0.05))));
        assert!(tree.update(proxy, unit_aabb(Vec3::splat(5.0))));

        let mut hits = Vec::new();
        tree.query(&unit_aabb(Vec3::splat(5.0)), |e| hits.push(e));
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn removal_keeps_remaining_leaves_queryable() {
        let mut tree = AabbTree::new();
        let a = tree.insert(unit_aabb(Vec3::ZERO), entity(0));
        tree.insert(unit_aabb(Vec3::new(4.0, 0.0, 0.0)), entity(1));
        tree.remove(a);

        let mut hits = Vec::new();
        tree.query(&Aabb::new(Vec3::splat(-10.0), Vec3::splat(10.0)), |e| {
            hits.push(e)
        });
        assert_eq!(hits, vec![entity(1)]);
    }

    #[test]
    fn segment_query_walks_the_tree() {
        let mut tree = AabbTree::new();
        for i in 0..8 {
            tree.insert(unit_aabb(Vec3::new(i as f32 * 4.0, 0.0, 0.0)), entity(i));
        }
        let mut hits = Vec::new();
        tree.query_segment(
            Vec3::new(-2.0, 0.0, 0.0),
            Vec3::new(9.0, 0.0, 0.0),
            |e| hits.push(e),
        );
        hits.sort();
        assert_eq!(hits, vec![entity(0), entity(1), entity(2)]);
    }
}

use crate::collision::contact::ContactManifold;
use crate::config::{SimulationSettings, MANIFOLD_SEPARATION_THRESHOLD};
use crate::core::graph::{EdgeIndex, EdgeKind, EntityGraph, NodeIndex};
use crate::core::rigidbody::{BodyKind, RigidBody, RigidBodyDef};
use crate::core::types::MaterialMixTable;
use crate::dynamics::constraints::{Constraint, Joint};
use crate::dynamics::island::Island;
use crate::utils::allocator::{Arena, EntityId};
use std::collections::{HashMap, HashSet};

/// Contact lifecycle notifications surfaced once per coordinator tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactEvent {
    Started {
        manifold: EntityId,
        body_a: EntityId,
        body_b: EntityId,
    },
    Ended {
        manifold: EntityId,
        body_a: EntityId,
        body_b: EntityId,
    },
    /// A paged-mesh page finished loading.
    PageLoaded { body: EntityId, page: usize },
}

/// Per-entity write sequence numbers. Externally-applied component writes
/// bump the owning entity's sequence; the coordinator compares against the
/// last consumed value when building deltas for workers.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    sequences: Vec<u64>,
    counter: u64,
}

impl DirtyTracker {
    pub fn mark(&mut self, entity: EntityId) {
        let index = entity.index();
        if index >= self.sequences.len() {
            self.sequences.resize(index + 1, 0);
        }
        self.counter += 1;
        self.sequences[index] = self.counter;
    }

    pub fn sequence(&self, entity: EntityId) -> u64 {
        self.sequences.get(entity.index()).copied().unwrap_or(0)
    }

    /// Entities whose sequence is newer than `since`.
    pub fn newer_than(&self, since: u64) -> impl Iterator<Item = usize> + '_ {
        self.sequences
            .iter()
            .enumerate()
            .filter(move |(_, &seq)| seq > since)
            .map(|(index, _)| index)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// The authoritative entity store. Bodies, manifolds, constraints and
/// islands each live in a generational arena; the entity graph ties bodies
/// (nodes) to manifolds and constraints (edges). Only the coordinator
/// thread writes here; workers operate on private copies.
#[derive(Default)]
pub struct Registry {
    pub(crate) bodies: Arena<RigidBody>,
    pub(crate) manifolds: Arena<ContactManifold>,
    pub(crate) constraints: Arena<Constraint>,
    pub(crate) islands: Arena<Island>,
    pub(crate) graph: EntityGraph,
    pub(crate) manifold_map: HashMap<(EntityId, EntityId), EntityId>,
    pub(crate) excluded: HashSet<(EntityId, EntityId)>,
    pub material_table: MaterialMixTable,
    pub(crate) settings: SimulationSettings,
    pub(crate) events: Vec<ContactEvent>,
    pub(crate) dirty: DirtyTracker,
    /// Graph changes accumulated since the last island-manager pass.
    pub(crate) new_nodes: Vec<NodeIndex>,
    pub(crate) new_edges: Vec<EdgeIndex>,
    pub(crate) split_candidates: Vec<EntityId>,
    pub(crate) broadphase: crate::collision::broadphase::Broadphase,
    pub(crate) runtime: Option<crate::parallel::Runtime>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    pub fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    pub fn num_manifolds(&self) -> usize {
        self.manifolds.len()
    }

    pub fn num_islands(&self) -> usize {
        self.islands.len()
    }

    pub fn body(&self, id: EntityId) -> Option<&RigidBody> {
        self.bodies.get(id)
    }

    /// Mutable body access for external writers. Marks the entity dirty so
    /// the change propagates to its island worker and wakes its island.
    pub fn body_mut(&mut self, id: EntityId) -> Option<&mut RigidBody> {
        if self.bodies.contains(id) {
            self.dirty.mark(id);
            if let Some(island) = self.bodies.get(id).and_then(|b| b.island) {
                if let Some(island) = self.islands.get_mut(island) {
                    island.pending_wake = true;
                }
            }
        }
        self.bodies.get_mut(id)
    }

    pub fn bodies(&self) -> impl Iterator<Item = &RigidBody> {
        self.bodies.iter()
    }

    pub fn manifold(&self, id: EntityId) -> Option<&ContactManifold> {
        self.manifolds.get(id)
    }

    pub fn constraint(&self, id: EntityId) -> Option<&Constraint> {
        self.constraints.get(id)
    }

    pub fn island(&self, id: EntityId) -> Option<&Island> {
        self.islands.get(id)
    }

    pub fn islands(&self) -> impl Iterator<Item = (EntityId, &Island)> {
        self.islands.iter_with_ids()
    }

    pub(crate) fn create_body(&mut self, def: RigidBodyDef) -> EntityId {
        let connecting = def.kind == BodyKind::Dynamic;
        let id = self.bodies.insert(def.build());
        let node = self.graph.insert_node(id, connecting);
        let body = self.bodies.get_mut(id).unwrap();
        body.id = id;
        body.node = node;
        self.new_nodes.push(node);
        id
    }

    /// Destroys a body, cascading to every incident manifold and constraint
    /// edge.
    pub fn destroy_body(&mut self, id: EntityId) {
        let Some(body) = self.bodies.get(id) else {
            return;
        };
        let node = body.node;
        let island = body.island;
        let multi = body.multi_islands.clone();

        for (edge_entity, kind) in self.graph.remove_node(node) {
            match kind {
                EdgeKind::Manifold => self.drop_manifold_entity(edge_entity),
                EdgeKind::Constraint => {
                    self.constraints.remove(edge_entity);
                }
            }
        }

        // The islands this body belonged to must re-evaluate connectivity.
        if let Some(island) = island {
            self.split_candidates.push(island);
        }
        self.split_candidates.extend(multi);

        self.bodies.remove(id);
    }

    /// Inserts an already-built body, resetting links that only make sense
    /// in the store it came from. Used when seeding worker registries.
    pub(crate) fn insert_body_raw(&mut self, mut body: RigidBody) -> EntityId {
        body.island = None;
        body.multi_islands.clear();
        let connecting = body.is_dynamic();
        let id = self.bodies.insert(body);
        let node = self.graph.insert_node(id, connecting);
        let body = self.bodies.get_mut(id).unwrap();
        body.id = id;
        body.node = node;
        self.new_nodes.push(node);
        id
    }

    /// Re-creates a manifold with its persistent points, re-keyed to local
    /// body handles.
    pub(crate) fn insert_manifold_raw(
        &mut self,
        body_a: EntityId,
        body_b: EntityId,
        state: &ContactManifold,
    ) -> EntityId {
        let id = self.create_manifold(body_a, body_b);
        let manifold = self.manifolds.get_mut(id).unwrap();
        manifold.copy_points_from(state);
        manifold.separation_threshold = state.separation_threshold;
        id
    }

    pub(crate) fn create_manifold(&mut self, body_a: EntityId, body_b: EntityId) -> EntityId {
        debug_assert!(!self.manifold_exists(body_a, body_b));
        let id = self
            .manifolds
            .insert(ContactManifold::new(body_a, body_b, MANIFOLD_SEPARATION_THRESHOLD));

        let node_a = self.bodies.get(body_a).unwrap().node;
        let node_b = self.bodies.get(body_b).unwrap().node;
        let edge = self.graph.insert_edge(id, EdgeKind::Manifold, node_a, node_b);
        self.manifolds.get_mut(id).unwrap().edge = edge;

        self.manifold_map
            .insert(EntityId::ordered_pair(body_a, body_b), id);
        self.new_edges.push(edge);
        id
    }

    /// Removes a manifold entity and its graph edge, flagging the island it
    /// lived in for a split check.
    pub(crate) fn destroy_manifold(&mut self, id: EntityId) {
        let Some(manifold) = self.manifolds.get(id) else {
            return;
        };
        let edge = manifold.edge_index();
        let (body_a, body_b) = (manifold.body_a, manifold.body_b);
        self.graph.remove_edge(edge);
        self.manifold_map
            .remove(&EntityId::ordered_pair(body_a, body_b));
        if let Some(island) = self.bodies.get(body_a).and_then(|b| b.island) {
            self.split_candidates.push(island);
        } else if let Some(island) = self.bodies.get(body_b).and_then(|b| b.island) {
            self.split_candidates.push(island);
        }
        self.manifolds.remove(id);
    }

    /// Arena/map cleanup for a manifold whose graph edge is already gone.
    fn drop_manifold_entity(&mut self, id: EntityId) {
        if let Some(manifold) = self.manifolds.remove(id) {
            self.manifold_map
                .remove(&EntityId::ordered_pair(manifold.body_a, manifold.body_b));
        }
    }

    pub(crate) fn create_constraint(
        &mut self,
        body_a: EntityId,
        body_b: EntityId,
        joint: Joint,
    ) -> EntityId {
        debug_assert!(
            self.bodies.contains(body_a) && self.bodies.contains(body_b),
            "constraints must reference existing bodies"
        );

        let id = self.constraints.insert(Constraint {
            id: EntityId::default(),
            body_a,
            body_b,
            joint,
            edge: u32::MAX,
        });

        let node_a = self.bodies.get(body_a).unwrap().node;
        let node_b = self.bodies.get(body_b).unwrap().node;
        let edge = self
            .graph
            .insert_edge(id, EdgeKind::Constraint, node_a, node_b);
        let constraint = self.constraints.get_mut(id).unwrap();
        constraint.id = id;
        constraint.edge = edge;
        self.new_edges.push(edge);
        id
    }

    pub fn destroy_constraint(&mut self, id: EntityId) {
        let Some(constraint) = self.constraints.get(id) else {
            return;
        };
        let edge = constraint.edge;
        let body_a = constraint.body_a;
        self.graph.remove_edge(edge);
        if let Some(island) = self.bodies.get(body_a).and_then(|b| b.island) {
            self.split_candidates.push(island);
        }
        self.constraints.remove(id);
    }

    pub fn manifold_exists(&self, a: EntityId, b: EntityId) -> bool {
        self.manifold_map.contains_key(&EntityId::ordered_pair(a, b))
    }

    pub fn get_manifold_entity(&self, a: EntityId, b: EntityId) -> Option<EntityId> {
        self.manifold_map.get(&EntityId::ordered_pair(a, b)).copied()
    }

    /// Prevents the pair from ever colliding, destroying any live manifold.
    pub fn exclude_collision(&mut self, a: EntityId, b: EntityId) {
        self.excluded.insert(EntityId::ordered_pair(a, b));
        if let Some(manifold) = self.get_manifold_entity(a, b) {
            self.destroy_manifold(manifold);
        }
    }

    pub fn is_collision_excluded(&self, a: EntityId, b: EntityId) -> bool {
        self.excluded.contains(&EntityId::ordered_pair(a, b))
    }

    /// Visits every manifold and constraint edge incident to a body.
    pub fn visit_edges(&self, body: EntityId, mut f: impl FnMut(EntityId, EdgeKind)) {
        let Some(body) = self.bodies.get(body) else {
            return;
        };
        self.graph.visit_edges(body.node, |edge| {
            let (entity, kind) = self.graph.edge_entity(edge);
            f(entity, kind);
        });
    }

    pub fn drain_events(&mut self) -> Vec<ContactEvent> {
        std::mem::take(&mut self.events)
    }
}

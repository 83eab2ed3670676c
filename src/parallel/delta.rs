//! Batched state transfer between the coordinator's authoritative store
//! and a worker's private store. All entity ids inside a delta are
//! coordinator ids; each worker owns the translation table to its local
//! handles. Creations are ordered bodies-first so edges always find their
//! endpoints.

use crate::collision::contact::ContactManifold;
use crate::config::SimulationSettings;
use crate::core::rigidbody::RigidBody;
use crate::core::types::{Spin, Transform, Velocity};
use crate::dynamics::constraints::Joint;
use crate::utils::allocator::EntityId;
use std::collections::HashMap;

/// Remote (coordinator) ↔ local handle translation.
#[derive(Debug, Default)]
pub struct EntityMap {
    to_local: HashMap<EntityId, EntityId>,
    to_remote: HashMap<EntityId, EntityId>,
}

impl EntityMap {
    pub fn insert(&mut self, remote: EntityId, local: EntityId) {
        self.to_local.insert(remote, local);
        self.to_remote.insert(local, remote);
    }

    pub fn local(&self, remote: EntityId) -> Option<EntityId> {
        self.to_local.get(&remote).copied()
    }

    pub fn remote(&self, local: EntityId) -> Option<EntityId> {
        self.to_remote.get(&local).copied()
    }

    pub fn remove_remote(&mut self, remote: EntityId) -> Option<EntityId> {
        let local = self.to_local.remove(&remote)?;
        self.to_remote.remove(&local);
        Some(local)
    }

    pub fn locals(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.to_remote.keys().copied()
    }
}

/// Kinematic snapshot of one body.
#[derive(Debug, Clone, Copy)]
pub struct BodyState {
    pub entity: EntityId,
    pub transform: Transform,
    pub velocity: Velocity,
    pub spin: Option<Spin>,
}

/// A constraint to recreate on the other side.
#[derive(Debug, Clone)]
pub struct ConstraintSeed {
    pub body_a: EntityId,
    pub body_b: EntityId,
    pub joint: Joint,
}

/// One batch of changes shipped across the coordinator↔worker channel.
#[derive(Default)]
pub struct RegistryDelta {
    pub created_bodies: Vec<(EntityId, RigidBody)>,
    pub created_manifolds: Vec<(EntityId, ContactManifold)>,
    pub created_constraints: Vec<(EntityId, ConstraintSeed)>,
    pub updated_bodies: Vec<BodyState>,
    pub updated_manifolds: Vec<(EntityId, ContactManifold)>,
    pub updated_joints: Vec<(EntityId, Joint)>,
    pub destroyed_manifolds: Vec<EntityId>,
    pub destroyed_constraints: Vec<EntityId>,
    pub destroyed_bodies: Vec<EntityId>,
    pub settings: Option<SimulationSettings>,
}

impl RegistryDelta {
    pub fn is_empty(&self) -> bool {
        self.created_bodies.is_empty()
            && self.created_manifolds.is_empty()
            && self.created_constraints.is_empty()
            && self.updated_bodies.is_empty()
            && self.updated_manifolds.is_empty()
            && self.updated_joints.is_empty()
            && self.destroyed_manifolds.is_empty()
            && self.destroyed_constraints.is_empty()
            && self.destroyed_bodies.is_empty()
            && self.settings.is_none()
    }
}

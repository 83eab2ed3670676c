//! # Archipelago
//!
//! Real-time rigid body simulation built around an entity-component store
//! and an entity-relation graph. The world is partitioned into *islands*
//! (connected components of bodies joined by contacts and joints); each
//! island is stepped independently by a background worker at a fixed rate,
//! and the coordinator merges results back into the shared registry.
//!
//! ## Quick start
//!
//! ```no_run
//! use archipelago as phys;
//! use glam::Vec3;
//!
//! let mut registry = phys::Registry::new();
//! phys::attach(&mut registry, phys::SimulationConfig::default());
//!
//! phys::make_rigidbody(
//!     &mut registry,
//!     phys::RigidBodyDef::new()
//!         .position(Vec3::new(0.0, 10.0, 0.0))
//!         .shape(phys::Shape::Sphere { radius: 0.5 }),
//! );
//!
//! loop {
//!     phys::update_now(&mut registry);
//! }
//! ```

pub mod collision;
pub mod config;
pub mod core;
pub mod dynamics;
pub mod parallel;
pub mod shapes;
pub mod utils;

pub use crate::collision::contact::{ContactManifold, ContactPoint};
pub use crate::collision::raycast::RaycastHit;
pub use crate::config::{SimulationConfig, SimulationSettings};
pub use crate::core::graph::EdgeKind;
pub use crate::core::registry::{ContactEvent, Registry};
pub use crate::core::rigidbody::{BodyKind, CollisionFilter, RigidBody, RigidBodyDef};
pub use crate::core::types::{Material, Spin, Transform, Velocity};
pub use crate::dynamics::constraints::Joint;
pub use crate::parallel::TimeSource;
pub use crate::shapes::{Aabb, CompoundChild, ConvexMesh, PagedTriangleMesh, Shape, TriangleMesh};
pub use crate::utils::allocator::EntityId;

pub use glam::{Mat3, Quat, Vec3};

use crate::parallel::Runtime;
use std::sync::Arc;

/// Initializes the engine on a registry: worker pool, coordinator, and
/// simulation settings. Must be called before any other entry point.
pub fn attach(registry: &mut Registry, config: SimulationConfig) {
    debug_assert!(registry.runtime.is_none(), "attach called twice");
    registry.settings = config.settings;
    registry.runtime = Some(Runtime::new(&config));
}

/// Tears the engine down, removing every engine-added component: workers,
/// manifolds, islands, and graph residency links. Application-created
/// bodies and constraints survive.
pub fn detach(registry: &mut Registry) {
    if let Some(mut runtime) = registry.runtime.take() {
        runtime.shutdown();
    }

    let manifold_ids: Vec<EntityId> = registry.manifolds.ids().collect();
    for id in manifold_ids {
        registry.destroy_manifold(id);
    }
    registry.islands.clear();
    for body in registry.bodies.iter_mut() {
        body.island = None;
        body.multi_islands.clear();
    }
    registry.events.clear();
    registry.new_nodes.clear();
    registry.new_edges.clear();
    registry.split_candidates.clear();
}

/// Drives one coordinator tick at the given application time (seconds):
/// merges worker results, discovers new overlaps, re-partitions islands,
/// and dispatches work. The actual stepping happens on the worker pool.
pub fn update(registry: &mut Registry, time: f64) {
    let mut runtime = registry
        .runtime
        .take()
        .expect("update requires an attached registry");
    runtime.sim_time = time;
    let dispatcher = Arc::clone(&runtime.dispatcher);
    runtime.coordinator.tick(registry, &dispatcher, time);
    registry.runtime = Some(runtime);
}

/// Ticks the coordinator using the attached time source's clock.
pub fn update_now(registry: &mut Registry) {
    let now = registry
        .runtime
        .as_ref()
        .expect("update requires an attached registry")
        .time_source
        .now();
    update(registry, now);
}

/// Advances exactly one fixed step synchronously. Intended for paused
/// simulations and deterministic tests.
pub fn step_simulation(registry: &mut Registry) {
    let mut runtime = registry
        .runtime
        .take()
        .expect("step_simulation requires an attached registry");
    runtime.sim_time += registry.settings.fixed_dt as f64;
    let now = runtime.sim_time;
    runtime.coordinator.step_once(registry, now);
    registry.runtime = Some(runtime);
}

fn update_settings(registry: &mut Registry, mutate: impl FnOnce(&mut SimulationSettings)) {
    mutate(&mut registry.settings);
    if let Some(runtime) = registry.runtime.take() {
        runtime
            .coordinator
            .broadcast_settings(registry, &runtime.dispatcher);
        registry.runtime = Some(runtime);
    }
}

/// Pauses or resumes the background workers. While paused,
/// [`step_simulation`] advances the world.
pub fn set_paused(registry: &mut Registry, paused: bool) {
    update_settings(registry, |s| s.paused = paused);
}

pub fn set_fixed_dt(registry: &mut Registry, dt: f32) {
    debug_assert!(dt > 0.0);
    update_settings(registry, |s| s.fixed_dt = dt);
}

pub fn set_gravity(registry: &mut Registry, gravity: Vec3) {
    update_settings(registry, |s| s.gravity = gravity);
}

pub fn set_solver_velocity_iterations(registry: &mut Registry, iterations: u32) {
    update_settings(registry, |s| s.velocity_iterations = iterations.max(1));
}

pub fn set_solver_position_iterations(registry: &mut Registry, iterations: u32) {
    update_settings(registry, |s| s.position_iterations = iterations);
}

pub fn set_solver_restitution_iterations(registry: &mut Registry, iterations: u32) {
    update_settings(registry, |s| s.restitution_iterations = iterations);
}

/// Replaces the clock driving the fixed-step schedule.
pub fn set_time_source(registry: &mut Registry, source: Arc<dyn TimeSource>) {
    if let Some(runtime) = &mut registry.runtime {
        runtime.set_time_source(source);
    }
}

/// Creates a rigid body from its definition and inserts it into the entity
/// graph. The body is picked up by island management on the next tick.
pub fn make_rigidbody(registry: &mut Registry, def: RigidBodyDef) -> EntityId {
    registry.create_body(def)
}

/// Destroys a body, cascading to all incident manifolds and constraints.
pub fn destroy_rigidbody(registry: &mut Registry, body: EntityId) {
    registry.destroy_body(body);
}

/// Adds a joint between two existing bodies; it becomes an edge in the
/// entity graph and its islands merge on the next tick.
pub fn make_constraint(
    registry: &mut Registry,
    body_a: EntityId,
    body_b: EntityId,
    joint: Joint,
) -> EntityId {
    registry.create_constraint(body_a, body_b, joint)
}

pub fn destroy_constraint(registry: &mut Registry, constraint: EntityId) {
    registry.destroy_constraint(constraint);
}

/// Segment query against the broadphase trees, then exact shapes.
pub fn raycast(registry: &Registry, p0: Vec3, p1: Vec3) -> Option<RaycastHit> {
    collision::raycast::raycast(registry, p0, p1)
}

/// Volume query returning every body whose broadphase AABB overlaps.
pub fn query_aabb(registry: &Registry, aabb: &Aabb) -> Vec<EntityId> {
    let mut out = Vec::new();
    registry.broadphase.query_aabb(aabb, |entity| out.push(entity));
    out
}

/// Visits every manifold and constraint edge incident to a body.
pub fn visit_edges(registry: &Registry, body: EntityId, f: impl FnMut(EntityId, EdgeKind)) {
    registry.visit_edges(body, f);
}

pub fn manifold_exists(registry: &Registry, a: EntityId, b: EntityId) -> bool {
    registry.manifold_exists(a, b)
}

pub fn get_manifold_entity(registry: &Registry, a: EntityId, b: EntityId) -> Option<EntityId> {
    registry.get_manifold_entity(a, b)
}

/// Prevents a pair of bodies from ever colliding.
pub fn exclude_collision(registry: &mut Registry, a: EntityId, b: EntityId) {
    registry.exclude_collision(a, b);
}

/// Registers a per-pair material override, keyed on the unordered pair of
/// material ids. Overrides win over default product mixing.
pub fn insert_material_mixing(registry: &mut Registry, id0: u32, id1: u32, material: Material) {
    registry.material_table.insert(id0, id1, material);
}

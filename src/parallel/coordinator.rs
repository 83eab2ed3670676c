//! The coordinator: owns the authoritative registry, runs broadphase and
//! island management, and routes each island to a background worker,
//! merging result deltas back into the shared store. Also provides the
//! sequential single-step path used while paused.

use crate::collision::narrowphase;
use crate::core::registry::{ContactEvent, Registry};
use crate::dynamics::island;
use crate::dynamics::solver::step_island;
use crate::parallel::delta::{BodyState, ConstraintSeed, RegistryDelta};
use crate::parallel::job::{JobDispatcher, JobId};
use crate::parallel::message::{duplex, DuplexChannel};
use crate::parallel::worker::{IslandWorker, ToCoordinator, ToWorker};
use crate::shapes::Shape;
use crate::utils::allocator::EntityId;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

struct WorkerHandle {
    channel: DuplexChannel<ToWorker, ToCoordinator>,
    job_id: JobId,
    seeded_nodes: usize,
    seeded_edges: usize,
}

/// Foreground side of the simulation. One instance lives in the attached
/// registry's runtime.
#[derive(Default)]
pub struct Coordinator {
    workers: HashMap<EntityId, WorkerHandle>,
    dirty_consumed: u64,
    /// Sequential stepping ran; every worker snapshot is invalid.
    stale_workers: bool,
    /// Fixed-step accumulator for kinematic bodies that belong to no
    /// island and are therefore driven by the coordinator itself.
    last_tick: Option<f64>,
    kinematic_accum: f64,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// One coordinator tick: merge worker results, discover new overlaps,
    /// re-partition, reconcile workers, forward external writes.
    pub fn tick(&mut self, registry: &mut Registry, dispatcher: &Arc<JobDispatcher>, now: f64) {
        self.drain_worker_messages(registry);
        poll_paged_meshes(registry);
        self.advance_lone_kinematics(registry, now);

        let mut broadphase = std::mem::take(&mut registry.broadphase);
        broadphase.update(registry);
        registry.broadphase = broadphase;

        island::process_graph_changes(registry);

        if self.stale_workers {
            self.terminate_all_workers();
            self.stale_workers = false;
        }
        self.reconcile_workers(registry, dispatcher);
        self.forward_external_writes(registry, dispatcher);
        self.wake_pending(registry, dispatcher, now);
    }

    /// Advances exactly one fixed step on the calling thread, bypassing
    /// workers. Used while paused; worker snapshots are re-seeded on the
    /// next tick.
    pub fn step_once(&mut self, registry: &mut Registry, now: f64) {
        let _timer = crate::utils::logging::ScopedTimer::new("sequential step");
        poll_paged_meshes(registry);

        let mut broadphase = std::mem::take(&mut registry.broadphase);
        broadphase.update(registry);
        registry.broadphase = broadphase;

        // Narrowphase over every manifold not resting in a sleeping island.
        let live_manifolds: Vec<EntityId> = registry
            .manifolds
            .iter_with_ids()
            .filter(|(_, manifold)| {
                let island = registry
                    .bodies
                    .get(manifold.body_a)
                    .and_then(|b| b.island)
                    .or_else(|| registry.bodies.get(manifold.body_b).and_then(|b| b.island));
                match island.and_then(|id| registry.islands.get(id)) {
                    Some(island) => !island.sleeping || island.pending_wake,
                    None => true,
                }
            })
            .map(|(id, _)| id)
            .collect();

        let narrow = narrowphase::update_manifolds(registry, &live_manifolds);
        for id in narrow.destroyed {
            registry.destroy_manifold(id);
        }

        island::process_graph_changes(registry);

        crate::dynamics::solver::integrate_kinematic_bodies(registry, registry.settings.fixed_dt);

        let islands: Vec<EntityId> = registry.islands.ids().collect();
        for island_id in islands {
            let (sleeping, pending_wake) = {
                let island = registry.islands.get(island_id).unwrap();
                (island.sleeping, island.pending_wake)
            };
            if pending_wake {
                island::wake_island(registry, island_id);
            } else if sleeping {
                continue;
            }

            let members = registry.islands.get(island_id).unwrap().members(registry);
            step_island(registry, &members);
            island::update_island_sleep(registry, island_id, now);
        }

        self.stale_workers = true;
    }

    /// Kinematic bodies inside islands advance on their workers; the ones
    /// touching no island are stepped here at the fixed rate.
    fn advance_lone_kinematics(&mut self, registry: &mut Registry, now: f64) {
        if registry.settings.paused {
            self.last_tick = Some(now);
            return;
        }
        let last = self.last_tick.replace(now).unwrap_or(now);
        self.kinematic_accum += (now - last).max(0.0);

        let dt = registry.settings.fixed_dt as f64;
        let mut steps = (self.kinematic_accum / dt) as u32;
        self.kinematic_accum -= steps as f64 * dt;
        if steps > crate::config::MAX_STEP_LAG {
            steps = crate::config::MAX_STEP_LAG;
            self.kinematic_accum = 0.0;
        }

        for _ in 0..steps {
            for body in registry.bodies.iter_mut() {
                if body.kind == crate::core::rigidbody::BodyKind::Kinematic
                    && body.multi_islands.is_empty()
                {
                    crate::dynamics::integrator::stash_presentation(body);
                    crate::dynamics::integrator::integrate(body, registry.settings.fixed_dt);
                    crate::dynamics::integrator::update_derived_state(body);
                }
            }
        }
    }

    fn drain_worker_messages(&mut self, registry: &mut Registry) {
        let mut split_requests = Vec::new();
        let mut slept = Vec::new();
        let mut deltas = Vec::new();

        for (&island_id, handle) in &self.workers {
            for message in handle.channel.drain() {
                match message {
                    ToCoordinator::StepResult { delta, .. } => deltas.push(delta),
                    ToCoordinator::Sleeping(_) => slept.push(island_id),
                    ToCoordinator::SplitRequest(_) => split_requests.push(island_id),
                }
            }
        }

        for delta in deltas {
            apply_worker_delta(registry, *delta);
        }
        for island_id in slept {
            if let Some(island) = registry.islands.get_mut(island_id) {
                if !island.pending_wake {
                    island.sleeping = true;
                }
            }
        }
        registry.split_candidates.extend(split_requests);
    }

    /// Spawns workers for new islands, re-seeds those whose membership
    /// changed, and retires workers of dead islands.
    fn reconcile_workers(&mut self, registry: &mut Registry, dispatcher: &Arc<JobDispatcher>) {
        // Dead islands first.
        let dead: Vec<EntityId> = self
            .workers
            .keys()
            .copied()
            .filter(|id| !registry.islands.contains(*id))
            .collect();
        for island_id in dead {
            self.terminate_worker(island_id, dispatcher);
        }

        let island_ids: Vec<EntityId> = registry.islands.ids().collect();
        for island_id in island_ids {
            let (nodes, edges, sleeping) = {
                let island = registry.islands.get(island_id).unwrap();
                (island.nodes.len(), island.edges.len(), island.sleeping)
            };

            let needs_reseed = match self.workers.get(&island_id) {
                Some(handle) => handle.seeded_nodes != nodes || handle.seeded_edges != edges,
                None => !sleeping,
            };
            if !needs_reseed {
                continue;
            }

            self.terminate_worker(island_id, dispatcher);
            self.spawn_worker(registry, dispatcher, island_id);
        }
    }

    fn spawn_worker(
        &mut self,
        registry: &Registry,
        dispatcher: &Arc<JobDispatcher>,
        island_id: EntityId,
    ) {
        let Some(island) = registry.islands.get(island_id) else {
            return;
        };
        let (coordinator_side, worker_side) = duplex::<ToWorker, ToCoordinator>();
        let worker = IslandWorker::new(registry.settings, worker_side);

        let seed = build_seed_delta(registry, island_id);
        let seeded_nodes = island.nodes.len();
        let seeded_edges = island.edges.len();
        coordinator_side.send(ToWorker::Delta(Box::new(seed)));

        let job_id = dispatcher.schedule(Box::new(worker));
        debug!("spawned worker {job_id} for island {island_id:?}");
        self.workers.insert(
            island_id,
            WorkerHandle {
                channel: coordinator_side,
                job_id,
                seeded_nodes,
                seeded_edges,
            },
        );
    }

    fn terminate_worker(&mut self, island_id: EntityId, dispatcher: &Arc<JobDispatcher>) {
        if let Some(handle) = self.workers.remove(&island_id) {
            handle.channel.send(ToWorker::Terminate);
            dispatcher.unpark(handle.job_id);
        }
    }

    pub fn terminate_all_workers(&mut self) {
        for (_, handle) in self.workers.drain() {
            handle.channel.send(ToWorker::Terminate);
        }
    }

    /// Retires every worker and unparks them so termination is observed.
    pub fn shutdown(&mut self, dispatcher: &Arc<JobDispatcher>) {
        let islands: Vec<EntityId> = self.workers.keys().copied().collect();
        for island_id in islands {
            self.terminate_worker(island_id, dispatcher);
        }
    }

    /// Ships externally-written component state to the owning island's
    /// worker and wakes it.
    fn forward_external_writes(&mut self, registry: &mut Registry, dispatcher: &Arc<JobDispatcher>) {
        let dirty_bodies: Vec<EntityId> = registry
            .dirty
            .newer_than(self.dirty_consumed)
            .map(|index| {
                registry
                    .bodies
                    .ids()
                    .find(|id| id.index() == index)
                    .unwrap_or_default()
            })
            .filter(|id| !id.is_null())
            .collect();
        self.dirty_consumed = registry.dirty.counter();

        let mut per_island: HashMap<EntityId, RegistryDelta> = HashMap::new();
        for body_id in dirty_bodies {
            let Some(body) = registry.bodies.get(body_id) else {
                continue;
            };
            let islands: Vec<EntityId> = match body.island {
                Some(island) => vec![island],
                None => body.multi_islands.clone(),
            };
            for island_id in islands {
                per_island
                    .entry(island_id)
                    .or_default()
                    .updated_bodies
                    .push(BodyState {
                        entity: body_id,
                        transform: body.transform,
                        velocity: body.velocity,
                        spin: body.spin,
                    });
            }
        }

        for (island_id, delta) in per_island {
            if let Some(island) = registry.islands.get_mut(island_id) {
                island.pending_wake = true;
            }
            if let Some(handle) = self.workers.get(&island_id) {
                handle.channel.send(ToWorker::Delta(Box::new(delta)));
                dispatcher.unpark(handle.job_id);
            }
        }
    }

    /// Wakes islands flagged by external modification.
    fn wake_pending(&mut self, registry: &mut Registry, dispatcher: &Arc<JobDispatcher>, _now: f64) {
        let pending: Vec<EntityId> = registry
            .islands
            .iter_with_ids()
            .filter(|(_, island)| island.pending_wake)
            .map(|(id, _)| id)
            .collect();

        for island_id in pending {
            island::wake_island(registry, island_id);
            match self.workers.get(&island_id) {
                Some(handle) => {
                    handle.channel.send(ToWorker::Wake);
                    dispatcher.unpark(handle.job_id);
                }
                None => {
                    // A sleeping island without a worker gets one on the
                    // next reconcile pass.
                }
            }
        }
    }

    /// Pushes a settings change to every live worker.
    pub fn broadcast_settings(&self, registry: &Registry, dispatcher: &Arc<JobDispatcher>) {
        for handle in self.workers.values() {
            handle.channel.send(ToWorker::Settings(registry.settings));
            dispatcher.unpark(handle.job_id);
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

/// Merges a worker step result into the authoritative store.
fn apply_worker_delta(registry: &mut Registry, delta: RegistryDelta) {
    for state in delta.updated_bodies {
        if let Some(body) = registry.bodies.get_mut(state.entity) {
            body.transform = state.transform;
            body.velocity = state.velocity;
            body.spin = state.spin;
            body.update_world_inertia();
            body.update_rotated_mesh();
            body.update_aabb();
        }
    }

    for (entity, state) in delta.updated_manifolds {
        let had_points = registry
            .manifolds
            .get(entity)
            .map(|m| m.num_points() > 0);
        if let Some(manifold) = registry.manifolds.get_mut(entity) {
            manifold.copy_points_from(&state);
            let has_points = manifold.num_points() > 0;
            let (body_a, body_b) = (manifold.body_a, manifold.body_b);
            match (had_points, has_points) {
                (Some(false), true) => registry.events.push(ContactEvent::Started {
                    manifold: entity,
                    body_a,
                    body_b,
                }),
                (Some(true), false) => registry.events.push(ContactEvent::Ended {
                    manifold: entity,
                    body_a,
                    body_b,
                }),
                _ => {}
            }
        }
    }

    for (entity, joint) in delta.updated_joints {
        if let Some(constraint) = registry.constraints.get_mut(entity) {
            constraint.joint = joint;
        }
    }

    for entity in delta.destroyed_manifolds {
        registry.destroy_manifold(entity);
    }
}

/// Snapshot of one island for seeding a fresh worker.
fn build_seed_delta(registry: &Registry, island_id: EntityId) -> RegistryDelta {
    let mut delta = RegistryDelta {
        settings: Some(registry.settings),
        ..Default::default()
    };
    let Some(island) = registry.islands.get(island_id) else {
        return delta;
    };

    for &body_id in &island.nodes {
        if let Some(body) = registry.bodies.get(body_id) {
            delta.created_bodies.push((body_id, body.clone()));
        }
    }
    for &(entity, kind) in &island.edges {
        match kind {
            crate::core::graph::EdgeKind::Manifold => {
                if let Some(manifold) = registry.manifolds.get(entity) {
                    delta.created_manifolds.push((entity, manifold.clone()));
                }
            }
            crate::core::graph::EdgeKind::Constraint => {
                if let Some(constraint) = registry.constraints.get(entity) {
                    delta.created_constraints.push((
                        entity,
                        ConstraintSeed {
                            body_a: constraint.body_a,
                            body_b: constraint.body_b,
                            joint: constraint.joint.clone(),
                        },
                    ));
                }
            }
        }
    }
    delta
}

/// Kicks queued paged-mesh page loads and publishes load events.
fn poll_paged_meshes(registry: &mut Registry) {
    let mut events = Vec::new();
    for (body_id, body) in registry.bodies.iter_with_ids() {
        if let Shape::PagedMesh { mesh } = &body.shape {
            mesh.load_pending();
            for page in mesh.drain_loaded_events() {
                events.push(ContactEvent::PageLoaded {
                    body: body_id,
                    page,
                });
            }
        }
    }
    registry.events.extend(events);
}

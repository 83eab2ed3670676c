//! Background island worker: owns a private registry holding exactly one
//! island, steps it at the fixed rate, and exchanges deltas with the
//! coordinator. Workers never touch the shared store; topology changes are
//! requested, not performed.

use crate::collision::narrowphase;
use crate::config::{MAX_STEP_LAG, SimulationSettings};
use crate::config::{ISLAND_ANGULAR_SLEEP_THRESHOLD, ISLAND_LINEAR_SLEEP_THRESHOLD};
use crate::config::ISLAND_TIME_TO_SLEEP;
use crate::core::registry::Registry;
use crate::dynamics::solver::{step_island, IslandMembers};
use crate::parallel::delta::{BodyState, EntityMap, RegistryDelta};
use crate::parallel::job::{Job, JobDispatcher, JobOutcome};
use crate::parallel::message::DuplexChannel;
use crate::utils::allocator::EntityId;
use log::trace;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Coordinator → worker messages, delivered FIFO and processed at the top
/// of the worker's step.
pub enum ToWorker {
    Delta(Box<RegistryDelta>),
    Settings(SimulationSettings),
    Wake,
    Terminate,
}

/// Worker → coordinator messages.
pub enum ToCoordinator {
    StepResult {
        delta: Box<RegistryDelta>,
        timestamp: f64,
    },
    Sleeping(f64),
    /// The worker's graph fell apart into these components (coordinator
    /// body ids); the coordinator performs the actual split.
    SplitRequest(Vec<Vec<EntityId>>),
}

pub struct IslandWorker {
    registry: Registry,
    map: EntityMap,
    channel: DuplexChannel<ToCoordinator, ToWorker>,
    sim_time: f64,
    last_step: Option<Instant>,
    quiet_since: Option<f64>,
    sleeping: bool,
    terminating: bool,
    split_reported: bool,
}

impl IslandWorker {
    pub fn new(
        settings: SimulationSettings,
        channel: DuplexChannel<ToCoordinator, ToWorker>,
    ) -> Self {
        let mut registry = Registry::new();
        registry.settings = settings;
        Self {
            registry,
            map: EntityMap::default(),
            channel,
            sim_time: 0.0,
            last_step: None,
            quiet_since: None,
            sleeping: false,
            terminating: false,
            split_reported: false,
        }
    }

    fn drain_messages(&mut self) {
        for message in self.channel.drain() {
            match message {
                ToWorker::Delta(delta) => self.apply_delta(*delta),
                ToWorker::Settings(settings) => self.registry.settings = settings,
                ToWorker::Wake => {
                    self.sleeping = false;
                    self.quiet_since = None;
                    // Resume from now; don't try to catch up on slept time.
                    self.last_step = None;
                }
                ToWorker::Terminate => self.terminating = true,
            }
        }
    }

    /// Applies a coordinator batch, translating ids through the map.
    /// Creations run bodies-first so edges find their endpoints.
    fn apply_delta(&mut self, delta: RegistryDelta) {
        if let Some(settings) = delta.settings {
            self.registry.settings = settings;
        }

        for (remote, body) in delta.created_bodies {
            if self.map.local(remote).is_some() {
                continue;
            }
            let local = self.registry.insert_body_raw(body);
            self.map.insert(remote, local);
        }

        for (remote, state) in delta.created_manifolds {
            if self.map.local(remote).is_some() {
                continue;
            }
            let (Some(a), Some(b)) = (self.map.local(state.body_a), self.map.local(state.body_b))
            else {
                continue;
            };
            let local = self.registry.insert_manifold_raw(a, b, &state);
            self.map.insert(remote, local);
        }

        for (remote, seed) in delta.created_constraints {
            if self.map.local(remote).is_some() {
                continue;
            }
            let (Some(a), Some(b)) = (self.map.local(seed.body_a), self.map.local(seed.body_b))
            else {
                continue;
            };
            let local = self.registry.create_constraint(a, b, seed.joint);
            self.map.insert(remote, local);
        }

        for state in delta.updated_bodies {
            let Some(local) = self.map.local(state.entity) else {
                continue;
            };
            if let Some(body) = self.registry.bodies.get_mut(local) {
                body.transform = state.transform;
                body.velocity = state.velocity;
                body.spin = state.spin;
                body.update_world_inertia();
                body.update_rotated_mesh();
                body.update_aabb();
            }
        }

        for (remote, state) in delta.updated_manifolds {
            if let Some(local) = self.map.local(remote) {
                if let Some(manifold) = self.registry.manifolds.get_mut(local) {
                    manifold.copy_points_from(&state);
                }
            }
        }

        for (remote, joint) in delta.updated_joints {
            if let Some(local) = self.map.local(remote) {
                if let Some(constraint) = self.registry.constraints.get_mut(local) {
                    constraint.joint = joint;
                }
            }
        }

        for remote in delta.destroyed_manifolds {
            if let Some(local) = self.map.remove_remote(remote) {
                self.registry.destroy_manifold(local);
            }
        }
        for remote in delta.destroyed_constraints {
            if let Some(local) = self.map.remove_remote(remote) {
                self.registry.destroy_constraint(local);
            }
        }
        for remote in delta.destroyed_bodies {
            if let Some(local) = self.map.remove_remote(remote) {
                self.registry.destroy_body(local);
            }
        }

        // This worker does not partition; island bookkeeping queues are
        // meaningless here.
        self.registry.new_nodes.clear();
        self.registry.new_edges.clear();
        self.registry.split_candidates.clear();
    }

    fn all_members(&self) -> IslandMembers {
        IslandMembers {
            bodies: self.registry.bodies.ids().collect(),
            manifolds: self.registry.manifolds.ids().collect(),
            constraints: self.registry.constraints.ids().collect(),
        }
    }

    fn run_one_step(&mut self) {
        let step_started = Instant::now();
        let members = self.all_members();
        let dt = self.registry.settings.fixed_dt;

        crate::dynamics::solver::integrate_kinematic_bodies(&mut self.registry, dt);

        let narrow = narrowphase::update_manifolds(&mut self.registry, &members.manifolds);
        let mut destroyed_remote = Vec::new();
        for local in narrow.destroyed {
            if let Some(remote) = self.map.remote(local) {
                destroyed_remote.push(remote);
                self.map.remove_remote(remote);
            }
            self.registry.destroy_manifold(local);
        }

        let members = self.all_members();
        step_island(&mut self.registry, &members);
        self.sim_time += dt as f64;

        // Sleep tracking: the whole private store is one island.
        let mut quiet = true;
        for body in self.registry.bodies.iter() {
            if !body.is_dynamic() {
                continue;
            }
            if body.sleeping_disabled
                || body.velocity.linear.length() > ISLAND_LINEAR_SLEEP_THRESHOLD
                || body.velocity.angular.length() > ISLAND_ANGULAR_SLEEP_THRESHOLD
            {
                quiet = false;
                break;
            }
        }
        if quiet {
            let since = *self.quiet_since.get_or_insert(self.sim_time);
            if self.sim_time - since >= ISLAND_TIME_TO_SLEEP as f64 {
                self.sleeping = true;
                for body in self.registry.bodies.iter_mut() {
                    if body.is_dynamic() {
                        body.velocity = Default::default();
                    }
                }
            }
        } else {
            self.quiet_since = None;
        }

        self.send_step_result(destroyed_remote);
        self.check_split();
        crate::utils::logging::warn_if_step_budget_exceeded(step_started.elapsed(), dt);

        self.registry.new_nodes.clear();
        self.registry.new_edges.clear();
        self.registry.split_candidates.clear();
        self.registry.events.clear();
    }

    fn send_step_result(&mut self, destroyed_manifolds: Vec<EntityId>) {
        let mut delta = RegistryDelta {
            destroyed_manifolds,
            ..Default::default()
        };

        for (local, body) in self.registry.bodies.iter_with_ids() {
            // Static bodies never move; dynamic and kinematic states flow
            // back to the shared store.
            if body.is_static() {
                continue;
            }
            let Some(remote) = self.map.remote(local) else {
                continue;
            };
            delta.updated_bodies.push(BodyState {
                entity: remote,
                transform: body.transform,
                velocity: body.velocity,
                spin: body.spin,
            });
        }

        for (local, manifold) in self.registry.manifolds.iter_with_ids() {
            if let Some(remote) = self.map.remote(local) {
                delta.updated_manifolds.push((remote, manifold.clone()));
            }
        }

        for (local, constraint) in self.registry.constraints.iter_with_ids() {
            if let Some(remote) = self.map.remote(local) {
                delta.updated_joints.push((remote, constraint.joint.clone()));
            }
        }

        self.channel.send(ToCoordinator::StepResult {
            delta: Box::new(delta),
            timestamp: self.sim_time,
        });
    }

    /// When the private graph is no longer one component, ask the
    /// coordinator to split. Asked once per topology change.
    fn check_split(&mut self) {
        let components = self.registry.graph.connected_components();
        if components.len() <= 1 {
            self.split_reported = false;
            return;
        }
        if self.split_reported {
            return;
        }
        self.split_reported = true;

        let groups: Vec<Vec<EntityId>> = components
            .iter()
            .map(|component| {
                component
                    .nodes
                    .iter()
                    .filter_map(|&node| {
                        let local = self.registry.graph.node_entity(node);
                        self.map.remote(local)
                    })
                    .collect()
            })
            .collect();
        trace!("worker requesting split into {} components", groups.len());
        self.channel.send(ToCoordinator::SplitRequest(groups));
    }
}

impl Job for IslandWorker {
    fn run(&mut self, _dispatcher: &Arc<JobDispatcher>) -> JobOutcome {
        self.drain_messages();

        if self.terminating {
            return JobOutcome::Done;
        }
        if self.registry.settings.paused {
            return JobOutcome::Park;
        }
        if self.sleeping {
            self.channel.send(ToCoordinator::Sleeping(self.sim_time));
            return JobOutcome::Park;
        }

        let dt = self.registry.settings.fixed_dt;
        let step_duration = Duration::from_secs_f32(dt);
        let now = Instant::now();
        let last = *self.last_step.get_or_insert(now);
        let elapsed = now.saturating_duration_since(last);

        // Whole steps owed to real time, capped so a stall doesn't trigger
        // runaway catch-up.
        let mut due = (elapsed.as_secs_f64() / dt as f64) as u32;
        if due > MAX_STEP_LAG {
            due = MAX_STEP_LAG;
            self.last_step = Some(now);
        }

        if due == 0 {
            let remaining = step_duration.saturating_sub(elapsed);
            return JobOutcome::RescheduleAfter(remaining);
        }

        for _ in 0..due {
            self.run_one_step();
            if self.sleeping {
                break;
            }
        }
        if let Some(last) = &mut self.last_step {
            *last += step_duration * due;
        }

        if self.sleeping {
            self.channel.send(ToCoordinator::Sleeping(self.sim_time));
            JobOutcome::Park
        } else {
            JobOutcome::RescheduleAfter(step_duration)
        }
    }
}

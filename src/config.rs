//! Global simulation constants and tunable settings.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Default gravity vector (Y-up).
pub const DEFAULT_GRAVITY: [f32; 3] = [0.0, -9.81, 0.0];

/// Default fixed integration timestep in seconds.
pub const DEFAULT_FIXED_DT: f32 = 1.0 / 60.0;

/// Maximum number of contact points a manifold holds.
pub const MAX_CONTACTS: usize = 4;

/// A contact point whose normal or tangential separation grows beyond this
/// value is retired.
pub const CONTACT_BREAKING_THRESHOLD: f32 = 0.02;

/// New collision points closer than this to an existing contact point are
/// merged into it, extending its lifetime.
pub const CONTACT_CACHING_THRESHOLD: f32 = 0.04;

/// Manifolds are created with this separation threshold; broadphase queries
/// are inflated by the breaking threshold so pairs appear slightly early.
pub const MANIFOLD_SEPARATION_THRESHOLD: f32 = CONTACT_BREAKING_THRESHOLD * 4.0 * 1.3;

/// All bodies in an island must stay below these speeds for the island to
/// eventually fall asleep.
pub const ISLAND_LINEAR_SLEEP_THRESHOLD: f32 = 0.005;
pub const ISLAND_ANGULAR_SLEEP_THRESHOLD: f32 = std::f32::consts::PI / 48.0;

/// Continuous quiet time required before an island sleeps, in seconds.
pub const ISLAND_TIME_TO_SLEEP: f32 = 2.0;

/// Support features collect all points within this tolerance behind the
/// extreme point, which sidesteps float noise when picking faces over edges.
pub const SUPPORT_FEATURE_TOLERANCE: f32 = 0.004;

/// Velocity iterations of the projected Gauss-Seidel solver.
pub const DEFAULT_VELOCITY_ITERATIONS: u32 = 8;

/// Position correction iterations run after integration.
pub const DEFAULT_POSITION_ITERATIONS: u32 = 3;

/// Iterations of the dedicated restitution pass; zero disables the pass and
/// folds restitution into the normal row rhs instead.
pub const DEFAULT_RESTITUTION_ITERATIONS: u32 = 4;

/// A worker that falls behind never accumulates more than this many fixed
/// steps of lag; anything beyond is dropped to avoid runaway catch-up.
pub const MAX_STEP_LAG: u32 = 10;

/// Settings shared by the coordinator and every island worker. Changes are
/// propagated to workers through settings messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub fixed_dt: f32,
    pub gravity: Vec3,
    pub velocity_iterations: u32,
    pub position_iterations: u32,
    pub restitution_iterations: u32,
    pub paused: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            fixed_dt: DEFAULT_FIXED_DT,
            gravity: Vec3::from_slice(&DEFAULT_GRAVITY),
            velocity_iterations: DEFAULT_VELOCITY_ITERATIONS,
            position_iterations: DEFAULT_POSITION_ITERATIONS,
            restitution_iterations: DEFAULT_RESTITUTION_ITERATIONS,
            paused: false,
        }
    }
}

/// Startup configuration handed to [`crate::attach`].
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub settings: SimulationSettings,
    /// Worker threads in the job dispatcher pool. Zero picks a size based on
    /// available parallelism.
    pub num_worker_threads: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            settings: SimulationSettings::default(),
            num_worker_threads: 0,
        }
    }
}

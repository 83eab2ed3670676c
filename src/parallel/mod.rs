//! Concurrency layer: the job dispatcher, coordinator↔worker messaging,
//! registry deltas, and the background island workers.

pub mod coordinator;
pub mod delta;
pub mod job;
pub mod message;
pub mod worker;

use crate::config::SimulationConfig;
use coordinator::Coordinator;
use job::JobDispatcher;
use std::sync::Arc;
use std::time::Instant;

/// Pluggable clock driving the fixed-step schedule, replaceable for
/// deterministic tests.
pub trait TimeSource: Send + Sync {
    /// Seconds since an arbitrary epoch.
    fn now(&self) -> f64;
}

struct MonotonicClock {
    start: Instant,
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Everything the engine adds to a registry on [`crate::attach`]: the
/// worker pool, the coordinator, and the clock. Owned, not global, so
/// tests stay hermetic.
pub struct Runtime {
    pub(crate) dispatcher: Arc<JobDispatcher>,
    pub(crate) coordinator: Coordinator,
    pub(crate) time_source: Arc<dyn TimeSource>,
    pub(crate) sim_time: f64,
}

impl Runtime {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            dispatcher: JobDispatcher::new(config.num_worker_threads),
            coordinator: Coordinator::new(),
            time_source: Arc::new(MonotonicClock {
                start: Instant::now(),
            }),
            sim_time: 0.0,
        }
    }

    pub fn set_time_source(&mut self, source: Arc<dyn TimeSource>) {
        self.time_source = source;
    }

    pub fn shutdown(&mut self) {
        self.coordinator.shutdown(&self.dispatcher);
        self.dispatcher.shutdown();
    }
}

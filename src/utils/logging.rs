use log::{log_enabled, warn, Level};
use std::time::{Duration, Instant};

/// Scoped timer for profiling simulation phases at trace level.
pub struct ScopedTimer<'a> {
    label: &'a str,
    start: Instant,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(label: &'a str) -> Self {
        if log_enabled!(Level::Trace) {
            log::trace!("begin {label}");
        }
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        if log_enabled!(Level::Trace) {
            let elapsed = self.start.elapsed();
            log::trace!("end {} ({} µs)", self.label, elapsed.as_micros());
        }
    }
}

/// Warns when a fixed step took longer than its real-time budget.
pub fn warn_if_step_budget_exceeded(duration: Duration, fixed_dt: f32) {
    let budget_ms = fixed_dt * 1000.0;
    let spent_ms = duration.as_secs_f32() * 1000.0;
    if spent_ms > budget_ms {
        warn!("step exceeded budget: {spent_ms:.2} ms > {budget_ms:.2} ms");
    }
}

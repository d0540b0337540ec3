//! Per-phase timing for reconciliation runs.
//!
//! [`PhaseTimer`] adds the time between its creation and its drop to a
//! `Duration` slot, so a phase is timed even when it exits early with `?`.

use std::time::{Duration, Instant};

use serde::Serialize;

/// RAII timer that adds elapsed time to a slot on drop.
///
/// ```rust,ignore
/// let mut stats = RunStats::default();
/// {
///     let _timer = PhaseTimer::new(&mut stats.calculate);
///     // ... calculate ...
/// }
/// ```
pub struct PhaseTimer<'a> {
    start: Instant,
    slot: &'a mut Duration,
}

impl<'a> PhaseTimer<'a> {
    pub fn new(slot: &'a mut Duration) -> Self {
        Self {
            start: Instant::now(),
            slot,
        }
    }
}

impl Drop for PhaseTimer<'_> {
    fn drop(&mut self) {
        *self.slot += self.start.elapsed();
    }
}

/// Time spent in each phase of the most recent run, and what it did.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunStats {
    pub prefetch: Duration,
    pub validate: Duration,
    pub calculate: Duration,
    pub preapply: Duration,
    pub apply: Duration,
    pub audit: Duration,
    /// Actions produced by the last calculate.
    pub actions: usize,
    /// Actions applied without error by the last execute.
    pub applied: usize,
}

impl RunStats {
    pub fn total(&self) -> Duration {
        self.prefetch + self.validate + self.calculate + self.preapply + self.apply + self.audit
    }
}

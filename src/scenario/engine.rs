//! Scenario Engine
//!
//! Maps elapsed run time to per-subsystem modes. The engine keeps no state
//! beyond the immutable scenario and the clock reading taken at construction;
//! every query recomputes from the clock. Elapsed time is relative to the run
//! start, so scenarios can be exercised with a [`ManualClock`].

use super::{Scenario, StateMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Time since an arbitrary, fixed origin
    fn now(&self) -> Duration;
}

/// Wall-clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock; clones share the same reading
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.millis.store(to.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Scenario playback anchored at construction time
pub struct ScenarioEngine {
    scenario: Scenario,
    clock: Arc<dyn Clock>,
    started: Duration,
}

impl ScenarioEngine {
    pub fn new(scenario: Scenario, clock: Arc<dyn Clock>) -> Self {
        let started = clock.now();
        Self {
            scenario,
            clock,
            started,
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Clock reading taken at construction
    pub fn started_at(&self) -> Duration {
        self.started
    }

    /// Whole seconds since the engine was built
    pub fn elapsed(&self) -> u64 {
        self.clock.now().saturating_sub(self.started).as_secs()
    }

    pub fn current_state(&self) -> StateMap {
        self.scenario.state_at(self.elapsed())
    }

    pub fn done(&self) -> bool {
        self.scenario.is_done(self.elapsed())
    }
}

//! IoT security testbed
//!
//! Replays attack scenarios against simulated IoT sensors and records the
//! resulting telemetry:
//!
//! ```text
//!  scenario ──► ScenarioEngine ──► Producers ──TCP──► IngestServer ──► Recorder ──► run log
//!                     ▲                                                   ▲
//!                     └──────────── TestbedController (start/stop) ───────┘
//! ```
//!
//! The ingestion server lives for the whole process; runs come and go on top
//! of it, each writing one NDJSON log under the data directory.

pub mod api;
pub mod archive;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod producer;
pub mod scenario;
pub mod session;

pub use codec::{Reading, Record};
pub use config::TestbedConfig;
pub use controller::{RunId, RunStatus, TestbedController};
pub use error::{Result, TestbedError};
pub use ingest::IngestServer;
pub use producer::{Producer, ProducerFactory, SensorFactory};
pub use scenario::{Clock, Scenario, ScenarioEngine, StateMap};
pub use session::Recorder;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, continuing past poisoning.
///
/// A panic while holding one of the crate's locks leaves the guarded data
/// consistent (every critical section is a single append or swap).
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

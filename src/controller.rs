//! Testbed Controller
//!
//! Owns the run lifecycle:
//!
//! ```text
//!            start()                      stop() / scenario done
//!   Idle ───────────────► Running ──────────────────────────────► Idle
//!     ▲   opens session,    │ loop thread: state → producers → tick
//!     │   spawns loop       │
//!     └─────────────────────┘  session closed by the loop on exit
//! ```
//!
//! The run slot mutex makes "check idle, then start" a single step, so two
//! racing `start()` calls can never both succeed. The orchestration loop runs
//! on its own thread and waits out each tick on a channel that `stop()`
//! disconnects, so a stop is observed at the next tick boundary without
//! interrupting a producer that is mid-send.

use crate::error::{Result, TestbedError};
use crate::lock;
use crate::metrics;
use crate::producer::{Producer, ProducerFactory};
use crate::scenario::{Clock, Scenario, ScenarioEngine, SystemClock};
use crate::session::{Recorder, SessionId, SessionInfo, SessionSummary};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Default)]
pub struct RunStats {
    pub ticks: AtomicU64,
    pub sends: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Controller state as reported by `status()`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

/// Outcome of an explicit stop
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub ticks: u64,
    pub sends: u64,
    pub send_failures: u64,
    pub session: Option<SessionSummary>,
}

struct ActiveRun {
    id: RunId,
    label: String,
    duration_seconds: u64,
    started_at: Duration,
    session: SessionInfo,
    finished: Arc<AtomicBool>,
    stats: Arc<RunStats>,
    /// Dropping this wakes the loop and tells it to exit
    stop_tx: Option<Sender<()>>,
    /// Disconnects once the loop thread is done
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<Option<SessionSummary>>>,
}

impl ActiveRun {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn join(&mut self) -> Option<SessionSummary> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(summary) => summary,
            Err(_) => {
                error!(run = %self.id, "Orchestration loop panicked");
                None
            }
        }
    }
}

pub struct TestbedController {
    recorder: Arc<Recorder>,
    factory: Arc<dyn ProducerFactory>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    slot: Mutex<Option<ActiveRun>>,
}

impl TestbedController {
    pub fn new(
        recorder: Arc<Recorder>,
        factory: Arc<dyn ProducerFactory>,
        tick_interval: Duration,
    ) -> Self {
        Self::with_clock(recorder, factory, tick_interval, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        recorder: Arc<Recorder>,
        factory: Arc<dyn ProducerFactory>,
        tick_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            recorder,
            factory,
            clock,
            tick_interval,
            slot: Mutex::new(None),
        }
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Start a run of an already loaded scenario
    pub fn start(&self, scenario: Scenario, label: impl Into<String>) -> Result<RunId> {
        let mut slot = lock(&self.slot);
        ensure_idle(&mut slot)?;
        self.launch(&mut slot, scenario, label.into())
    }

    /// Start a run from a scenario document on disk
    pub fn start_from_path(&self, path: impl AsRef<Path>) -> Result<RunId> {
        let path = path.as_ref();
        let mut slot = lock(&self.slot);
        ensure_idle(&mut slot)?;
        let scenario = Scenario::load(path)?;
        self.launch(&mut slot, scenario, path.display().to_string())
    }

    /// Stop the active run and wait for its loop to exit
    pub fn stop(&self) -> Result<RunReport> {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_none_or(ActiveRun::is_finished) {
            reap(&mut slot);
            return Err(TestbedError::NotRunning);
        }
        let Some(mut run) = slot.take() else {
            return Err(TestbedError::NotRunning);
        };

        info!(run = %run.id, "Stop requested");
        drop(run.stop_tx.take());
        let summary = run.join();
        if summary.is_none() {
            // Loop died before closing its session
            self.recorder.close(run.session.id);
        }

        Ok(RunReport {
            run_id: run.id,
            ticks: run.stats.ticks.load(Ordering::Relaxed),
            sends: run.stats.sends.load(Ordering::Relaxed),
            send_failures: run.stats.send_failures.load(Ordering::Relaxed),
            session: summary,
        })
    }

    pub fn is_running(&self) -> bool {
        lock(&self.slot)
            .as_ref()
            .is_some_and(|run| !run.is_finished())
    }

    pub fn status(&self) -> RunStatus {
        let slot = lock(&self.slot);
        match slot.as_ref() {
            Some(run) if !run.is_finished() => RunStatus {
                running: true,
                run_id: Some(run.id),
                scenario: Some(run.label.clone()),
                elapsed_seconds: Some(self.clock.now().saturating_sub(run.started_at).as_secs()),
                duration_seconds: Some(run.duration_seconds),
                session: Some(run.session.clone()),
            },
            _ => RunStatus::default(),
        }
    }

    /// Block until the current run ends or `timeout` passes.
    ///
    /// Returns true when no run is active on return.
    pub fn wait(&self, timeout: Duration) -> bool {
        let done_rx = match lock(&self.slot).as_ref() {
            Some(run) => run.done_rx.clone(),
            None => return true,
        };
        !matches!(done_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    fn launch(&self, slot: &mut Option<ActiveRun>, scenario: Scenario, label: String) -> Result<RunId> {
        for issue in scenario.validate() {
            warn!(scenario = %label, %issue, "Scenario issue");
        }

        let session = self.recorder.open()?;
        let producers = self.factory.build();
        let id = Uuid::new_v4();
        let duration_seconds = scenario.duration_seconds;
        let engine = ScenarioEngine::new(scenario, self.clock.clone());
        let started_at = engine.started_at();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let finished = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RunStats::default());
        let producer_count = producers.len();

        let run_loop = RunLoop {
            id,
            engine,
            producers,
            recorder: self.recorder.clone(),
            session_id: session.id,
            tick_interval: self.tick_interval,
            stop_rx,
            finished: finished.clone(),
            stats: stats.clone(),
            _done_tx: done_tx,
        };

        let handle = match thread::Builder::new()
            .name(format!("testbed-run-{}", &id.simple().to_string()[..8]))
            .spawn(move || run_loop.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.recorder.close(session.id);
                return Err(e.into());
            }
        };

        info!(
            run = %id,
            scenario = %label,
            duration_seconds,
            producers = producer_count,
            "Run started"
        );

        *slot = Some(ActiveRun {
            id,
            label,
            duration_seconds,
            started_at,
            session,
            finished,
            stats,
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        });
        Ok(id)
    }
}

impl Drop for TestbedController {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn ensure_idle(slot: &mut Option<ActiveRun>) -> Result<()> {
    if slot.as_ref().is_some_and(|run| !run.is_finished()) {
        return Err(TestbedError::AlreadyRunning);
    }
    reap(slot);
    Ok(())
}

/// Collect a run that ended on its own
fn reap(slot: &mut Option<ActiveRun>) {
    if let Some(mut run) = slot.take() {
        run.join();
    }
}

/// State moved onto the orchestration thread
struct RunLoop {
    id: RunId,
    engine: ScenarioEngine,
    producers: Vec<Box<dyn Producer>>,
    recorder: Arc<Recorder>,
    session_id: SessionId,
    tick_interval: Duration,
    stop_rx: Receiver<()>,
    finished: Arc<AtomicBool>,
    stats: Arc<RunStats>,
    _done_tx: Sender<()>,
}

impl RunLoop {
    fn run(mut self) -> Option<SessionSummary> {
        let reason = loop {
            if !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                break "stopped";
            }
            if self.engine.done() {
                break "completed";
            }

            self.tick();

            match self.stop_rx.recv_timeout(self.tick_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break "stopped",
            }
        };

        // Once this is set a racing start() reaps the run, and its join
        // waits for the close below
        self.finished.store(true, Ordering::SeqCst);
        let summary = self.recorder.close(self.session_id);
        info!(
            run = %self.id,
            reason,
            ticks = self.stats.ticks.load(Ordering::Relaxed),
            send_failures = self.stats.send_failures.load(Ordering::Relaxed),
            "Run finished"
        );
        summary
    }

    fn tick(&mut self) {
        let state = self.engine.current_state();
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        metrics::TICKS_TOTAL.inc();

        for producer in self.producers.iter_mut() {
            let mode = state.mode_for(producer.subsystem());
            match producer.send(mode) {
                Ok(()) => {
                    self.stats.sends.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::PRODUCER_FAILURES.inc();
                    warn!(
                        run = %self.id,
                        subsystem = producer.subsystem(),
                        mode,
                        error = %e,
                        "Producer send failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ManualClock;

    type Calls = Arc<Mutex<Vec<(String, String)>>>;

    struct RecordingProducer {
        subsystem: String,
        calls: Calls,
    }

    impl Producer for RecordingProducer {
        fn subsystem(&self) -> &str {
            &self.subsystem
        }

        fn send(&mut self, mode: &str) -> Result<()> {
            lock(&self.calls).push((self.subsystem.clone(), mode.to_string()));
            Ok(())
        }
    }

    struct FailingProducer;

    impl Producer for FailingProducer {
        fn subsystem(&self) -> &str {
            "device"
        }

        fn send(&mut self, _mode: &str) -> Result<()> {
            Err(TestbedError::Transport {
                subsystem: "device".to_string(),
                source: std::io::Error::other("connection refused"),
            })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        controller: TestbedController,
        clock: ManualClock,
        calls: Calls,
    }

    fn harness(with_failing: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::new(dir.path()));
        let calls: Calls = Arc::default();
        let factory_calls = calls.clone();
        let factory = move || {
            let mut producers: Vec<Box<dyn Producer>> = vec![
                Box::new(RecordingProducer {
                    subsystem: "network".to_string(),
                    calls: factory_calls.clone(),
                }),
                Box::new(RecordingProducer {
                    subsystem: "auth".to_string(),
                    calls: factory_calls.clone(),
                }),
            ];
            if with_failing {
                producers.push(Box::new(FailingProducer));
            }
            producers
        };
        let clock = ManualClock::new();
        let controller = TestbedController::with_clock(
            recorder,
            Arc::new(factory),
            Duration::from_millis(5),
            Arc::new(clock.clone()),
        );
        Harness {
            _dir: dir,
            controller,
            clock,
            calls,
        }
    }

    fn scenario(duration: u64) -> Scenario {
        format!(
            r#"{{"duration_seconds": {}, "phases": [
                {{"start":0,"end":2,"network":"normal","auth":"normal"}},
                {{"start":2,"end":4,"network":"ddos","auth":"bruteforce"}}
            ]}}"#,
            duration
        )
        .parse()
        .unwrap()
    }

    fn wait_for_calls(calls: &Calls, n: usize) {
        for _ in 0..400 {
            if lock(calls).len() >= n {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("producers were not called {} times", n);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let h = harness(false);
        h.controller.start(scenario(60), "first").unwrap();
        assert!(matches!(
            h.controller.start(scenario(60), "second"),
            Err(TestbedError::AlreadyRunning)
        ));
        assert_eq!(h.controller.recorder().stats().sessions_opened, 1);
        h.controller.stop().unwrap();
    }

    #[test]
    fn test_concurrent_starts_yield_one_winner() {
        let h = harness(false);
        let controller = &h.controller;
        let results: Vec<Result<RunId>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| s.spawn(move || controller.start(scenario(60), format!("racer-{}", i))))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, TestbedError::AlreadyRunning))
        );
        h.controller.stop().unwrap();
    }

    #[test]
    fn test_stop_when_idle_has_no_side_effects() {
        let h = harness(false);
        assert!(matches!(h.controller.stop(), Err(TestbedError::NotRunning)));
        assert!(!h.controller.recorder().is_open());
        assert_eq!(h.controller.recorder().stats().sessions_opened, 0);
    }

    #[test]
    fn test_modes_follow_the_clock() {
        let h = harness(false);
        h.controller.start(scenario(60), "timeline").unwrap();
        wait_for_calls(&h.calls, 2);

        h.clock.advance(Duration::from_secs(3));
        let seen = lock(&h.calls).len();
        wait_for_calls(&h.calls, seen + 4);
        h.controller.stop().unwrap();

        let calls = lock(&h.calls).clone();
        assert_eq!(calls[0], ("network".to_string(), "normal".to_string()));
        assert_eq!(calls[1], ("auth".to_string(), "normal".to_string()));
        assert!(calls.contains(&("network".to_string(), "ddos".to_string())));
        assert!(calls.contains(&("auth".to_string(), "bruteforce".to_string())));

        // Past the last phase everything is normal again
        let first_ddos = calls.iter().position(|c| c.1 == "ddos").unwrap();
        assert!(calls[..first_ddos].iter().all(|c| c.1 == "normal"));
    }

    #[test]
    fn test_stop_halts_producers_and_closes_session() {
        let h = harness(false);
        h.controller.start(scenario(60), "stoppable").unwrap();
        assert!(h.controller.status().running);
        assert!(h.controller.recorder().is_open());
        wait_for_calls(&h.calls, 4);

        let report = h.controller.stop().unwrap();
        assert!(report.ticks >= 2);
        assert!(report.session.is_some());
        assert!(!h.controller.is_running());
        assert!(!h.controller.recorder().is_open());

        let after_stop = lock(&h.calls).len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(lock(&h.calls).len(), after_stop);
        assert!(matches!(h.controller.stop(), Err(TestbedError::NotRunning)));
    }

    #[test]
    fn test_natural_completion_returns_to_idle() {
        let h = harness(false);
        h.controller.start(scenario(4), "short").unwrap();
        wait_for_calls(&h.calls, 2);

        h.clock.advance(Duration::from_secs(4));
        assert!(h.controller.wait(Duration::from_secs(2)));
        assert!(!h.controller.is_running());
        assert!(!h.controller.status().running);
        assert!(!h.controller.recorder().is_open());

        // No explicit stop needed before the next run
        assert!(matches!(h.controller.stop(), Err(TestbedError::NotRunning)));
        h.controller.start(scenario(4), "again").unwrap();
        assert!(h.controller.is_running());
        assert_eq!(h.controller.recorder().stats().sessions_opened, 2);
        h.controller.stop().unwrap();
    }

    #[test]
    fn test_start_succeeds_as_soon_as_run_reports_idle() {
        let h = harness(false);
        for round in 0..20 {
            h.controller.start(scenario(1), format!("round-{}", round)).unwrap();
            h.clock.advance(Duration::from_secs(1));
            while h.controller.is_running() {
                thread::yield_now();
            }
            // Session close may still be in flight; start must wait for it
            h.controller.start(scenario(60), "follow-up").unwrap();
            h.controller.stop().unwrap();
        }
        assert_eq!(h.controller.recorder().stats().sessions_opened, 40);
    }

    #[test]
    fn test_producer_failure_does_not_abort_run() {
        let h = harness(true);
        h.controller.start(scenario(60), "lossy").unwrap();
        wait_for_calls(&h.calls, 6);
        assert!(h.controller.is_running());

        let report = h.controller.stop().unwrap();
        assert!(report.send_failures >= 3);
        assert!(report.sends >= 6);
    }

    #[test]
    fn test_missing_scenario_never_opens_session() {
        let h = harness(false);
        let err = h
            .controller
            .start_from_path("/definitely/not/here.json")
            .unwrap_err();
        assert!(matches!(err, TestbedError::ScenarioNotFound(_)));
        assert!(!h.controller.is_running());
        assert_eq!(h.controller.recorder().stats().sessions_opened, 0);
    }

    #[test]
    fn test_status_reports_active_run() {
        let h = harness(false);
        assert!(!h.controller.status().running);

        let id = h.controller.start(scenario(60), "status").unwrap();
        h.clock.advance(Duration::from_secs(7));
        let status = h.controller.status();
        assert!(status.running);
        assert_eq!(status.run_id, Some(id));
        assert_eq!(status.scenario.as_deref(), Some("status"));
        assert_eq!(status.elapsed_seconds, Some(7));
        assert_eq!(status.duration_seconds, Some(60));
        h.controller.stop().unwrap();
    }
}

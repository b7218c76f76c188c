//! Logging Session
//!
//! The [`Recorder`] owns the single append-only run log. Every ingestion
//! connection funnels its readings through [`Recorder::append`], whose mutex
//! is the one write-serialization point of the process: lines never
//! interleave and every accepted write is flushed before the lock is released.
//!
//! # Lifecycle
//!
//! ```text
//! open() ──► append()* ──► close(id)
//!   │                         │
//!   └─ fails while a session  └─ no-op for a stale id
//!      is already open
//! ```
//!
//! Appending while no session is open is not an error: the reading is
//! discarded and counted so ingestion never blocks on a run.

use crate::codec::Reading;
use crate::error::{Result, TestbedError};
use crate::lock;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Identifies one opened session
pub type SessionId = u64;

/// Description of an open session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub path: PathBuf,
    pub opened_at: DateTime<Utc>,
}

/// Returned when a session is closed
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub info: SessionInfo,
    pub records_written: u64,
    pub closed_at: DateTime<Utc>,
}

/// What happened to an appended reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    /// No session open; reading discarded
    NoSession,
    /// Write to the log failed; session stays open
    Failed,
}

#[derive(Debug, Default)]
pub struct RecorderStats {
    pub written: AtomicU64,
    pub dropped_no_session: AtomicU64,
    pub write_failures: AtomicU64,
    pub sessions_opened: AtomicU64,
}

/// Snapshot of [`RecorderStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderCounts {
    pub written: u64,
    pub dropped_no_session: u64,
    pub write_failures: u64,
    pub sessions_opened: u64,
}

struct ActiveSession {
    info: SessionInfo,
    writer: BufWriter<File>,
    written: u64,
}

/// Owner of the process-wide run log
pub struct Recorder {
    data_dir: PathBuf,
    active: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
    stats: RecorderStats,
}

impl Recorder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            stats: RecorderStats::default(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Open a new, uniquely named run log
    pub fn open(&self) -> Result<SessionInfo> {
        let mut active = lock(&self.active);
        if let Some(session) = active.as_ref() {
            return Err(TestbedError::SessionAlreadyOpen(session.info.path.clone()));
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let opened_at = Utc::now();
        let stem = chrono::Local::now()
            .format("testbed_%Y%m%d_%H%M%S")
            .to_string();
        let (path, file) = create_unique(&self.data_dir, &stem)?;

        let info = SessionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            path,
            opened_at,
        };
        info!(session = info.id, path = %info.path.display(), "Logging session opened");

        *active = Some(ActiveSession {
            info: info.clone(),
            writer: BufWriter::new(file),
            written: 0,
        });
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(info)
    }

    /// Timestamp a reading and append it as one line
    pub fn append(&self, reading: Reading) -> AppendOutcome {
        let mut active = lock(&self.active);
        let Some(session) = active.as_mut() else {
            self.stats.dropped_no_session.fetch_add(1, Ordering::Relaxed);
            metrics::RECORDS_DROPPED.inc();
            return AppendOutcome::NoSession;
        };

        let record = reading.finalize(Utc::now().timestamp());
        let result = serde_json::to_vec(&record)
            .map_err(std::io::Error::from)
            .and_then(|mut line| {
                line.push(b'\n');
                session.writer.write_all(&line)?;
                session.writer.flush()
            });

        match result {
            Ok(()) => {
                session.written += 1;
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                metrics::RECORDS_WRITTEN.inc();
                AppendOutcome::Written
            }
            Err(e) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                error!(session = session.info.id, error = %e, "Failed to append record");
                AppendOutcome::Failed
            }
        }
    }

    /// Close the session `id`; stale ids are ignored
    pub fn close(&self, id: SessionId) -> Option<SessionSummary> {
        let mut active = lock(&self.active);
        if active.as_ref().map(|s| s.info.id) != Some(id) {
            debug!(session = id, "Close ignored, session not current");
            return None;
        }
        active.take().map(finish)
    }

    /// Close whatever session is open (shutdown path)
    pub fn close_current(&self) -> Option<SessionSummary> {
        lock(&self.active).take().map(finish)
    }

    pub fn current(&self) -> Option<SessionInfo> {
        lock(&self.active).as_ref().map(|s| s.info.clone())
    }

    pub fn is_open(&self) -> bool {
        lock(&self.active).is_some()
    }

    pub fn stats(&self) -> RecorderCounts {
        RecorderCounts {
            written: self.stats.written.load(Ordering::Relaxed),
            dropped_no_session: self.stats.dropped_no_session.load(Ordering::Relaxed),
            write_failures: self.stats.write_failures.load(Ordering::Relaxed),
            sessions_opened: self.stats.sessions_opened.load(Ordering::Relaxed),
        }
    }
}

fn finish(mut session: ActiveSession) -> SessionSummary {
    if let Err(e) = session.writer.flush() {
        error!(session = session.info.id, error = %e, "Final flush failed");
    }
    info!(
        session = session.info.id,
        records = session.written,
        "Logging session closed"
    );
    SessionSummary {
        info: session.info,
        records_written: session.written,
        closed_at: Utc::now(),
    }
}

/// Create `<stem>.jsonl`, or `<stem>_<n>.jsonl` if that name is taken
fn create_unique(dir: &Path, stem: &str) -> std::io::Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}.jsonl", stem)
        } else {
            format!("{}_{}.jsonl", stem, attempt)
        };
        let path = dir.join(name);
        match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

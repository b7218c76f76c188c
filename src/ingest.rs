//! Ingestion Server
//!
//! Long-lived TCP service that turns sensor byte streams into run-log
//! records.
//!
//! # Connection Lifecycle
//!
//! ```text
//! 1. Sensor connects to the ingestion port
//! 2. An admission permit is taken; without one the socket is closed at once
//! 3. A task reads into a per-connection buffer and splits newline frames
//! 4. Each frame is decoded; failures are counted and skipped
//! 5. Readings go to the Recorder (discarded if no session is open)
//! 6. Empty read or read error ends the task and releases the permit
//! ```
//!
//! Frames from one connection are handled strictly in arrival order, so they
//! reach the log in that order. The server is started once per process and
//! outlives every run.

use crate::codec::{Frame, FrameDecoder, Reading, decode_reading};
use crate::config::IngestConfig;
use crate::error::Result;
use crate::metrics;
use crate::session::{AppendOutcome, Recorder};
use bytes::BytesMut;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

/// Bytes reserved before each socket read
const READ_CHUNK: usize = 4096;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct IngestStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub active: AtomicU64,
    pub frames: AtomicU64,
    pub malformed: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped_no_session: AtomicU64,
}

/// Snapshot of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub active: u64,
    pub frames: u64,
    pub malformed: u64,
    pub forwarded: u64,
    pub dropped_no_session: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestCounts {
        IngestCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_no_session: self.dropped_no_session.load(Ordering::Relaxed),
        }
    }
}

/// Bound listener plus the shared state handed to each connection
pub struct IngestServer {
    listener: TcpListener,
    recorder: Arc<Recorder>,
    permits: Arc<Semaphore>,
    max_frame_bytes: usize,
    stats: Arc<IngestStats>,
}

impl IngestServer {
    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind(config: &IngestConfig, recorder: Arc<Recorder>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            max_connections = config.max_connections,
            "Ingestion server listening"
        );
        Ok(Self {
            listener,
            recorder,
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            max_frame_bytes: config.max_frame_bytes.max(1),
            stats: Arc::new(IngestStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Run the accept loop on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept connections forever
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::CONNECTIONS_REJECTED.inc();
                warn!(%peer, "Connection limit reached, closing connection");
                drop(stream);
                continue;
            };

            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            let connection = Connection {
                peer,
                recorder: self.recorder.clone(),
                decoder: FrameDecoder::new(self.max_frame_bytes),
                stats: self.stats.clone(),
            };
            tokio::spawn(async move {
                connection.serve(stream).await;
                drop(permit);
            });
        }
    }
}

/// Keeps the active-connection count honest on every exit path
struct ActiveGuard(Arc<IngestStats>);

impl ActiveGuard {
    fn new(stats: Arc<IngestStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        metrics::CONNECTIONS_ACTIVE.inc();
        Self(stats)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
        metrics::CONNECTIONS_ACTIVE.dec();
    }
}

struct Connection {
    peer: SocketAddr,
    recorder: Arc<Recorder>,
    decoder: FrameDecoder,
    stats: Arc<IngestStats>,
}

impl Connection {
    async fn serve(mut self, mut stream: TcpStream) {
        let _active = ActiveGuard::new(self.stats.clone());
        debug!(peer = %self.peer, "Sensor connected");

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            match stream.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let batch = self.drain(&mut buf);
                    self.forward(batch).await;
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Read failed, closing connection");
                    break;
                }
            }
        }

        if !buf.is_empty() {
            debug!(peer = %self.peer, bytes = buf.len(), "Discarding unterminated frame");
        }
        debug!(peer = %self.peer, "Sensor disconnected");
    }

    /// Decode every complete frame currently buffered, in arrival order
    fn drain(&mut self, buf: &mut BytesMut) -> Vec<Reading> {
        let mut batch = Vec::new();
        // FrameDecoder never fails; an error here would only mean "stop"
        while let Ok(Some(frame)) = self.decoder.decode(buf) {
            batch.extend(self.decode(frame));
        }
        batch
    }

    fn decode(&self, frame: Frame) -> Option<Reading> {
        let mut line = match frame {
            Frame::Line(line) if line.iter().all(u8::is_ascii_whitespace) => return None,
            Frame::Line(line) => line,
            Frame::Oversized => {
                self.count_frame();
                self.count_malformed();
                debug!(peer = %self.peer, "Dropped oversized frame");
                return None;
            }
        };
        self.count_frame();

        match decode_reading(&mut line) {
            Ok(reading) => Some(reading),
            Err(e) => {
                self.count_malformed();
                debug!(peer = %self.peer, error = %e, "Dropped malformed frame");
                None
            }
        }
    }

    /// Append a batch on the blocking pool; awaited before the next read so
    /// per-connection order holds
    async fn forward(&self, batch: Vec<Reading>) {
        if batch.is_empty() {
            return;
        }
        let recorder = self.recorder.clone();
        let outcomes = tokio::task::spawn_blocking(move || {
            batch
                .into_iter()
                .map(|reading| recorder.append(reading))
                .collect::<Vec<_>>()
        })
        .await;

        match outcomes {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome {
                        AppendOutcome::Written => {
                            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                        AppendOutcome::NoSession => {
                            self.stats.dropped_no_session.fetch_add(1, Ordering::Relaxed);
                        }
                        AppendOutcome::Failed => {}
                    }
                }
            }
            Err(e) => warn!(peer = %self.peer, error = %e, "Append task failed"),
        }
    }

    fn count_frame(&self) {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        metrics::FRAMES_TOTAL.inc();
    }

    fn count_malformed(&self) {
        self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        metrics::FRAMES_MALFORMED.inc();
    }
}

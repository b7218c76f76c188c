//! Process-wide Prometheus metrics
//!
//! Components keep their own atomic stats for status reporting and tests;
//! these counters mirror them for scraping via `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid counter definition");
    // Registration only fails on duplicate names, which the statics rule out.
    let _ = prometheus::register(Box::new(c.clone()));
    c
}

pub static FRAMES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("testbed_frames_total", "Frames received by the ingestion server"));

pub static FRAMES_MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "testbed_frames_malformed_total",
        "Frames dropped because they failed to decode",
    )
});

pub static RECORDS_WRITTEN: Lazy<IntCounter> =
    Lazy::new(|| counter("testbed_records_written_total", "Records appended to a run log"));

pub static RECORDS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "testbed_records_dropped_total",
        "Decoded records discarded because no session was open",
    )
});

pub static CONNECTIONS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "testbed_connections_rejected_total",
        "Connections closed by the admission limit",
    )
});

pub static PRODUCER_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "testbed_producer_failures_total",
        "Producer sends that failed with a transport error",
    )
});

pub static TICKS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("testbed_ticks_total", "Orchestration loop iterations"));

pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("testbed_connections_active", "Open ingestion connections")
        .expect("valid gauge definition");
    let _ = prometheus::register(Box::new(g.clone()));
    g
});

/// Force registration so the first scrape lists every series
pub fn init() {
    let _ = &*FRAMES_TOTAL;
    let _ = &*FRAMES_MALFORMED;
    let _ = &*RECORDS_WRITTEN;
    let _ = &*RECORDS_DROPPED;
    let _ = &*CONNECTIONS_REJECTED;
    let _ = &*PRODUCER_FAILURES;
    let _ = &*TICKS_TOTAL;
    let _ = &*CONNECTIONS_ACTIVE;
}

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

//! sensor_load - ingestion load generator
//!
//! Opens many concurrent sensor connections and streams random readings at
//! the ingestion port, reporting frames per second once a second.
//!
//! Usage:
//!   sensor_load --target 127.0.0.1:9000 --connections 64 --duration 30

use clap::Parser;
use iot_testbed::codec::{Reading, encode_frame};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time;

const SENSORS: [&str; 3] = ["network", "auth", "device"];

#[derive(Parser)]
#[command(name = "sensor_load")]
#[command(about = "Hammer the testbed ingestion port with synthetic sensor frames")]
struct Cli {
    /// Ingestion address
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    target: String,

    /// Concurrent sensor connections
    #[arg(short, long, default_value = "64")]
    connections: usize,

    /// Test length in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Frames written per batch
    #[arg(long, default_value = "50")]
    batch: usize,

    /// Fraction of frames deliberately corrupted (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    garbage: f64,
}

fn random_reading() -> Reading {
    let sensor = SENSORS[fastrand::usize(..SENSORS.len())];
    let mut values = Map::new();
    values.insert("value".to_string(), json!(fastrand::f64() * 1000.0));
    values.insert("seq".to_string(), json!(fastrand::u32(0..1_000_000)));
    values.insert("event".to_string(), Value::String("Normal".to_string()));
    Reading::new(sensor, values)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let run_for = Duration::from_secs(cli.duration);

    println!("Sensor load generator initializing...");
    println!("Target: {} (Batch Size: {})", cli.target, cli.batch);
    println!("Connections: {}", cli.connections);

    let sent = Arc::new(AtomicUsize::new(0));
    let failed_connections = Arc::new(AtomicUsize::new(0));
    let start_time = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..cli.connections {
        let target = cli.target.clone();
        let sent = sent.clone();
        let failed_connections = failed_connections.clone();
        let batch = cli.batch.max(1);
        let garbage = cli.garbage;

        handles.push(tokio::spawn(async move {
            let mut stream = match TcpStream::connect(&target).await {
                Ok(stream) => stream,
                Err(_) => {
                    failed_connections.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            let _ = stream.set_nodelay(true);

            let mut buf = Vec::with_capacity(batch * 128);
            while start_time.elapsed() < run_for {
                buf.clear();
                for _ in 0..batch {
                    if fastrand::f64() < garbage {
                        buf.extend_from_slice(b"{\"sensor\": broken\n");
                        continue;
                    }
                    match encode_frame(&random_reading()) {
                        Ok(frame) => buf.extend_from_slice(&frame),
                        Err(_) => continue,
                    }
                }
                if stream.write_all(&buf).await.is_err() {
                    failed_connections.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                sent.fetch_add(batch, Ordering::Relaxed);
            }
        }));
    }

    // Monitor loop
    let monitor_sent = sent.clone();
    let monitor = tokio::spawn(async move {
        let mut last_count = 0;
        loop {
            time::sleep(Duration::from_secs(1)).await;
            let current = monitor_sent.load(Ordering::Relaxed);
            let fps = current - last_count;
            last_count = current;

            let elapsed = start_time.elapsed().as_secs();
            println!("[{:02}s] FPS: {:<8} | Total: {}", elapsed, fps, current);

            if start_time.elapsed() >= run_for {
                break;
            }
        }
    });

    for h in handles {
        let _ = h.await;
    }
    let _ = monitor.await;

    let duration = start_time.elapsed();
    let total = sent.load(Ordering::SeqCst);
    let failed = failed_connections.load(Ordering::SeqCst);

    println!("\n=== Final Load Report ===");
    println!("Frames written:        {}", total);
    println!("Failed connections:    {}", failed);
    println!("Actual duration:       {:.2?}", duration);
    println!(
        "Average throughput:    {:.0} FPS",
        total as f64 / duration.as_secs_f64()
    );
}

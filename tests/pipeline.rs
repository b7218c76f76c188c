use iot_testbed::config::IngestConfig;
use iot_testbed::scenario::ManualClock;
use iot_testbed::{
    IngestServer, Recorder, Scenario, SensorFactory, TestbedController, TestbedError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

async fn start_ingest(recorder: Arc<Recorder>) -> SocketAddr {
    let config = IngestConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_connections: 256,
        ..IngestConfig::default()
    };
    let server = IngestServer::bind(&config, recorder).await.unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn();
    addr
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn read_log(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_preserve_order() {
    const CONNECTIONS: usize = 16;
    const FRAMES: usize = 100;

    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::new(dir.path()));
    let session = recorder.open().unwrap();
    let addr = start_ingest(recorder.clone()).await;

    let mut tasks = Vec::new();
    for conn in 0..CONNECTIONS {
        tasks.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for seq in 0..FRAMES {
                let frame = format!(
                    "{{\"sensor\":\"sensor-{}\",\"values\":{{\"seq\":{}}}}}\n",
                    conn, seq
                );
                stream.write_all(frame.as_bytes()).await.unwrap();
            }
            stream.flush().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_until(|| recorder.stats().written == (CONNECTIONS * FRAMES) as u64).await;
    let summary = recorder.close(session.id).unwrap();
    assert_eq!(summary.records_written, (CONNECTIONS * FRAMES) as u64);

    let records = read_log(&session.path);
    assert_eq!(records.len(), CONNECTIONS * FRAMES);

    let opened = session.opened_at.timestamp();
    let mut per_sensor: HashMap<String, Vec<u64>> = HashMap::new();
    for record in &records {
        assert!(record["timestamp"].as_i64().unwrap() >= opened);
        per_sensor
            .entry(record["sensor"].as_str().unwrap().to_string())
            .or_default()
            .push(record["values"]["seq"].as_u64().unwrap());
    }

    assert_eq!(per_sensor.len(), CONNECTIONS);
    for (sensor, seqs) in per_sensor {
        let expected: Vec<u64> = (0..FRAMES as u64).collect();
        assert_eq!(seqs, expected, "out of order frames from {}", sensor);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frames_never_reach_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::new(dir.path()));
    let session = recorder.open().unwrap();
    let addr = start_ingest(recorder.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"{\"sensor\":\"network\",\"values\":{\"packets\":1}}\n\
              {\"sensor\":\"\",\"values\":{}}\n\
              [1,2,3]\n\
              {\"values\":{}}\n\
              {\"sensor\":\"network\",\"values\":{\"packets\":2}}\n",
        )
        .await
        .unwrap();

    wait_until(|| recorder.stats().written == 2).await;
    recorder.close(session.id);

    let packets: Vec<u64> = read_log(&session.path)
        .iter()
        .map(|r| r["values"]["packets"].as_u64().unwrap())
        .collect();
    assert_eq!(packets, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_controller_drives_sensors_into_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::new(dir.path()));
    let addr = start_ingest(recorder.clone()).await;

    let factory = SensorFactory::new(
        addr.to_string(),
        vec!["network".into(), "auth".into(), "device".into()],
        Duration::from_secs(1),
    );
    let clock = ManualClock::new();
    let controller = Arc::new(TestbedController::with_clock(
        recorder.clone(),
        Arc::new(factory),
        Duration::from_millis(20),
        Arc::new(clock.clone()),
    ));

    let scenario: Scenario = r#"{"duration_seconds": 2, "phases": [
        {"start": 0, "end": 1, "network": "ddos", "auth": "bruteforce"}
    ]}"#
    .parse()
    .unwrap();

    controller.start(scenario.clone(), "pipeline").unwrap();
    let session = recorder.current().unwrap();
    wait_until(|| recorder.stats().written >= 6).await;

    // Past the scenario end the loop finishes by itself
    clock.advance(Duration::from_secs(2));
    let waiter = controller.clone();
    let idle = tokio::task::spawn_blocking(move || waiter.wait(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(idle);
    assert!(!controller.is_running());
    assert!(!recorder.is_open());
    assert!(matches!(controller.stop(), Err(TestbedError::NotRunning)));

    let records = read_log(&session.path);
    let events: Vec<(&str, &str)> = records
        .iter()
        .map(|r| {
            (
                r["sensor"].as_str().unwrap(),
                r["values"]["event"].as_str().unwrap(),
            )
        })
        .collect();
    assert!(events.contains(&("network", "DDoS Attack")));
    assert!(events.contains(&("auth", "Bruteforce Attack")));
    assert!(events.contains(&("device", "Normal")));

    // A fresh run gets a fresh log
    controller.start(scenario, "pipeline-again").unwrap();
    let second = recorder.current().unwrap();
    assert_ne!(second.path, session.path);
    let stopper = controller.clone();
    let report = tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.session.unwrap().info.path, second.path);
}

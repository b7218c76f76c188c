//! Simulated Sensor Payloads
//!
//! Each sensor produces a baseline signal (slow sine wave plus noise) and
//! applies a per-mode distortion when the scenario puts its subsystem under
//! attack. Every payload carries an `event` label naming the active mode.
//!
//! | Sensor  | Modes                                                                      |
//! |---------|----------------------------------------------------------------------------|
//! | network | `ddos`, `slowloris`, `portscan`, `exfiltration`, `botnet`                  |
//! | auth    | `bruteforce`, `credential_stuffing`, `password_spray`, `session_hijack`, `admin_abuse` |
//! | device  | `system_stress`, `crypto_mining`, `memory_leak`, `disk_flood`, `fork_bomb` |
//!
//! Unknown modes (including `normal`) yield baseline traffic.

use super::PayloadGenerator;
use rand::Rng;
use serde_json::{Map, Value, json};
use std::f64::consts::TAU;

const NORMAL_EVENT: &str = "Normal";

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn payload(fields: Vec<(&str, Value)>) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Create the generator for a subsystem name
pub fn generator_for(subsystem: &str) -> Option<Box<dyn PayloadGenerator>> {
    match subsystem {
        "network" => Some(Box::new(NetworkSensor::new())),
        "auth" => Some(Box::new(AuthSensor::new())),
        "device" => Some(Box::new(DeviceSensor::new())),
        _ => None,
    }
}

// --- 1. Network traffic ---

/// (packets x, throughput x, latency x, loss +, event)
fn network_profile(mode: &str) -> Option<(i64, f64, f64, f64, &'static str)> {
    match mode {
        "ddos" => Some((15, 15.0, 2.5, 0.30, "DDoS Attack")),
        "slowloris" => Some((4, 2.0, 4.0, 0.08, "Slowloris Attack")),
        "portscan" => Some((5, 3.0, 1.8, 0.05, "Port Scan")),
        "exfiltration" => Some((8, 12.0, 1.4, 0.0, "Data Exfiltration")),
        "botnet" => Some((3, 2.0, 1.2, 0.0, "Botnet Probe")),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct NetworkSensor {
    t: u64,
}

impl NetworkSensor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadGenerator for NetworkSensor {
    fn generate(&mut self, mode: &str) -> Map<String, Value> {
        let mut rng = rand::rng();
        self.t += 1;

        let base = 60.0 + 8.0 * (TAU * self.t as f64 / 300.0).sin();
        let mut packets = ((base + rng.random_range(-2.0..2.0)) as i64).max(1);
        let mut throughput = packets as f64 * 600.0 * 8.0 / 1000.0;
        let mut latency =
            20.0 + (packets as f64 / 100.0).powf(1.5) + rng.random_range(0.0..2.0);
        let mut loss = (0.01 + packets as f64 / 8000.0).min(0.5);
        let mut event = NORMAL_EVENT;

        if let Some((p, tp, lat, extra_loss, label)) = network_profile(mode) {
            packets *= p;
            throughput *= tp;
            latency *= lat;
            loss += extra_loss;
            event = label;
        }

        payload(vec![
            ("packets", json!(packets)),
            ("throughput_kbps", json!(round_to(throughput, 2))),
            ("latency_ms", json!(round_to(latency, 2))),
            ("packet_loss", json!(round_to(loss.min(1.0), 3))),
            ("event", json!(event)),
        ])
    }
}

// --- 2. Authentication ---

/// (attempts x, success rate, event)
fn auth_profile(mode: &str) -> Option<(i64, f64, &'static str)> {
    match mode {
        "bruteforce" => Some((30, 0.05, "Bruteforce Attack")),
        "credential_stuffing" => Some((25, 0.10, "Credential Stuffing")),
        "password_spray" => Some((20, 0.15, "Password Spray")),
        "session_hijack" => Some((10, 0.90, "Session Hijacking")),
        "admin_abuse" => Some((15, 0.30, "Suspicious Admin Access")),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct AuthSensor {
    t: u64,
}

impl AuthSensor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadGenerator for AuthSensor {
    fn generate(&mut self, mode: &str) -> Map<String, Value> {
        let mut rng = rand::rng();
        self.t += 1;

        let base = 2.0 + 1.2 * (TAU * self.t as f64 / 200.0).sin();
        let mut attempts = ((base + rng.random_range(-0.5..0.5)) as i64).max(1);
        let mut success_rate = 0.85;
        let mut event = NORMAL_EVENT;

        if let Some((mult, rate, label)) = auth_profile(mode) {
            attempts *= mult;
            success_rate = rate;
            event = label;
        }

        let success = (attempts as f64 * success_rate) as i64;

        payload(vec![
            ("login_attempts", json!(attempts)),
            ("successful_logins", json!(success)),
            ("failed_logins", json!(attempts - success)),
            ("event", json!(event)),
        ])
    }
}

// --- 3. Host device ---

#[derive(Debug, Default)]
pub struct DeviceSensor {
    t: u64,
    /// Accumulated leak, grows while in `memory_leak` mode
    mem_leak: f64,
}

impl DeviceSensor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadGenerator for DeviceSensor {
    fn generate(&mut self, mode: &str) -> Map<String, Value> {
        let mut rng = rand::rng();
        self.t += 1;

        let t = self.t as f64;
        let mut cpu = 35.0 + 10.0 * (TAU * t / 180.0).sin();
        let mut mem = 55.0 + 5.0 * (TAU * t / 240.0).sin();
        let mut disk = 8.0 + rng.random_range(0.0..4.0);
        let mut procs: i64 = 80 + rng.random_range(-5..=5);
        let mut event = NORMAL_EVENT;

        match mode {
            "system_stress" => {
                cpu += 35.0;
                mem += 20.0;
                procs += 40;
                event = "System Stress";
            }
            "crypto_mining" => {
                cpu = rng.random_range(85.0..95.0);
                mem += 10.0;
                disk = rng.random_range(2.0..5.0);
                event = "Crypto Mining Malware";
            }
            "memory_leak" => {
                self.mem_leak += rng.random_range(0.8..1.5);
                mem += self.mem_leak;
                event = "Memory Leak";
            }
            "disk_flood" => {
                disk *= 10.0;
                procs += 20;
                event = "Disk Flood";
            }
            "fork_bomb" => {
                procs *= 4;
                cpu += 20.0;
                event = "Fork Bomb";
            }
            _ => {}
        }

        payload(vec![
            ("cpu_usage_pct", json!(round_to(cpu.min(100.0), 1))),
            ("memory_usage_pct", json!(round_to(mem.min(100.0), 1))),
            ("disk_io_mb", json!(round_to(disk, 2))),
            ("process_count", json!(procs)),
            ("event", json!(event)),
        ])
    }
}

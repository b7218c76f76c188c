//! Testbed configuration
//!
//! Every field has a default, so an empty `{}` file (or no file at all) gives
//! a working local setup: ingestion on port 9000, control API on port 5000,
//! run logs under `data/testbed`.

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{Result, TestbedError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    pub ingest: IngestConfig,
    pub control: ControlConfig,
    pub run: RunConfig,
    pub logging: LoggingConfig,
}

/// Ingestion server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// TCP bind address for sensor connections
    pub bind_addr: String,
    /// Concurrent connections admitted before new ones are closed
    pub max_connections: usize,
    /// Longest accepted frame, terminator excluded
    pub max_frame_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_connections: 1024,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Control API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// HTTP bind address
    pub bind_addr: String,
    /// Where uploaded scenarios are stored
    pub scenario_dir: PathBuf,
    /// Scenario used when a start request names none
    pub default_scenario: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            scenario_dir: PathBuf::from("scenarios"),
            default_scenario: PathBuf::from("scenarios/default_scenario.json"),
        }
    }
}

/// Per-run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Directory holding one `.jsonl` file per run
    pub data_dir: PathBuf,
    /// Orchestration tick
    pub tick_interval_ms: u64,
    /// Address the simulated sensors connect to
    pub sensor_target: String,
    /// Subsystems driven by the orchestrator, one sensor each
    pub sensors: Vec<String>,
    pub connect_timeout_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/testbed"),
            tick_interval_ms: 1000,
            sensor_target: "127.0.0.1:9000".to_string(),
            sensors: vec![
                "network".to_string(),
                "auth".to_string(),
                "device".to_string(),
            ],
            connect_timeout_ms: 2000,
        }
    }
}

impl RunConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Parsed level, falling back to INFO on an unknown name
    pub fn max_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

impl TestbedConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|source| TestbedError::InvalidConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Apply `PORT` to the control API bind address
    pub fn apply_env(&mut self) {
        if let Some(port) = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            self.control.bind_addr = with_port(&self.control.bind_addr, port);
        }
    }
}

fn with_port(addr: &str, port: u16) -> String {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    format!("{}:{}", host, port)
}

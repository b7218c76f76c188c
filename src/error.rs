//! Error types for the testbed

use std::path::PathBuf;

/// Result type alias
pub type Result<T> = std::result::Result<T, TestbedError>;

/// Testbed error types
#[derive(Debug, thiserror::Error)]
pub enum TestbedError {
    /// A run is already active
    #[error("Testbed already running")]
    AlreadyRunning,

    /// No run is active
    #[error("Testbed not running")]
    NotRunning,

    /// A logging session is already open
    #[error("Logging session already open: {0}")]
    SessionAlreadyOpen(PathBuf),

    /// Scenario source does not exist
    #[error("Scenario file not found: {0}")]
    ScenarioNotFound(PathBuf),

    /// Archived run log does not exist
    #[error("Run log not found: {0}")]
    RunNotFound(PathBuf),

    /// Scenario source exists but cannot be parsed
    #[error("Invalid scenario {path}: {source}")]
    InvalidScenario {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file cannot be parsed
    #[error("Invalid configuration {path}: {source}")]
    InvalidConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Producer failed to deliver a payload
    #[error("Transport error ({subsystem}): {source}")]
    Transport {
        subsystem: String,
        #[source]
        source: std::io::Error,
    },

    /// Request rejected before reaching the core
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TestbedError {
    /// Stable identifier reported by the control API.
    pub fn code(&self) -> &'static str {
        match self {
            TestbedError::AlreadyRunning => "already_running",
            TestbedError::NotRunning => "not_running",
            TestbedError::SessionAlreadyOpen(_) => "session_open",
            TestbedError::ScenarioNotFound(_) | TestbedError::RunNotFound(_) => "not_found",
            TestbedError::InvalidScenario { .. } => "invalid_scenario",
            TestbedError::InvalidConfig { .. } => "invalid_config",
            TestbedError::Transport { .. } => "transport",
            TestbedError::InvalidRequest(_) => "invalid_request",
            TestbedError::Io(_) => "io",
            TestbedError::Json(_) => "json",
        }
    }
}

//! HTTP Control API
//!
//! Thin JSON surface over the [`TestbedController`] and the run archive:
//!
//! | Method | Path                    | Body                       |
//! |--------|-------------------------|----------------------------|
//! | POST   | `/api/testbed/start`    | `{scenario_path?}`         |
//! | POST   | `/api/testbed/stop`     |                            |
//! | GET    | `/api/testbed/status`   |                            |
//! | POST   | `/api/scenario/upload`  | `{filename, scenario}`     |
//! | GET    | `/api/testbed/files`    |                            |
//! | POST   | `/api/testbed/load`     | `{path}`                   |
//! | GET    | `/metrics`              |                            |
//! | GET    | `/health`               |                            |
//!
//! Every `/api` reply is an [`ApiResponse`]; failures carry the stable
//! [`TestbedError::code`] next to the message.

use crate::archive;
use crate::config::ControlConfig;
use crate::controller::{RunId, TestbedController};
use crate::error::{Result, TestbedError};
use crate::metrics;
use crate::scenario::Scenario;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TestbedController>,
    pub control: Arc<ControlConfig>,
}

impl AppState {
    pub fn new(controller: Arc<TestbedController>, control: ControlConfig) -> Self {
        Self {
            controller,
            control: Arc::new(control),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/testbed/start", post(start))
        .route("/api/testbed/stop", post(stop))
        .route("/api/testbed/status", get(status))
        .route("/api/scenario/upload", post(upload))
        .route("/api/testbed/files", get(files))
        .route("/api/testbed/load", post(load))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Generic API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn failure(err: &TestbedError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub scenario_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub run_id: RunId,
    pub scenario: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub scenario: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub path: PathBuf,
    /// Non-fatal problems found while validating
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub path: PathBuf,
}

// ============================================================================
// Extractor
// ============================================================================

/// JSON body parsed with simd-json; an empty body deserializes from `{}`
pub struct SimdJson<T>(pub T);

impl<S, T> FromRequest<S> for SimdJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| e.into_response())?;
        let mut body = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"{}".to_vec()
        } else {
            bytes.to_vec()
        };

        simd_json::from_slice::<T>(&mut body)
            .map(SimdJson)
            .map_err(|e| failure(TestbedError::InvalidRequest(format!("invalid JSON body: {}", e))))
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn start(State(state): State<AppState>, SimdJson(req): SimdJson<StartRequest>) -> Response {
    let path = req
        .scenario_path
        .unwrap_or_else(|| state.control.default_scenario.clone());
    let controller = state.controller.clone();
    let scenario = path.clone();

    let result = blocking(move || controller.start_from_path(&scenario)).await;
    respond(result.map(|run_id| {
        info!(run = %run_id, scenario = %path.display(), "Run started via API");
        StartResponse {
            run_id,
            scenario: path,
        }
    }))
}

async fn stop(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    respond(blocking(move || controller.stop()).await)
}

async fn status(State(state): State<AppState>) -> Response {
    // The run slot lock is held across a stop's join
    let controller = state.controller.clone();
    respond(blocking(move || Ok(controller.status())).await)
}

async fn upload(State(state): State<AppState>, SimdJson(req): SimdJson<UploadRequest>) -> Response {
    let dir = state.control.scenario_dir.clone();
    respond(blocking(move || save_scenario(&dir, req)).await)
}

async fn files(State(state): State<AppState>) -> Response {
    let data_dir = state.controller.recorder().data_dir().to_path_buf();
    respond(blocking(move || archive::list_runs(&data_dir)).await)
}

async fn load(State(state): State<AppState>, SimdJson(req): SimdJson<LoadRequest>) -> Response {
    let data_dir = state.controller.recorder().data_dir().to_path_buf();
    respond(blocking(move || archive::load_run(&data_dir, &req.path)).await)
}

async fn metrics_handler() -> String {
    metrics::render()
}

// ============================================================================
// Helpers
// ============================================================================

/// Validate an uploaded scenario and store it under `dir`
fn save_scenario(dir: &Path, req: UploadRequest) -> Result<UploadResponse> {
    // Only the final component is honoured
    let name = Path::new(&req.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.starts_with('.'))
        .ok_or_else(|| TestbedError::InvalidRequest(format!("bad filename: {:?}", req.filename)))?;
    let name = if name.ends_with(".json") {
        name.to_string()
    } else {
        format!("{}.json", name)
    };
    let path = dir.join(name);

    let scenario: Scenario =
        serde_json::from_value(req.scenario.clone()).map_err(|source| {
            TestbedError::InvalidScenario {
                path: path.clone(),
                source,
            }
        })?;
    let issues: Vec<String> = scenario.validate().iter().map(ToString::to_string).collect();

    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, serde_json::to_vec_pretty(&req.scenario)?)?;
    info!(path = %path.display(), issues = issues.len(), "Scenario uploaded");

    Ok(UploadResponse { path, issues })
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TestbedError::Io(std::io::Error::other(e)))?
}

fn status_for(err: &TestbedError) -> StatusCode {
    match err {
        TestbedError::AlreadyRunning
        | TestbedError::NotRunning
        | TestbedError::SessionAlreadyOpen(_) => StatusCode::CONFLICT,
        TestbedError::ScenarioNotFound(_) | TestbedError::RunNotFound(_) => StatusCode::NOT_FOUND,
        TestbedError::InvalidScenario { .. }
        | TestbedError::InvalidConfig { .. }
        | TestbedError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        TestbedError::Transport { .. } => StatusCode::BAD_GATEWAY,
        TestbedError::Io(_) | TestbedError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: TestbedError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(code = err.code(), error = %err, "Request failed");
    }
    (status, Json(ApiResponse::<()>::failure(&err))).into_response()
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(err) => failure(err),
    }
}

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, FleetError, SubmitError};
use crate::fleet::{Dimension, StationStats};
use crate::orchestrator::Orchestrator;
use crate::queue::{Idea, Priority, QueueStats};
use crate::session::PoolStatus;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitIdeaRequest {
    pub identity: String,
    pub text: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, alias = "revision")]
    pub revision_number: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitIdeaResponse {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct FocusRequest {
    /// `null` clears the focus.
    #[serde(default)]
    pub dimension: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DimensionsRequest {
    pub dimensions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedApp {
    pub app_id: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedApp {
    pub app_id: String,
    pub was_running: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub sessions: PoolStatus,
    pub fleet: StationStats,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    TooManyRequests(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::QueueFull { .. } => ApiError::TooManyRequests(e.to_string()),
            SubmitError::DuplicateInFlight { .. } => ApiError::Conflict(e.to_string()),
            SubmitError::EmptyIdentity => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::NotFound(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        match e {
            FleetError::AlreadyRunning(_) => ApiError::Conflict(e.to_string()),
            FleetError::ConcurrencyLimit { .. } => ApiError::TooManyRequests(e.to_string()),
            FleetError::UnknownApp(_) => ApiError::NotFound(e.to_string()),
            FleetError::NoDimensions => ApiError::BadRequest(e.to_string()),
            FleetError::ControllerStopped => ApiError::Unavailable(e.to_string()),
        }
    }
}

fn parse_dimension(raw: &str) -> Result<Dimension, ApiError> {
    Dimension::from_str(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/api/tasks", get(list_tasks))
        .route("/api/ideas", post(submit_idea))
        .route("/api/apps", get(list_apps))
        .route("/api/apps/start-all", post(start_all_apps))
        .route("/api/apps/stop-all", post(stop_all_apps))
        .route("/api/apps/{id}/start", post(start_app))
        .route("/api/apps/{id}/stop", post(stop_app))
        .route("/api/apps/{id}/iterate", get(get_iteration))
        .route("/api/apps/{id}/iterate/start", post(start_iteration))
        .route("/api/apps/{id}/iterate/stop", post(stop_iteration))
        .route("/api/apps/{id}/iterate/focus", put(set_focus))
        .route("/api/apps/{id}/iterate/dimensions", put(update_dimensions))
        .route("/api/sessions", get(session_status))
        .route("/api/fleet", get(fleet_status))
        .route("/api/fleet/stop-all", post(stop_all_iterations))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = &state.orchestrator;
    let fleet = orchestrator.fleet_status().await?.stats;
    Ok(Json(StatsResponse {
        queue: orchestrator.queue_stats(),
        sessions: orchestrator.session_status(),
        fleet,
    }))
}

async fn list_tasks(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.list_tasks())
}

async fn submit_idea(
    State(state): State<SharedState>,
    Json(req): Json<SubmitIdeaRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("Idea text must not be empty".to_string()));
    }
    let mut idea = Idea::new(req.identity, req.text, req.priority);
    if let Some(revision) = req.revision_number {
        idea = idea.with_revision(revision);
    }
    let task_id = state.orchestrator.submit_idea(idea)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitIdeaResponse { task_id })))
}

async fn list_apps(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.list_applications())
}

async fn start_app(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let port = state.orchestrator.start_application(&app_id).await?;
    Ok(Json(StartedApp { app_id, port }))
}

async fn stop_app(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let was_running = state.orchestrator.stop_application(&app_id).await?;
    Ok(Json(StoppedApp { app_id, was_running }))
}

async fn start_all_apps(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.start_all_apps().await)
}

async fn stop_all_apps(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.stop_all_apps().await)
}

async fn get_iteration(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.iteration_state(&app_id).await? {
        Some(loop_state) => Ok(Json(loop_state)),
        None => Err(ApiError::NotFound(format!("No iteration loop for {}", app_id))),
    }
}

async fn start_iteration(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.start_iteration(&app_id).await?))
}

async fn stop_iteration(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.stop_iteration(&app_id).await?))
}

async fn set_focus(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
    Json(req): Json<FocusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let focus = req.dimension.as_deref().map(parse_dimension).transpose()?;
    Ok(Json(state.orchestrator.set_focus_dimension(&app_id, focus).await?))
}

async fn update_dimensions(
    State(state): State<SharedState>,
    Path(app_id): Path<String>,
    Json(req): Json<DimensionsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let dimensions = req
        .dimensions
        .iter()
        .map(|d| parse_dimension(d))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(state.orchestrator.update_dimensions(&app_id, dimensions).await?))
}

async fn session_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.session_status())
}

async fn fleet_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.fleet_status().await?))
}

async fn stop_all_iterations(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stopped = state.orchestrator.stop_all_iterations().await?;
    Ok(Json(serde_json::json!({ "stopped": stopped })))
}

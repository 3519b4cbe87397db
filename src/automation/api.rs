use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::{error, info, warn};

use super::engine::Engine;
use super::models::{CreateOrchestrationBody, TaskRequestBody};
use crate::errors::AutomationError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Engine,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<AutomationError> for ApiError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            e @ AutomationError::OrchestrationStillRunning { .. } => ApiError::Conflict(e.to_string()),
            e => {
                error!(error = %e, fatal = e.is_fatal(), "request failed");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/automation/run", post(run_automation))
        .route("/automation/reset", post(reset_automation))
        .route("/automation/orchestration", post(create_orchestration))
        .route("/automation/orchestration/stop", post(stop_orchestration))
        .route("/automation/task", post(run_task))
        .route("/automation/status", get(status))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn run_automation(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.engine.manager.run_automation().await?;
    Ok(Json(report))
}

async fn reset_automation(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.engine.orchestrator.delete_automation().await?;
    Ok(Json(report))
}

async fn create_orchestration(
    State(state): State<SharedState>,
    body: Result<Json<CreateOrchestrationBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let params = body.validate()?;
    let run = state
        .engine
        .orchestrator
        .create_orchestration(params)
        .await
        .inspect_err(|e| warn!(error = %e, "orchestration rejected"))?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn stop_orchestration(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let run = state.engine.orchestrator.stop_orchestration().await?;
    Ok(Json(run))
}

async fn run_task(
    State(state): State<SharedState>,
    body: Result<Json<TaskRequestBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let request = body.validate()?;
    let report = state.engine.executor.run_task(&request).await?;
    info!(
        account = %request.billing_account_id,
        version = request.version,
        iteration = request.iteration,
        ?report,
        "task request handled"
    );
    Ok(Json(report))
}

async fn status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.status().await?))
}

// ── Tests ─────────────────────────────────────────────────────────────

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

use flowrun_core::{ExecutionDetail, FlowError, JobId, StartedExecution};
use flowrun_engine::StartRequest;

use crate::connection;
use crate::state::AppState;

/// Service error rendered as `{"error", "kind"}` with a matching status.
pub struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            FlowError::NotFound(_) => StatusCode::NOT_FOUND,
            FlowError::InvalidInput(_) | FlowError::Json(_) => StatusCode::BAD_REQUEST,
            FlowError::Conflict(_) => StatusCode::CONFLICT,
            FlowError::Graph { .. } | FlowError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_executions": state.service.active_count(),
    }))
}

// POST /api/flow-executions
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<StartedExecution>)> {
    let started = state.service.start_execution(body).await?;
    info!(
        execution_id = started.execution_id,
        job_id = %started.job_id,
        "Execution started via gateway"
    );
    Ok((StatusCode::CREATED, Json(started)))
}

// GET /api/flow-executions/:id
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ExecutionDetail>> {
    Ok(Json(state.service.get_execution(id).await?))
}

// GET /api/flow-executions/by-job/:job_id
pub async fn get_execution_by_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ExecutionDetail>> {
    let job_id = JobId::from_str(&job_id);
    Ok(Json(state.service.get_execution_by_job(&job_id).await?))
}

// GET /api/flow-executions/by-flow/:flow_id
pub async fn list_by_flow(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let executions = state.service.list_executions_by_flow(flow_id).await?;
    Ok(Json(serde_json::json!({
        "flow_id": flow_id,
        "executions": executions,
    })))
}

// POST /api/flow-executions/:id/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.service.cancel_execution(id).await?;
    Ok(Json(serde_json::json!({
        "execution_id": id,
        "status": status,
    })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    1000
}

// GET /api/flow-executions/:id/logs?limit=1000&offset=0
pub async fn execution_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let logs = state.service.history(id, q.limit, q.offset).await?;
    Ok(Json(serde_json::json!({
        "execution_id": id,
        "limit": q.limit,
        "offset": q.offset,
        "logs": logs,
    })))
}

// GET /api/logs/:job_id/count
pub async fn log_count(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = JobId::from_str(&job_id);
    let count = state.service.count_logs(&job_id).await?;
    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "count": count,
    })))
}

// GET /api/logs/:job_id/stream (WebSocket upgrade)
pub async fn stream_logs(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so no event falls in between
    let subscription = state.service.subscribe(&JobId::from_str(&job_id));
    ws.on_upgrade(move |socket| connection::stream_logs(socket, subscription))
}

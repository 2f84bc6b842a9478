//! REST endpoints under `/api`.
//!
//! Each handler is a thin wrapper over one engine operation. Engine errors become
//! `{"error": message}` bodies with a status derived from the error kind.

use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use overseer_core::OverseerError;
use overseer_orchestrator::{AgentConfig, Task, WorkspaceInfo};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// An engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub OverseerError);

impl From<OverseerError> for ApiError {
    fn from(e: OverseerError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            OverseerError::InvalidState { .. } => StatusCode::CONFLICT,
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "API request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct StartTask {
    #[serde(default)]
    pub worker_config: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceCount {
    pub count: usize,
}

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", delete(delete_task))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/stop", post(stop_task))
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route("/api/workspaces/count", put(set_workspace_count))
        .route("/api/workspaces/{id}", delete(delete_workspace))
        .route("/api/worker_configs", get(list_worker_configs))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Task>> {
    Json(state.engine.tasks())
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewTask>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state.engine.add_task(&body.description)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engine.delete_task(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<StartTask>,
) -> ApiResult<Json<Task>> {
    state.engine.start_task(id, &body.worker_config)?;
    Ok(Json(state.engine.task(id)?))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Task>> {
    state.engine.stop_task(id)?;
    Ok(Json(state.engine.task(id)?))
}

async fn list_workspaces(State(state): State<Arc<AppState>>) -> Json<Vec<WorkspaceInfo>> {
    Json(state.engine.workspaces())
}

async fn create_workspace(
    State(state): State<Arc<AppState>>,
) -> ApiResult<(StatusCode, Json<WorkspaceInfo>)> {
    let info = state.engine.create_workspace()?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn set_workspace_count(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WorkspaceCount>,
) -> ApiResult<Json<Vec<WorkspaceInfo>>> {
    state.engine.set_workspace_count(body.count)?;
    Ok(Json(state.engine.workspaces()))
}

async fn delete_workspace(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> ApiResult<StatusCode> {
    state.engine.delete_workspace(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_worker_configs(State(state): State<Arc<AppState>>) -> Json<Vec<AgentConfig>> {
    Json(state.engine.worker_configs())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (OverseerError::UnknownTask(Uuid::nil()), StatusCode::NOT_FOUND),
            (OverseerError::UnknownWorkspace(3), StatusCode::NOT_FOUND),
            (
                OverseerError::invalid_state("workspace", 0, "occupied", "delete"),
                StatusCode::CONFLICT,
            ),
            (OverseerError::MissingField("description"), StatusCode::BAD_REQUEST),
            (
                OverseerError::Worker("spawn failed".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}

//! HTTP ingestion API
//!
//! | Method | Path | 説明 |
//! |--------|------|------|
//! | POST | `/schedule` | タスクを受け付け `{taskId, status}` を返す |
//! | GET | `/tasks/{id}` | タスクの現在の状態 |
//! | GET | `/status` | status 別件数と index / queue の深さ |
//! | GET | `/healthz` | liveness |

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dueline_core::app::{App, Receipt, StatusView};
use dueline_core::domain::{
    ErrorKind, PipelineError, StoreError, Submission, Task, TaskId, TaskStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/schedule", post(schedule))
        .route("/tasks/{id}", get(task_status))
        .route("/status", get(pipeline_status))
        .route("/healthz", get(healthz))
        .with_state(app)
}

/// Body of `POST /schedule`. `execute_at` is also accepted as `executeAt`.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(alias = "executeAt")]
    pub execute_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub payload: Value,
    pub execute_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let payload = serde_json::from_slice(&task.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&task.payload).into_owned()));
        Self {
            id: task.id,
            task_type: task.task_type.as_str().to_string(),
            status: task.status,
            payload,
            execute_at: task.execute_at,
            created_at: task.created_at,
            updated_at: task.updated_at,
            attempts: task.attempts,
            last_error: task.last_error,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err.kind() {
            ErrorKind::Validation => Self::BadRequest(err.to_string()),
            _ => {
                tracing::error!(error = %err, "request failed");
                Self::Internal(err.to_string())
            }
        }
    }
}

async fn schedule(
    State(app): State<Arc<App>>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let payload =
        serde_json::to_vec(&req.payload).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let receipt = app
        .ingestor()
        .submit(Submission::new(req.task_type, payload, req.execute_at))
        .await?;
    Ok(Json(receipt))
}

async fn task_status(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let id = id
        .parse::<TaskId>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    match app.ingestor().status(id).await {
        Ok(task) => Ok(Json(task.into())),
        Err(StoreError::NotFound(_)) => Err(ApiError::NotFound(format!("task {id} not found"))),
        Err(e) => {
            tracing::error!(task_id = %id, error = %e, "status lookup failed");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

async fn pipeline_status(State(app): State<Arc<App>>) -> Result<Json<StatusView>, ApiError> {
    Ok(Json(app.status().await?))
}

async fn healthz() -> &'static str {
    "ok"
}

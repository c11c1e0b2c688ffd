//! Task routes: creation, polling, protocol edit and one-shot upload.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use protoscribe_core::TaskId;

use super::{ingestion_error_response, pipeline_error_response};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpdateProtocolRequest {
    pub new_protocol: String,
}

pub async fn create_task(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.create_task().await {
        Ok(task_id) => (StatusCode::CREATED, Json(json!({ "task_id": task_id }))),
        Err(e) => {
            tracing::error!(error = %e, "Task creation failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.reporter.report(TaskId(id)).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => pipeline_error_response(&e),
    }
}

pub async fn update_protocol(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProtocolRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .amend_protocol(TaskId(id), &req.new_protocol)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => pipeline_error_response(&e),
    }
}

pub async fn upload_audio(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> impl IntoResponse {
    let task_id = TaskId(id);
    match state.ingestion.ingest_whole(task_id, &body).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(json!({ "task_id": task_id, "status": outcome.to })),
        ),
        Err(e) => ingestion_error_response(&e),
    }
}

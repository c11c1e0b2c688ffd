//! HTTP surface.
//!
//! ```text
//! POST /api/tasks                   create a task
//! GET  /api/tasks/:id               poll status (protocols once finished)
//! PUT  /api/tasks/:id/protocol      edit the short protocol of a finished task
//! POST /api/tasks/:id/audio         one-shot audio upload (raw body)
//! GET  /ws?task_id=                 streamed audio capture
//! POST /callbacks/transcribe        transcription worker result
//! POST /callbacks/protocol          protocol worker result
//! POST /api/feedback                service rating
//! GET  /health
//! ```

mod callbacks;
mod feedback;
mod stream;
mod tasks;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use protoscribe_core::ingestion::IngestionError;
use protoscribe_core::PipelineError;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_limit = state.max_upload_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(tasks::create_task))
        .route("/api/tasks/:id", get(tasks::get_task))
        .route("/api/tasks/:id/protocol", put(tasks::update_protocol))
        .route(
            "/api/tasks/:id/audio",
            post(tasks::upload_audio).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/feedback", post(feedback::save_feedback))
        .route("/ws", get(stream::capture_stream))
        .route("/callbacks/transcribe", post(callbacks::transcribe_result))
        .route("/callbacks/protocol", post(callbacks::protocol_result))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Map a pipeline error onto an HTTP status for client-facing routes.
pub(crate) fn pipeline_error_response(err: &PipelineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        PipelineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::PreconditionMismatch { .. } => StatusCode::CONFLICT,
        PipelineError::UpstreamStageFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::StorageUploadFailed { .. }
        | PipelineError::PersistenceFailed { .. }
        | PipelineError::PublishFailed { .. }
        | PipelineError::ConnectivityExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

/// Map an ingestion refusal onto an HTTP status for the upload routes.
pub(crate) fn ingestion_error_response(
    err: &IngestionError,
) -> (StatusCode, Json<serde_json::Value>) {
    match err {
        IngestionError::Rejected(e) => pipeline_error_response(e),
        IngestionError::AlreadyCapturing(_) => {
            (StatusCode::CONFLICT, Json(json!({ "error": err.to_string() })))
        }
        IngestionError::TooLarge { .. } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": err.to_string() })),
        ),
    }
}

//! Stage-result callbacks from the transcription and protocol workers.
//!
//! The reply body is always `{"success": bool}`. HTTP 200 means the result
//! was consumed (applied or permanently discarded); HTTP 503 asks the worker
//! to deliver it again.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;

use protoscribe_core::receiver::{CallbackAck, CallbackReply};
use protoscribe_core::TaskId;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StageCallback {
    pub task_id: i64,
    pub success: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub async fn transcribe_result(
    State(state): State<AppState>,
    Json(body): Json<StageCallback>,
) -> impl IntoResponse {
    let ack = state
        .callbacks
        .on_transcribe_result(
            TaskId(body.task_id),
            body.success,
            body.result,
            body.error_message,
        )
        .await;
    reply(&ack)
}

pub async fn protocol_result(
    State(state): State<AppState>,
    Json(body): Json<StageCallback>,
) -> impl IntoResponse {
    let ack = state
        .callbacks
        .on_protocol_result(
            TaskId(body.task_id),
            body.success,
            body.result,
            body.error_message,
        )
        .await;
    reply(&ack)
}

fn reply(ack: &CallbackAck) -> (StatusCode, Json<CallbackReply>) {
    let status = if ack.is_acknowledged() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(CallbackReply::from(ack)))
}

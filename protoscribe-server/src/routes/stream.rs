//! WebSocket audio capture.
//!
//! The capture session is opened before the upgrade so a bad task id or a
//! second concurrent stream is refused with a plain HTTP status. After the
//! upgrade, binary frames are appended and text frames ignored. A close
//! frame or end of stream is a graceful close; a read error is abnormal.
//! Either way the collected audio is delivered, unless the stream went past
//! the upload limit, in which case the socket is closed with 1009 and
//! nothing is delivered.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use protoscribe_core::ingestion::{CaptureSession, StreamClose};
use protoscribe_core::TaskId;

use super::ingestion_error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub task_id: i64,
}

pub async fn capture_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let task_id = TaskId(params.task_id);
    let session = match state.ingestion.open(task_id).await {
        Ok(session) => session,
        Err(e) => return ingestion_error_response(&e).into_response(),
    };

    ws.on_upgrade(move |socket| run_capture(socket, session))
}

async fn run_capture(mut socket: WebSocket, mut session: CaptureSession) {
    let task_id = session.task_id();

    let close = loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(data))) => {
                if let Err(e) = session.push(&data) {
                    tracing::warn!(task_id = %task_id, error = %e, "Closing oversized capture stream");
                    let frame = CloseFrame {
                        code: close_code::SIZE,
                        reason: "audio exceeds upload limit".into(),
                    };
                    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                        tracing::debug!(task_id = %task_id, error = %e, "Close frame not sent");
                    }
                    session.abandon("audio exceeds upload limit");
                    return;
                }
            }
            Some(Ok(Message::Text(_))) => {
                tracing::debug!(task_id = %task_id, "Ignoring text frame on capture stream");
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break StreamClose::Graceful,
            Some(Err(e)) => break StreamClose::Abnormal(e.to_string()),
        }
    };

    match session.finish(close).await {
        Ok(outcome) => {
            tracing::info!(task_id = %task_id, status = %outcome.to, "Captured audio handed off");
        }
        Err(e) => {
            tracing::warn!(task_id = %task_id, error = %e, "Captured audio was not accepted");
        }
    }
}

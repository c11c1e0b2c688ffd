//! Stage request payloads published to the broker.
//!
//! These are the only wire format the pipeline owns. Field names are fixed
//! (`TaskId`, `AudioFileLink`, `TranscribedText`) because the transcription
//! and protocol workers decode them by name. `serde_json` never escapes `<`,
//! `>` or `&`, so transcript punctuation reaches the workers literally.

use serde::{Deserialize, Serialize};

use crate::types::TaskId;

/// Content type attached to every stage request.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Request for the transcription worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranscribeRequest {
    pub task_id: TaskId,
    pub audio_file_link: String,
}

/// Request for the protocol worker. The transcript travels inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProtocolRequest {
    pub task_id: TaskId,
    pub transcribed_text: String,
}

/// Serialize a stage request into a broker payload.
pub fn encode_payload<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

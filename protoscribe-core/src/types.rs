//! Core types for the task pipeline.
//!
//! Status values are persisted as plain strings (`as_str` / `parse`) so the
//! relational schema stays readable and the workers can log them verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Task identity ───────────────────────────────────────────────────────────

/// Opaque task identifier, assigned by the task store on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Task status ─────────────────────────────────────────────────────────────

/// Lifecycle status of a task.
///
/// Forward order: `None → Capturing → Transcribing → MakingProtocol → Finished`.
/// `Capturing` is optional (a one-shot upload skips it). `Failed` is terminal
/// and only reachable from a stage that reported `success = false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, nothing captured yet.
    #[default]
    None,
    /// A client stream is open and audio is being collected.
    Capturing,
    /// Audio persisted, transcription request published.
    Transcribing,
    /// Transcript accepted, protocol request published.
    MakingProtocol,
    /// Protocol accepted.
    Finished,
    /// A stage worker reported failure.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Capturing => "capturing",
            Self::Transcribing => "transcribing",
            Self::MakingProtocol => "making_protocol",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "capturing" => Some(Self::Capturing),
            "transcribing" => Some(Self::Transcribing),
            "making_protocol" => Some(Self::MakingProtocol),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Position on the forward path; `Failed` sorts after everything.
    pub fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Capturing => 1,
            Self::Transcribing => 2,
            Self::MakingProtocol => 3,
            Self::Finished => 4,
            Self::Failed => 5,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Task record ─────────────────────────────────────────────────────────────

/// Full task row as held by a task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Link to the uploaded audio blob, set once ingestion succeeds.
    pub audio_link: Option<String>,
    pub protocol_short: String,
    pub protocol_full: String,
    /// Worker error message, set only when the task is `failed`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::None,
            audio_link: None,
            protocol_short: String::new(),
            protocol_full: String::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Short and full protocol texts of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTexts {
    pub short: String,
    pub full: String,
}

// ─── Stages ──────────────────────────────────────────────────────────────────

/// One of the two external processing stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcription,
    Protocol,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Protocol => "protocol",
        }
    }

    /// Status a task must be in for this stage's result to be accepted.
    pub fn awaiting_status(&self) -> TaskStatus {
        match self {
            Self::Transcription => TaskStatus::Transcribing,
            Self::Protocol => TaskStatus::MakingProtocol,
        }
    }

    /// Status a task moves to once this stage's result is accepted.
    pub fn completed_status(&self) -> TaskStatus {
        match self {
            Self::Transcription => TaskStatus::MakingProtocol,
            Self::Protocol => TaskStatus::Finished,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result delivered by an external stage worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub task_id: TaskId,
    pub success: bool,
    /// Transcribed text or generated protocol text.
    pub text: String,
    pub error_message: Option<String>,
}

impl StageResult {
    pub fn succeeded(task_id: TaskId, text: impl Into<String>) -> Self {
        Self {
            task_id,
            success: true,
            text: text.into(),
            error_message: None,
        }
    }

    pub fn failed(task_id: TaskId, error_message: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            text: String::new(),
            error_message: Some(error_message.into()),
        }
    }
}

// ─── Transition outcome ──────────────────────────────────────────────────────

/// A forward status change applied by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

// ─── Status report ───────────────────────────────────────────────────────────

/// What a polling client sees for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Present only once the task is `finished`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_protocol: Option<String>,
    /// Present only once the task is `finished`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_protocol: Option<String>,
    /// Present only when the task is `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// ─── Feedback ────────────────────────────────────────────────────────────────

/// A user's rating of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valuation {
    pub usability: i32,
    pub processing_speed: i32,
    pub processing_quality: i32,
    pub reuse_service: bool,
    #[serde(default)]
    pub comment: String,
}

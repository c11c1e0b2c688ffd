//! Pipeline-level error taxonomy.
//!
//! Per-dependency errors (`StoreError`, `BlobError`, `BrokerError`) live next
//! to their traits; `PipelineError` wraps them with the task and step that
//! failed so boundary callers can decide whether to acknowledge.

use std::time::Duration;

use thiserror::Error;

use crate::blob::BlobError;
use crate::broker::BrokerError;
use crate::store::StoreError;
use crate::types::{Stage, TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The broker could not be reached within the startup retry budget.
    #[error("broker unreachable after {attempts} attempts: {last_error}")]
    ConnectivityExhausted {
        attempts: u32,
        #[source]
        last_error: BrokerError,
    },

    #[error("task {task_id}: audio upload failed: {source}")]
    StorageUploadFailed {
        task_id: TaskId,
        #[source]
        source: BlobError,
    },

    #[error("task {task_id}: {operation} failed: {source}")]
    PersistenceFailed {
        task_id: TaskId,
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("task {task_id}: publish to '{queue}' failed: {source}")]
    PublishFailed {
        task_id: TaskId,
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("task {task_id}: expected status {}, found {actual}", display_expected(.expected))]
    PreconditionMismatch {
        task_id: TaskId,
        expected: Vec<TaskStatus>,
        actual: TaskStatus,
    },

    #[error("task {task_id}: {stage} stage reported failure: {message}")]
    UpstreamStageFailure {
        task_id: TaskId,
        stage: Stage,
        message: String,
    },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),
}

impl PipelineError {
    /// Business outcomes are final: replaying the same event cannot change them,
    /// so boundaries acknowledge them to their transport.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::PreconditionMismatch { .. }
                | Self::UpstreamStageFailure { .. }
                | Self::TaskNotFound(_)
        )
    }

    /// Per-transition infrastructure failures; the triggering event may be replayed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUploadFailed { .. }
                | Self::PersistenceFailed { .. }
                | Self::PublishFailed { .. }
        )
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::ConnectivityExhausted { .. } => None,
            Self::StorageUploadFailed { task_id, .. }
            | Self::PersistenceFailed { task_id, .. }
            | Self::PublishFailed { task_id, .. }
            | Self::PreconditionMismatch { task_id, .. }
            | Self::UpstreamStageFailure { task_id, .. } => Some(*task_id),
            Self::TaskNotFound(task_id) => Some(*task_id),
        }
    }
}

fn display_expected(expected: &[TaskStatus]) -> String {
    expected
        .iter()
        .map(TaskStatus::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

/// Run `fut` with an upper bound; a stalled dependency turns into `on_timeout`.
pub(crate) async fn bounded<T, E, F>(
    limit: Duration,
    on_timeout: impl FnOnce(Duration) -> E,
    fut: F,
) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}

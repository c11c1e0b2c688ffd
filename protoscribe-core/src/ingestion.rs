//! Ingestion Endpoint: capture sessions for streamed audio.
//!
//! A [`CaptureSession`] owns the bytes collected for one task. `finish`
//! consumes the session, so the payload reaches the orchestrator at most once
//! per session, and the endpoint refuses a second concurrent session for the
//! same task id. Transports call `finish` on graceful and on abnormal close
//! alike; only the log line differs.
//!
//! A session holds at most `max_bytes`. A push past the limit is refused and
//! the transport abandons the session; the task stays `capturing` so the
//! client can try again.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::PipelineError;
use crate::orchestrator::TaskOrchestrator;
use crate::types::{TaskId, TransitionOutcome};

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("task {0} already has an open capture session")]
    AlreadyCapturing(TaskId),

    #[error("audio for task {task_id} exceeds the {limit} byte limit")]
    TooLarge { task_id: TaskId, limit: usize },

    #[error(transparent)]
    Rejected(#[from] PipelineError),
}

/// How the client connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamClose {
    Graceful,
    Abnormal(String),
}

impl fmt::Display for StreamClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("graceful"),
            Self::Abnormal(reason) => write!(f, "abnormal: {}", reason),
        }
    }
}

#[derive(Clone)]
pub struct IngestionEndpoint {
    inner: Arc<Inner>,
}

struct Inner {
    orchestrator: Arc<TaskOrchestrator>,
    active: Mutex<HashSet<TaskId>>,
    max_bytes: usize,
}

impl IngestionEndpoint {
    pub fn new(orchestrator: Arc<TaskOrchestrator>, max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                active: Mutex::new(HashSet::new()),
                max_bytes,
            }),
        }
    }

    /// Start a streaming capture: claims the task and moves it to `capturing`.
    pub async fn open(&self, task_id: TaskId) -> Result<CaptureSession, IngestionError> {
        let slot = self.claim(task_id)?;
        // On rejection the slot drops here and the task is free again.
        self.inner.orchestrator.on_stream_opened(task_id).await?;
        tracing::info!(task_id = %task_id, "Capture session opened");
        Ok(CaptureSession {
            endpoint: self.clone(),
            task_id,
            buffer: Vec::new(),
            delivered: false,
            _slot: slot,
        })
    }

    /// Deliver a complete payload received in one piece.
    pub async fn ingest_whole(
        &self,
        task_id: TaskId,
        audio: &[u8],
    ) -> Result<TransitionOutcome, IngestionError> {
        let limit = self.inner.max_bytes;
        if audio.len() > limit {
            return Err(IngestionError::TooLarge { task_id, limit });
        }
        let _slot = self.claim(task_id)?;
        let outcome = self
            .inner
            .orchestrator
            .on_ingestion_complete(task_id, audio)
            .await?;
        Ok(outcome)
    }

    pub fn is_capturing(&self, task_id: TaskId) -> bool {
        self.active().contains(&task_id)
    }

    fn claim(&self, task_id: TaskId) -> Result<ActiveSlot, IngestionError> {
        if !self.active().insert(task_id) {
            tracing::warn!(task_id = %task_id, "Rejected second concurrent capture session");
            return Err(IngestionError::AlreadyCapturing(task_id));
        }
        Ok(ActiveSlot {
            inner: self.inner.clone(),
            task_id,
        })
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashSet<TaskId>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases a task's capture slot when dropped.
struct ActiveSlot {
    inner: Arc<Inner>,
    task_id: TaskId,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.task_id);
    }
}

pub struct CaptureSession {
    endpoint: IngestionEndpoint,
    task_id: TaskId,
    buffer: Vec<u8>,
    delivered: bool,
    _slot: ActiveSlot,
}

impl CaptureSession {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Append a chunk. Refused, and nothing appended, once the session would
    /// exceed the endpoint's byte limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), IngestionError> {
        let limit = self.endpoint.inner.max_bytes;
        if self.buffer.len() + chunk.len() > limit {
            return Err(IngestionError::TooLarge {
                task_id: self.task_id,
                limit,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Hand the accumulated payload to the orchestrator. The slot is released
    /// after the transition returns.
    pub async fn finish(mut self, close: StreamClose) -> Result<TransitionOutcome, PipelineError> {
        match &close {
            StreamClose::Graceful => tracing::info!(
                task_id = %self.task_id,
                bytes = self.buffer.len(),
                "Capture stream closed"
            ),
            StreamClose::Abnormal(reason) => tracing::warn!(
                task_id = %self.task_id,
                bytes = self.buffer.len(),
                reason = %reason,
                "Capture stream ended abnormally, delivering collected audio"
            ),
        }
        self.delivered = true;
        let audio = std::mem::take(&mut self.buffer);
        self.endpoint
            .inner
            .orchestrator
            .on_ingestion_complete(self.task_id, &audio)
            .await
    }

    /// Drop the collected audio without delivering it. Releases the slot.
    pub fn abandon(mut self, reason: &str) {
        tracing::warn!(
            task_id = %self.task_id,
            bytes = self.buffer.len(),
            reason = %reason,
            "Capture session abandoned"
        );
        self.delivered = true;
        self.buffer = Vec::new();
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.delivered {
            tracing::error!(
                task_id = %self.task_id,
                bytes = self.buffer.len(),
                "Capture session dropped without delivery"
            );
        }
    }
}

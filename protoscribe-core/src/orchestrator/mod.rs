//! Task Orchestrator: the task state machine.
//!
//! ```text
//!   none ──open──▶ capturing ──ingest──▶ transcribing ──transcript──▶ making_protocol ──protocol──▶ finished
//!     └───────────────ingest───────────────▲                │                       │
//!                                                           └──── failure ──────────┴──▶ failed
//! ```
//!
//! Every transition follows the same discipline:
//! 1. take the per-task lock,
//! 2. read the status and reject anything that is not an accepted predecessor,
//! 3. perform the side effects (upload, persist, publish) in order,
//! 4. advance the status with a compare-and-set on the observed predecessor.
//!
//! Status is written last, so a failure in step 3 leaves the task where it was
//! and the triggering event can be replayed.

mod locks;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::blob::{BlobError, BlobGateway};
use crate::broker::BrokerGateway;
use crate::error::{bounded, PipelineError};
use crate::messages::{ProtocolRequest, TranscribeRequest};
use crate::reporter::StatusReporter;
use crate::store::{AudioLinkStore, ProtocolStore, StoreError, TaskStatusStore};
use crate::types::{Stage, StageResult, TaskId, TaskStatus, TransitionOutcome};

use self::locks::TaskLocks;

/// Content type recorded for uploaded audio.
pub const AUDIO_CONTENT_TYPE: &str = "audio/wav";

/// What to do with a stage result that reports `success = false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailurePolicy {
    /// Move the task to terminal `failed` and keep the worker's message.
    #[default]
    MarkFailed,
    /// Leave the task where it is; the worker may retry out-of-band.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub transcribe_queue: String,
    pub protocol_queue: String,
    /// Upper bound on every store, blob and broker call.
    pub call_timeout: Duration,
    pub stage_failure_policy: StageFailurePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transcribe_queue: "to_transcribe".to_string(),
            protocol_queue: "to_protocol".to_string(),
            call_timeout: Duration::from_secs(5),
            stage_failure_policy: StageFailurePolicy::MarkFailed,
        }
    }
}

/// Object name under which a task's audio is uploaded.
pub fn audio_object_name(task_id: TaskId) -> String {
    format!("audio_{}.wav", task_id)
}

pub struct TaskOrchestrator {
    statuses: Arc<dyn TaskStatusStore>,
    links: Arc<dyn AudioLinkStore>,
    protocols: Arc<dyn ProtocolStore>,
    blobs: Arc<dyn BlobGateway>,
    broker: Arc<BrokerGateway>,
    config: OrchestratorConfig,
    locks: TaskLocks,
}

impl TaskOrchestrator {
    pub fn new(
        statuses: Arc<dyn TaskStatusStore>,
        links: Arc<dyn AudioLinkStore>,
        protocols: Arc<dyn ProtocolStore>,
        blobs: Arc<dyn BlobGateway>,
        broker: Arc<BrokerGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            statuses,
            links,
            protocols,
            blobs,
            broker,
            config,
            locks: TaskLocks::default(),
        }
    }

    /// Build from one store that provides every capability.
    pub fn with_store<S>(
        store: Arc<S>,
        blobs: Arc<dyn BlobGateway>,
        broker: Arc<BrokerGateway>,
        config: OrchestratorConfig,
    ) -> Self
    where
        S: TaskStatusStore + AudioLinkStore + ProtocolStore + 'static,
    {
        Self::new(store.clone(), store.clone(), store, blobs, broker, config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn status_reporter(&self) -> StatusReporter {
        StatusReporter::new(
            self.statuses.clone(),
            self.protocols.clone(),
            self.config.call_timeout,
        )
    }

    // ─── Task creation ───────────────────────────────────────────────────────

    pub async fn create_task(&self) -> Result<TaskId, StoreError> {
        let id = bounded(
            self.config.call_timeout,
            StoreError::Timeout,
            self.statuses.create_task(),
        )
        .await?;
        info!(task_id = %id, "Task created");
        Ok(id)
    }

    // ─── Transition 0: stream opened ─────────────────────────────────────────

    /// A client opened a capture stream for the task.
    pub async fn on_stream_opened(&self, id: TaskId) -> Result<TransitionOutcome, PipelineError> {
        let _guard = self.locks.acquire(id).await;
        let status = self.current_status(id).await?;

        match status {
            TaskStatus::None => {
                self.advance(id, status, TaskStatus::Capturing).await
            }
            TaskStatus::Capturing => {
                debug!(task_id = %id, "Capture stream reopened");
                Ok(TransitionOutcome {
                    task_id: id,
                    from: status,
                    to: status,
                })
            }
            actual => Err(self.reject(
                id,
                "stream_opened",
                vec![TaskStatus::None, TaskStatus::Capturing],
                actual,
            )),
        }
    }

    // ─── Transition 1: ingestion complete ────────────────────────────────────

    /// The complete captured payload for a task.
    ///
    /// Upload → persist link → publish → advance. A replay after a publish
    /// failure reuses the persisted link instead of uploading again.
    pub async fn on_ingestion_complete(
        &self,
        id: TaskId,
        audio: &[u8],
    ) -> Result<TransitionOutcome, PipelineError> {
        let _guard = self.locks.acquire(id).await;
        let status = self.current_status(id).await?;
        if !matches!(status, TaskStatus::None | TaskStatus::Capturing) {
            return Err(self.reject(
                id,
                "ingestion_complete",
                vec![TaskStatus::None, TaskStatus::Capturing],
                status,
            ));
        }

        let existing = self
            .store_call(id, "get_audio_link", self.links.get_audio_link(id))
            .await?;
        let link = match existing {
            Some(link) => {
                debug!(task_id = %id, link = %link, "Reusing persisted audio link");
                link
            }
            None => {
                let name = audio_object_name(id);
                let link = bounded(
                    self.config.call_timeout,
                    BlobError::Timeout,
                    self.blobs.upload(&name, audio, AUDIO_CONTENT_TYPE),
                )
                .await
                .map_err(|source| {
                    warn!(task_id = %id, error = %source, "Audio upload failed");
                    PipelineError::StorageUploadFailed { task_id: id, source }
                })?;
                self.store_call(id, "save_audio_link", self.links.save_audio_link(id, &link))
                    .await?;
                info!(task_id = %id, bytes = audio.len(), link = %link, "Audio stored");
                link
            }
        };

        let request = TranscribeRequest {
            task_id: id,
            audio_file_link: link,
        };
        self.publish(id, &self.config.transcribe_queue, &request).await?;

        self.advance(id, status, TaskStatus::Transcribing).await
    }

    // ─── Transitions 2 and 3: stage results ──────────────────────────────────

    pub async fn on_transcription_result(
        &self,
        result: StageResult,
    ) -> Result<TransitionOutcome, PipelineError> {
        self.apply_stage_result(Stage::Transcription, result).await
    }

    pub async fn on_protocol_result(
        &self,
        result: StageResult,
    ) -> Result<TransitionOutcome, PipelineError> {
        self.apply_stage_result(Stage::Protocol, result).await
    }

    async fn apply_stage_result(
        &self,
        stage: Stage,
        result: StageResult,
    ) -> Result<TransitionOutcome, PipelineError> {
        let id = result.task_id;
        let _guard = self.locks.acquire(id).await;
        let expected = stage.awaiting_status();
        let status = self.current_status(id).await?;
        if status != expected {
            return Err(self.reject(id, stage.as_str(), vec![expected], status));
        }

        if !result.success {
            return Err(self.fail_stage(id, stage, result.error_message).await);
        }

        match stage {
            Stage::Transcription => {
                self.store_call(
                    id,
                    "update_protocol_full",
                    self.protocols.update_protocol_full(id, &result.text),
                )
                .await?;
                let request = ProtocolRequest {
                    task_id: id,
                    transcribed_text: result.text,
                };
                self.publish(id, &self.config.protocol_queue, &request).await?;
            }
            Stage::Protocol => {
                self.store_call(
                    id,
                    "update_protocol_short",
                    self.protocols.update_protocol_short(id, &result.text),
                )
                .await?;
            }
        }

        self.advance(id, status, stage.completed_status()).await
    }

    /// Apply the configured failure policy. Always yields `UpstreamStageFailure`
    /// unless the store itself fails.
    async fn fail_stage(&self, id: TaskId, stage: Stage, message: Option<String>) -> PipelineError {
        let message = message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("{} worker reported failure", stage));

        match self.config.stage_failure_policy {
            StageFailurePolicy::Ignore => {
                warn!(
                    task_id = %id,
                    stage = %stage,
                    error = %message,
                    "Stage failure ignored, task left in place"
                );
            }
            StageFailurePolicy::MarkFailed => {
                let expected = stage.awaiting_status();
                let marked = self
                    .store_call(
                        id,
                        "mark_failed",
                        self.statuses.mark_failed(id, expected, &message),
                    )
                    .await;
                match marked {
                    Ok(true) => warn!(
                        task_id = %id,
                        stage = %stage,
                        error = %message,
                        "Task marked failed"
                    ),
                    Ok(false) => {
                        return match self.current_status(id).await {
                            Ok(actual) => self.reject(id, stage.as_str(), vec![expected], actual),
                            Err(e) => e,
                        };
                    }
                    Err(e) => return e,
                }
            }
        }

        PipelineError::UpstreamStageFailure {
            task_id: id,
            stage,
            message,
        }
    }

    // ─── Protocol edit ───────────────────────────────────────────────────────

    /// Replace the short protocol of a finished task. Status is unchanged.
    pub async fn amend_protocol(&self, id: TaskId, text: &str) -> Result<(), PipelineError> {
        let _guard = self.locks.acquire(id).await;
        let status = self.current_status(id).await?;
        if status != TaskStatus::Finished {
            return Err(self.reject(id, "amend_protocol", vec![TaskStatus::Finished], status));
        }
        self.store_call(
            id,
            "update_protocol_short",
            self.protocols.update_protocol_short(id, text),
        )
        .await?;
        info!(task_id = %id, "Short protocol amended");
        Ok(())
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    async fn current_status(&self, id: TaskId) -> Result<TaskStatus, PipelineError> {
        self.store_call(id, "get_status", self.statuses.get_status(id))
            .await
    }

    async fn advance(
        &self,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<TransitionOutcome, PipelineError> {
        let applied = self
            .store_call(
                id,
                "compare_and_set_status",
                self.statuses.compare_and_set_status(id, from, to),
            )
            .await?;
        if !applied {
            let actual = self.current_status(id).await?;
            return Err(self.reject(id, to.as_str(), vec![from], actual));
        }
        info!(task_id = %id, from = %from, to = %to, "Task status advanced");
        Ok(TransitionOutcome {
            task_id: id,
            from,
            to,
        })
    }

    async fn publish<T: Serialize + Sync>(
        &self,
        id: TaskId,
        queue: &str,
        message: &T,
    ) -> Result<(), PipelineError> {
        self.broker
            .publish_json(queue, message)
            .await
            .map_err(|source| {
                warn!(task_id = %id, queue, error = %source, "Stage request publish failed");
                PipelineError::PublishFailed {
                    task_id: id,
                    queue: queue.to_string(),
                    source,
                }
            })
    }

    async fn store_call<T, F>(
        &self,
        id: TaskId,
        operation: &'static str,
        fut: F,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        bounded(self.config.call_timeout, StoreError::Timeout, fut)
            .await
            .map_err(|source| match source {
                StoreError::NotFound(_) => PipelineError::TaskNotFound(id),
                source => {
                    warn!(task_id = %id, operation, error = %source, "Store call failed");
                    PipelineError::PersistenceFailed {
                        task_id: id,
                        operation,
                        source,
                    }
                }
            })
    }

    fn reject(
        &self,
        id: TaskId,
        event: &str,
        expected: Vec<TaskStatus>,
        actual: TaskStatus,
    ) -> PipelineError {
        info!(
            task_id = %id,
            event,
            actual = %actual,
            "Event does not match task status, dropped"
        );
        PipelineError::PreconditionMismatch {
            task_id: id,
            expected,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::broker::{MemoryBroker, RetryPolicy};
    use crate::store::MemoryTaskStore;

    // -------------------------------------------------------------------------
    // Rig
    // -------------------------------------------------------------------------

    struct Rig {
        store: Arc<MemoryTaskStore>,
        blobs: Arc<MemoryBlobStore>,
        broker: Arc<MemoryBroker>,
        orchestrator: TaskOrchestrator,
    }

    async fn rig(policy: StageFailurePolicy) -> Rig {
        let store = MemoryTaskStore::new();
        let blobs = MemoryBlobStore::new();
        let broker = MemoryBroker::new();
        let gateway = Arc::new(BrokerGateway::new(
            broker.clone(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        ));
        gateway.run().await.unwrap();
        let orchestrator = TaskOrchestrator::with_store(
            store.clone(),
            blobs.clone(),
            gateway,
            OrchestratorConfig {
                stage_failure_policy: policy,
                ..OrchestratorConfig::default()
            },
        );
        Rig {
            store,
            blobs,
            broker,
            orchestrator,
        }
    }

    async fn status(rig: &Rig, id: TaskId) -> TaskStatus {
        rig.store.get_status(id).await.unwrap()
    }

    // -------------------------------------------------------------------------
    // Stream opened
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn stream_open_moves_to_capturing_once() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let id = rig.orchestrator.create_task().await.unwrap();

        let first = rig.orchestrator.on_stream_opened(id).await.unwrap();
        assert_eq!((first.from, first.to), (TaskStatus::None, TaskStatus::Capturing));

        let again = rig.orchestrator.on_stream_opened(id).await.unwrap();
        assert_eq!((again.from, again.to), (TaskStatus::Capturing, TaskStatus::Capturing));
    }

    #[tokio::test]
    async fn stream_open_rejected_after_ingestion() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let id = rig.orchestrator.create_task().await.unwrap();
        rig.orchestrator.on_ingestion_complete(id, b"abc").await.unwrap();

        let err = rig.orchestrator.on_stream_opened(id).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PreconditionMismatch {
                actual: TaskStatus::Transcribing,
                ..
            }
        ));
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn ingestion_uploads_under_task_name() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let id = rig.orchestrator.create_task().await.unwrap();
        rig.orchestrator.on_stream_opened(id).await.unwrap();

        let outcome = rig.orchestrator.on_ingestion_complete(id, b"abc").await.unwrap();
        assert_eq!(outcome.from, TaskStatus::Capturing);
        assert_eq!(outcome.to, TaskStatus::Transcribing);
        assert_eq!(rig.blobs.uploads().await, vec![format!("audio_{}.wav", id)]);

        let messages = rig.broker.messages("to_transcribe");
        assert_eq!(messages.len(), 1);
        let request: TranscribeRequest = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(request.task_id, id);
        assert_eq!(
            Some(request.audio_file_link),
            rig.store.get_audio_link(id).await.unwrap()
        );
    }

    #[tokio::test]
    async fn link_persist_failure_publishes_nothing() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let id = rig.orchestrator.create_task().await.unwrap();
        rig.store.set_fail_writes(true);

        let err = rig.orchestrator.on_ingestion_complete(id, b"abc").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PersistenceFailed {
                operation: "save_audio_link",
                ..
            }
        ));
        assert!(rig.broker.messages("to_transcribe").is_empty());
        rig.store.set_fail_writes(false);
        assert_eq!(status(&rig, id).await, TaskStatus::None);
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let err = rig
            .orchestrator
            .on_ingestion_complete(TaskId(999), b"abc")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TaskNotFound(TaskId(999))));
        assert!(rig.blobs.uploads().await.is_empty());
    }

    // -------------------------------------------------------------------------
    // Stage results
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn transcript_is_persisted_before_publish() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let id = rig.orchestrator.create_task().await.unwrap();
        rig.orchestrator.on_ingestion_complete(id, b"abc").await.unwrap();
        rig.broker.set_reject_publishes(true);

        let err = rig
            .orchestrator
            .on_transcription_result(StageResult::succeeded(id, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PublishFailed { .. }));
        assert_eq!(rig.store.get_protocol(id).await.unwrap().full, "hello");
        assert_eq!(status(&rig, id).await, TaskStatus::Transcribing);

        // Redelivery after the broker recovers completes the transition.
        rig.broker.set_reject_publishes(false);
        let outcome = rig
            .orchestrator
            .on_transcription_result(StageResult::succeeded(id, "hello"))
            .await
            .unwrap();
        assert_eq!(outcome.to, TaskStatus::MakingProtocol);
        assert_eq!(rig.broker.messages("to_protocol").len(), 1);
    }

    #[tokio::test]
    async fn failure_without_message_gets_default_text() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let id = rig.orchestrator.create_task().await.unwrap();
        rig.orchestrator.on_ingestion_complete(id, b"abc").await.unwrap();

        let mut result = StageResult::failed(id, "");
        result.error_message = None;
        let err = rig.orchestrator.on_transcription_result(result).await.unwrap_err();
        match err {
            PipelineError::UpstreamStageFailure { stage, message, .. } => {
                assert_eq!(stage, Stage::Transcription);
                assert_eq!(message, "transcription worker reported failure");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(status(&rig, id).await, TaskStatus::Failed);
    }

    // -------------------------------------------------------------------------
    // Protocol edit
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn amend_only_when_finished() {
        let rig = rig(StageFailurePolicy::MarkFailed).await;
        let id = rig.orchestrator.create_task().await.unwrap();

        let err = rig.orchestrator.amend_protocol(id, "edited").await.unwrap_err();
        assert!(err.is_business());

        rig.orchestrator.on_ingestion_complete(id, b"abc").await.unwrap();
        rig.orchestrator
            .on_transcription_result(StageResult::succeeded(id, "hello"))
            .await
            .unwrap();
        rig.orchestrator
            .on_protocol_result(StageResult::succeeded(id, "SHORT"))
            .await
            .unwrap();

        rig.orchestrator.amend_protocol(id, "edited").await.unwrap();
        let texts = rig.store.get_protocol(id).await.unwrap();
        assert_eq!(texts.short, "edited");
        assert_eq!(texts.full, "hello");
        assert_eq!(status(&rig, id).await, TaskStatus::Finished);
    }

    // -------------------------------------------------------------------------
    // Store failure while resolving a lost mark_failed race
    // -------------------------------------------------------------------------

    /// Status store whose row moves away under `mark_failed` and whose reads
    /// fail after the first one.
    struct RacingStatusStore {
        inner: Arc<MemoryTaskStore>,
        reads: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TaskStatusStore for RacingStatusStore {
        async fn create_task(&self) -> Result<TaskId, StoreError> {
            self.inner.create_task().await
        }

        async fn get_status(&self, id: TaskId) -> Result<TaskStatus, StoreError> {
            let read = self
                .reads
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if read == 0 {
                self.inner.get_status(id).await
            } else {
                Err(StoreError::Backend("connection reset".to_string()))
            }
        }

        async fn compare_and_set_status(
            &self,
            id: TaskId,
            expected: TaskStatus,
            new: TaskStatus,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_set_status(id, expected, new).await
        }

        async fn mark_failed(
            &self,
            _id: TaskId,
            _expected: TaskStatus,
            _message: &str,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn get_error_message(&self, id: TaskId) -> Result<Option<String>, StoreError> {
            self.inner.get_error_message(id).await
        }
    }

    #[tokio::test]
    async fn status_read_failure_after_lost_mark_failed_is_retryable() {
        let store = MemoryTaskStore::new();
        let id = store.create_task().await.unwrap();
        store
            .compare_and_set_status(id, TaskStatus::None, TaskStatus::Transcribing)
            .await
            .unwrap();

        let statuses = Arc::new(RacingStatusStore {
            inner: store.clone(),
            reads: std::sync::atomic::AtomicUsize::new(0),
        });
        let gateway = Arc::new(BrokerGateway::new(
            MemoryBroker::new(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        ));
        gateway.run().await.unwrap();
        let orchestrator = TaskOrchestrator::new(
            statuses,
            store.clone(),
            store.clone(),
            MemoryBlobStore::new(),
            gateway,
            OrchestratorConfig::default(),
        );

        let err = orchestrator
            .on_transcription_result(StageResult::failed(id, "bad audio"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PersistenceFailed {
                operation: "get_status",
                ..
            }
        ));
        assert!(err.is_retryable());
    }
}

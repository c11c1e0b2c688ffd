//! End-to-end pipeline scenarios over the in-memory store, blob store and
//! broker.
//!
//! Run with: cargo test -p protoscribe-core --test pipeline_scenarios

use std::sync::Arc;
use std::time::Duration;

use protoscribe_core::blob::MemoryBlobStore;
use protoscribe_core::broker::{BrokerGateway, MemoryBroker, RetryPolicy};
use protoscribe_core::messages::{ProtocolRequest, TranscribeRequest};
use protoscribe_core::store::{AudioLinkStore, MemoryTaskStore, ProtocolStore, TaskStatusStore};
use protoscribe_core::{
    OrchestratorConfig, PipelineError, StageFailurePolicy, StageResult, TaskId, TaskOrchestrator,
    TaskStatus,
};

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

struct Rig {
    store: Arc<MemoryTaskStore>,
    blobs: Arc<MemoryBlobStore>,
    broker: Arc<MemoryBroker>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl Rig {
    async fn new() -> Self {
        Self::with_policy(StageFailurePolicy::MarkFailed).await
    }

    async fn with_policy(policy: StageFailurePolicy) -> Self {
        let store = MemoryTaskStore::new();
        let blobs = MemoryBlobStore::new();
        let broker = MemoryBroker::new();
        let gateway = Arc::new(BrokerGateway::new(
            broker.clone(),
            RetryPolicy::default(),
            Duration::from_secs(5),
        ));
        gateway.run().await.unwrap();
        let orchestrator = Arc::new(TaskOrchestrator::with_store(
            store.clone(),
            blobs.clone(),
            gateway,
            OrchestratorConfig {
                stage_failure_policy: policy,
                ..OrchestratorConfig::default()
            },
        ));
        Self {
            store,
            blobs,
            broker,
            orchestrator,
        }
    }

    async fn status(&self, id: TaskId) -> TaskStatus {
        self.store.get_status(id).await.unwrap()
    }

    async fn task_in_transcribing(&self) -> TaskId {
        let id = self.orchestrator.create_task().await.unwrap();
        self.orchestrator
            .on_ingestion_complete(id, b"abc")
            .await
            .unwrap();
        id
    }

    fn transcribe_requests(&self) -> Vec<TranscribeRequest> {
        self.broker
            .messages("to_transcribe")
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    fn protocol_requests(&self) -> Vec<ProtocolRequest> {
        self.broker
            .messages("to_protocol")
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_end_to_end_pipeline() {
    let rig = Rig::new().await;
    let id = rig.orchestrator.create_task().await.unwrap();
    assert_eq!(rig.status(id).await, TaskStatus::None);

    rig.orchestrator
        .on_ingestion_complete(id, b"abc")
        .await
        .unwrap();
    assert_eq!(rig.status(id).await, TaskStatus::Transcribing);
    let link = rig.store.get_audio_link(id).await.unwrap().unwrap();
    assert!(!link.is_empty());
    assert_eq!(
        rig.transcribe_requests(),
        vec![TranscribeRequest {
            task_id: id,
            audio_file_link: link,
        }]
    );

    rig.orchestrator
        .on_transcription_result(StageResult::succeeded(id, "hello"))
        .await
        .unwrap();
    assert_eq!(rig.status(id).await, TaskStatus::MakingProtocol);
    assert_eq!(rig.store.get_protocol(id).await.unwrap().full, "hello");
    assert_eq!(
        rig.protocol_requests(),
        vec![ProtocolRequest {
            task_id: id,
            transcribed_text: "hello".to_string(),
        }]
    );

    rig.orchestrator
        .on_protocol_result(StageResult::succeeded(id, "SHORT"))
        .await
        .unwrap();
    assert_eq!(rig.status(id).await, TaskStatus::Finished);
    assert_eq!(rig.store.get_protocol(id).await.unwrap().short, "SHORT");

    let report = rig.orchestrator.status_reporter().report(id).await.unwrap();
    assert_eq!(report.short_protocol.as_deref(), Some("SHORT"));
    assert_eq!(report.full_protocol.as_deref(), Some("hello"));
}

// ---------------------------------------------------------------------------
// Failures during ingestion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_upload_failure_leaves_task_untouched() {
    let rig = Rig::new().await;
    let id = rig.orchestrator.create_task().await.unwrap();
    rig.blobs.set_fail_uploads(true);

    let err = rig
        .orchestrator
        .on_ingestion_complete(id, b"abc")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::StorageUploadFailed { .. }));
    assert!(err.is_retryable());
    assert_eq!(rig.status(id).await, TaskStatus::None);
    assert!(rig.broker.messages("to_transcribe").is_empty());
    assert_eq!(rig.store.get_audio_link(id).await.unwrap(), None);
}

#[tokio::test]
async fn test_publish_failure_keeps_link_and_replay_skips_upload() {
    let rig = Rig::new().await;
    let id = rig.orchestrator.create_task().await.unwrap();
    rig.broker.set_reject_publishes(true);

    let err = rig
        .orchestrator
        .on_ingestion_complete(id, b"abc")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::PublishFailed { .. }));
    assert_eq!(rig.status(id).await, TaskStatus::None);
    let link = rig.store.get_audio_link(id).await.unwrap();
    assert!(link.is_some());
    assert_eq!(rig.blobs.uploads().await.len(), 1);

    rig.broker.set_reject_publishes(false);
    rig.orchestrator
        .on_ingestion_complete(id, b"abc")
        .await
        .unwrap();
    assert_eq!(rig.status(id).await, TaskStatus::Transcribing);
    assert_eq!(rig.blobs.uploads().await.len(), 1, "replay must not re-upload");
    assert_eq!(rig.transcribe_requests()[0].audio_file_link, link.unwrap());
}

#[tokio::test]
async fn test_ingestion_replay_after_success_is_rejected() {
    let rig = Rig::new().await;
    let id = rig.task_in_transcribing().await;

    let err = rig
        .orchestrator
        .on_ingestion_complete(id, b"abc")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::PreconditionMismatch { .. }));
    assert_eq!(rig.broker.messages("to_transcribe").len(), 1);
}

// ---------------------------------------------------------------------------
// Idempotence and ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_transcription_result_changes_nothing() {
    let rig = Rig::new().await;
    let id = rig.task_in_transcribing().await;

    rig.orchestrator
        .on_transcription_result(StageResult::succeeded(id, "hello"))
        .await
        .unwrap();
    let err = rig
        .orchestrator
        .on_transcription_result(StageResult::succeeded(id, "different"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::PreconditionMismatch {
            actual: TaskStatus::MakingProtocol,
            ..
        }
    ));
    assert_eq!(rig.store.get_protocol(id).await.unwrap().full, "hello");
    assert_eq!(rig.broker.messages("to_protocol").len(), 1);
}

#[tokio::test]
async fn test_duplicate_protocol_result_changes_nothing() {
    let rig = Rig::new().await;
    let id = rig.task_in_transcribing().await;
    rig.orchestrator
        .on_transcription_result(StageResult::succeeded(id, "hello"))
        .await
        .unwrap();
    rig.orchestrator
        .on_protocol_result(StageResult::succeeded(id, "SHORT"))
        .await
        .unwrap();

    let err = rig
        .orchestrator
        .on_protocol_result(StageResult::succeeded(id, "OTHER"))
        .await
        .unwrap_err();
    assert!(err.is_business());
    assert_eq!(rig.store.get_protocol(id).await.unwrap().short, "SHORT");
}

#[tokio::test]
async fn test_protocol_result_while_transcribing_is_rejected() {
    let rig = Rig::new().await;
    let id = rig.task_in_transcribing().await;

    let err = rig
        .orchestrator
        .on_protocol_result(StageResult::succeeded(id, "SHORT"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::PreconditionMismatch {
            actual: TaskStatus::Transcribing,
            ..
        }
    ));
    assert_eq!(rig.status(id).await, TaskStatus::Transcribing);
    assert_eq!(rig.store.get_protocol(id).await.unwrap().short, "");
}

#[tokio::test]
async fn test_concurrent_duplicates_apply_once() {
    let rig = Rig::new().await;
    let id = rig.task_in_transcribing().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = rig.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .on_transcription_result(StageResult::succeeded(id, "hello"))
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => applied += 1,
            Err(e) => assert!(matches!(e, PipelineError::PreconditionMismatch { .. })),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(rig.broker.messages("to_protocol").len(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency across tasks
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_tasks_progress_in_parallel() {
    let rig = Rig::new().await;
    let mut ids = Vec::new();
    for _ in 0..16 {
        ids.push(rig.orchestrator.create_task().await.unwrap());
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let orchestrator = rig.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let text = format!("transcript {}", id);
            orchestrator
                .on_ingestion_complete(id, text.as_bytes())
                .await?;
            orchestrator
                .on_transcription_result(StageResult::succeeded(id, text.clone()))
                .await?;
            orchestrator
                .on_protocol_result(StageResult::succeeded(id, format!("short {}", id)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for id in ids {
        assert_eq!(rig.status(id).await, TaskStatus::Finished);
        let texts = rig.store.get_protocol(id).await.unwrap();
        assert_eq!(texts.full, format!("transcript {}", id));
        assert_eq!(texts.short, format!("short {}", id));
    }
    assert_eq!(rig.broker.messages("to_transcribe").len(), 16);
    assert_eq!(rig.broker.messages("to_protocol").len(), 16);
}

// ---------------------------------------------------------------------------
// Stage failure policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_mark_failed_policy_surfaces_error() {
    let rig = Rig::new().await;
    let id = rig.task_in_transcribing().await;

    let err = rig
        .orchestrator
        .on_transcription_result(StageResult::failed(id, "no speech detected"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UpstreamStageFailure { .. }));
    assert_eq!(rig.status(id).await, TaskStatus::Failed);

    let report = rig.orchestrator.status_reporter().report(id).await.unwrap();
    assert_eq!(report.error_message.as_deref(), Some("no speech detected"));
    assert_eq!(report.full_protocol, None);

    // Terminal: a late success is dropped.
    let late = rig
        .orchestrator
        .on_transcription_result(StageResult::succeeded(id, "hello"))
        .await
        .unwrap_err();
    assert!(matches!(
        late,
        PipelineError::PreconditionMismatch {
            actual: TaskStatus::Failed,
            ..
        }
    ));
    assert!(rig.broker.messages("to_protocol").is_empty());
}

#[tokio::test]
async fn test_ignore_policy_leaves_task_waiting() {
    let rig = Rig::with_policy(StageFailurePolicy::Ignore).await;
    let id = rig.task_in_transcribing().await;
    rig.orchestrator
        .on_transcription_result(StageResult::succeeded(id, "hello"))
        .await
        .unwrap();

    let err = rig
        .orchestrator
        .on_protocol_result(StageResult::failed(id, "model overloaded"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UpstreamStageFailure { .. }));
    assert_eq!(rig.status(id).await, TaskStatus::MakingProtocol);

    // The worker retried out-of-band and succeeded.
    rig.orchestrator
        .on_protocol_result(StageResult::succeeded(id, "SHORT"))
        .await
        .unwrap();
    assert_eq!(rig.status(id).await, TaskStatus::Finished);
}

// ---------------------------------------------------------------------------
// Broker startup retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_startup_retry_exhaustion_takes_full_schedule() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(u32::MAX);
    let gateway = BrokerGateway::new(broker.clone(), RetryPolicy::default(), Duration::from_secs(5));

    let started = tokio::time::Instant::now();
    let err = gateway.run().await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        PipelineError::ConnectivityExhausted { attempts, .. } => assert_eq!(attempts, 5),
        other => panic!("unexpected error: {other}"),
    }
    assert!(elapsed >= Duration::from_secs(15), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(16), "elapsed {:?}", elapsed);
    assert!(!gateway.is_ready().await);
}

#[tokio::test(start_paused = true)]
async fn test_startup_succeeds_on_third_attempt() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(2);
    let gateway = BrokerGateway::new(broker.clone(), RetryPolicy::default(), Duration::from_secs(5));

    let started = tokio::time::Instant::now();
    gateway.run().await.unwrap();

    // 1s after the first failure, 2s after the second.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(gateway.is_ready().await);
    assert_eq!(broker.connect_count(), 1);
    gateway.publish("to_transcribe", b"{}").await.unwrap();
}

//! Callback Receiver: turns stage-result notifications into orchestrator
//! transitions and decides whether the sender may consider them delivered.

use serde::Serialize;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::orchestrator::TaskOrchestrator;
use crate::types::{Stage, StageResult, TaskId, TransitionOutcome};

/// Acknowledgment decision for one callback.
#[derive(Debug)]
pub enum CallbackAck {
    /// The transition was applied.
    Applied(TransitionOutcome),
    /// A business outcome; redelivery cannot change it.
    Discarded(PipelineError),
    /// An infrastructure failure; the sender should redeliver.
    Retry(PipelineError),
}

impl CallbackAck {
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Self::Retry(_))
    }
}

/// Body returned to the callback sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallbackReply {
    pub success: bool,
}

impl From<&CallbackAck> for CallbackReply {
    fn from(ack: &CallbackAck) -> Self {
        Self {
            success: ack.is_acknowledged(),
        }
    }
}

#[derive(Clone)]
pub struct CallbackReceiver {
    orchestrator: Arc<TaskOrchestrator>,
}

impl CallbackReceiver {
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn on_transcribe_result(
        &self,
        task_id: TaskId,
        success: bool,
        text: String,
        error_message: Option<String>,
    ) -> CallbackAck {
        let result = StageResult {
            task_id,
            success,
            text,
            error_message,
        };
        let outcome = self.orchestrator.on_transcription_result(result).await;
        classify(Stage::Transcription, task_id, outcome)
    }

    pub async fn on_protocol_result(
        &self,
        task_id: TaskId,
        success: bool,
        text: String,
        error_message: Option<String>,
    ) -> CallbackAck {
        let result = StageResult {
            task_id,
            success,
            text,
            error_message,
        };
        let outcome = self.orchestrator.on_protocol_result(result).await;
        classify(Stage::Protocol, task_id, outcome)
    }
}

fn classify(
    stage: Stage,
    task_id: TaskId,
    outcome: Result<TransitionOutcome, PipelineError>,
) -> CallbackAck {
    match outcome {
        Ok(outcome) => CallbackAck::Applied(outcome),
        Err(e) if e.is_business() => {
            tracing::debug!(task_id = %task_id, stage = %stage, error = %e, "Callback discarded");
            CallbackAck::Discarded(e)
        }
        Err(e) => {
            tracing::warn!(
                task_id = %task_id,
                stage = %stage,
                error = %e,
                "Callback not acknowledged, awaiting redelivery"
            );
            CallbackAck::Retry(e)
        }
    }
}

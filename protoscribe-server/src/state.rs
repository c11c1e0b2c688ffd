//! Shared application state.

use std::sync::Arc;

use protoscribe_core::feedback::FeedbackRecorder;
use protoscribe_core::ingestion::IngestionEndpoint;
use protoscribe_core::receiver::CallbackReceiver;
use protoscribe_core::reporter::StatusReporter;
use protoscribe_core::store::FeedbackStore;
use protoscribe_core::TaskOrchestrator;

/// Everything a handler may reach. Cloned per request; all fields are shared.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TaskOrchestrator>,
    pub reporter: StatusReporter,
    pub callbacks: CallbackReceiver,
    pub ingestion: IngestionEndpoint,
    pub feedback: FeedbackRecorder,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        feedback: Arc<dyn FeedbackStore>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            reporter: orchestrator.status_reporter(),
            callbacks: CallbackReceiver::new(orchestrator.clone()),
            ingestion: IngestionEndpoint::new(orchestrator.clone(), max_upload_bytes),
            feedback: FeedbackRecorder::new(feedback, orchestrator.config().call_timeout),
            orchestrator,
            max_upload_bytes,
        }
    }
}

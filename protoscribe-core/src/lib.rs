//! protoscribe-core: task pipeline for audio → transcript → protocol.
//!
//! A task is created empty, receives captured audio, and is then advanced by
//! asynchronous stage results from two external workers (transcription and
//! protocol generation). This crate owns the state machine and every contract
//! around it:
//!
//! - [`orchestrator::TaskOrchestrator`]: transitions, per-task serialization,
//!   ordering of side effects.
//! - [`broker::BrokerGateway`]: bounded connection retry and publish of stage
//!   requests; [`broker::ConnectionSupervisor`] restores dropped channels.
//! - [`store`]: narrow capability traits for the durable task store.
//! - [`blob::BlobGateway`]: upload-and-get-link for audio.
//! - [`receiver::CallbackReceiver`] and [`ingestion::IngestionEndpoint`]:
//!   boundary contracts the transports plug into.
//! - [`feedback::FeedbackRecorder`]: bounded writes of user ratings.
//!
//! Feature `postgres` enables the sqlx-backed store and queue transport.

pub mod blob;
pub mod broker;
pub mod error;
pub mod feedback;
pub mod ingestion;
pub mod messages;
pub mod orchestrator;
pub mod receiver;
pub mod reporter;
pub mod store;
pub mod types;

pub use error::PipelineError;
pub use orchestrator::{OrchestratorConfig, StageFailurePolicy, TaskOrchestrator};
pub use types::{StageResult, TaskId, TaskStatus, TaskStatusReport, TransitionOutcome, Valuation};

//! Durable task store, split into the narrow capabilities each consumer needs.
//!
//! The store holds no transition logic. The only status write is a
//! compare-and-set on the caller's observed predecessor; deciding which
//! transitions are legal belongs to the orchestrator.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryTaskStore;
#[cfg(feature = "postgres")]
pub use postgres::PgTaskStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::types::{ProtocolTexts, TaskId, TaskStatus, Valuation};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

#[async_trait]
pub trait TaskStatusStore: Send + Sync {
    /// Insert a task with status `none` and empty protocol fields.
    async fn create_task(&self) -> Result<TaskId, StoreError>;

    async fn get_status(&self, id: TaskId) -> Result<TaskStatus, StoreError>;

    /// Set `new` only if the current status is `expected`.
    /// Returns `false` (and writes nothing) when the status has moved on.
    async fn compare_and_set_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// Compare-and-set to `failed`, recording the worker's message.
    async fn mark_failed(
        &self,
        id: TaskId,
        expected: TaskStatus,
        message: &str,
    ) -> Result<bool, StoreError>;

    async fn get_error_message(&self, id: TaskId) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait AudioLinkStore: Send + Sync {
    async fn save_audio_link(&self, id: TaskId, link: &str) -> Result<(), StoreError>;
    async fn get_audio_link(&self, id: TaskId) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait ProtocolStore: Send + Sync {
    async fn update_protocol_short(&self, id: TaskId, text: &str) -> Result<(), StoreError>;
    async fn update_protocol_full(&self, id: TaskId, text: &str) -> Result<(), StoreError>;
    async fn get_protocol(&self, id: TaskId) -> Result<ProtocolTexts, StoreError>;
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Persist a rating, returning the id the store assigned to it.
    async fn save_valuation(&self, valuation: &Valuation) -> Result<i64, StoreError>;
}

//! In-memory task store for tests and local runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{AudioLinkStore, FeedbackStore, ProtocolStore, StoreError, TaskStatusStore};
use crate::types::{ProtocolTexts, TaskId, TaskRecord, TaskStatus, Valuation};

/// All four store capabilities over one `RwLock<HashMap>`.
///
/// `fail_writes` turns every mutating call into a backend error so callers
/// can exercise their persistence-failure paths.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    valuations: RwLock<Vec<(i64, Valuation)>>,
    next_task_id: AtomicI64,
    next_valuation_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a task row.
    pub async fn record(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn valuations(&self) -> Vec<(i64, Valuation)> {
        self.valuations.read().await.clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    async fn update<F>(&self, id: TaskId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut TaskRecord) + Send,
    {
        self.check_writable()?;
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn read<T, F>(&self, id: TaskId, view: F) -> Result<T, StoreError>
    where
        F: FnOnce(&TaskRecord) -> T + Send,
    {
        let tasks = self.tasks.read().await;
        tasks.get(&id).map(view).ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl TaskStatusStore for MemoryTaskStore {
    async fn create_task(&self) -> Result<TaskId, StoreError> {
        self.check_writable()?;
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.tasks.write().await.insert(id, TaskRecord::new(id));
        Ok(id)
    }

    async fn get_status(&self, id: TaskId) -> Result<TaskStatus, StoreError> {
        self.read(id, |r| r.status).await
    }

    async fn compare_and_set_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status != expected {
            return Ok(false);
        }
        record.status = new;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        expected: TaskStatus,
        message: &str,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.status != expected {
            return Ok(false);
        }
        record.status = TaskStatus::Failed;
        record.error_message = Some(message.to_string());
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn get_error_message(&self, id: TaskId) -> Result<Option<String>, StoreError> {
        self.read(id, |r| r.error_message.clone()).await
    }
}

#[async_trait]
impl AudioLinkStore for MemoryTaskStore {
    async fn save_audio_link(&self, id: TaskId, link: &str) -> Result<(), StoreError> {
        let link = link.to_string();
        self.update(id, move |r| r.audio_link = Some(link)).await
    }

    async fn get_audio_link(&self, id: TaskId) -> Result<Option<String>, StoreError> {
        self.read(id, |r| r.audio_link.clone()).await
    }
}

#[async_trait]
impl ProtocolStore for MemoryTaskStore {
    async fn update_protocol_short(&self, id: TaskId, text: &str) -> Result<(), StoreError> {
        let text = text.to_string();
        self.update(id, move |r| r.protocol_short = text).await
    }

    async fn update_protocol_full(&self, id: TaskId, text: &str) -> Result<(), StoreError> {
        let text = text.to_string();
        self.update(id, move |r| r.protocol_full = text).await
    }

    async fn get_protocol(&self, id: TaskId) -> Result<ProtocolTexts, StoreError> {
        self.read(id, |r| ProtocolTexts {
            short: r.protocol_short.clone(),
            full: r.protocol_full.clone(),
        })
        .await
    }
}

#[async_trait]
impl FeedbackStore for MemoryTaskStore {
    async fn save_valuation(&self, valuation: &Valuation) -> Result<i64, StoreError> {
        self.check_writable()?;
        let id = self.next_valuation_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.valuations.write().await.push((id, valuation.clone()));
        Ok(id)
    }
}

//! Read-only task view for polling clients.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{bounded, PipelineError};
use crate::store::{ProtocolStore, StoreError, TaskStatusStore};
use crate::types::{TaskId, TaskStatus, TaskStatusReport};

#[derive(Clone)]
pub struct StatusReporter {
    statuses: Arc<dyn TaskStatusStore>,
    protocols: Arc<dyn ProtocolStore>,
    call_timeout: Duration,
}

impl StatusReporter {
    pub fn new(
        statuses: Arc<dyn TaskStatusStore>,
        protocols: Arc<dyn ProtocolStore>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            statuses,
            protocols,
            call_timeout,
        }
    }

    /// Protocol texts are included only for `finished` tasks, the error
    /// message only for `failed` ones.
    pub async fn report(&self, id: TaskId) -> Result<TaskStatusReport, PipelineError> {
        let status = self
            .call(id, "get_status", self.statuses.get_status(id))
            .await?;

        let mut report = TaskStatusReport {
            task_id: id,
            status,
            full_protocol: None,
            short_protocol: None,
            error_message: None,
        };

        match status {
            TaskStatus::Finished => {
                let texts = self
                    .call(id, "get_protocol", self.protocols.get_protocol(id))
                    .await?;
                report.full_protocol = Some(texts.full);
                report.short_protocol = Some(texts.short);
            }
            TaskStatus::Failed => {
                report.error_message = self
                    .call(id, "get_error_message", self.statuses.get_error_message(id))
                    .await?;
            }
            _ => {}
        }

        Ok(report)
    }

    async fn call<T>(
        &self,
        id: TaskId,
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, PipelineError> {
        bounded(self.call_timeout, StoreError::Timeout, fut)
            .await
            .map_err(|source| match source {
                StoreError::NotFound(_) => PipelineError::TaskNotFound(id),
                source => PipelineError::PersistenceFailed {
                    task_id: id,
                    operation,
                    source,
                },
            })
    }
}

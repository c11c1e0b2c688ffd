use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{BrokerChannel, BrokerConnector, BrokerError, RetryPolicy};
use crate::error::{bounded, PipelineError};
use crate::messages::{encode_payload, JSON_CONTENT_TYPE};

/// Shared broker handle: created once at startup, passed by `Arc`.
///
/// `publish` never retries; redelivery is the caller's decision. Connection
/// retries happen only in `run` / `reconnect`.
pub struct BrokerGateway {
    connector: Arc<dyn BrokerConnector>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    /// Serializes connection attempts so the supervisor and a manual
    /// reconnect never race each other.
    connecting: Mutex<()>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl BrokerGateway {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            channel: RwLock::new(None),
            connecting: Mutex::new(()),
            policy,
            call_timeout,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// One attempt to open a channel. Installs it on success.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let channel = bounded(self.call_timeout, BrokerError::Timeout, self.connector.connect()).await?;
        *self.channel.write().await = Some(channel);
        Ok(())
    }

    /// Retry `connect` under the policy. Fatal at startup when exhausted.
    pub async fn run(&self) -> Result<(), PipelineError> {
        let _guard = self.connecting.lock().await;
        self.run_locked().await
    }

    async fn run_locked(&self) -> Result<(), PipelineError> {
        let mut last_error = BrokerError::NotReady;
        for attempt in 1..=self.policy.max_attempts {
            match self.connect().await {
                Ok(()) => {
                    tracing::info!(attempt, "Broker channel established");
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = e;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        tracing::error!(
            attempts = self.policy.max_attempts,
            error = %last_error,
            "Broker connection attempts exhausted"
        );
        Err(PipelineError::ConnectivityExhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// Drop the current channel (if any) and run the retry policy again.
    pub async fn reconnect(&self) -> Result<(), PipelineError> {
        let _guard = self.connecting.lock().await;
        if self.is_ready().await {
            // Someone else reconnected while we waited for the guard.
            return Ok(());
        }
        if let Some(old) = self.channel.write().await.take() {
            old.close().await;
        }
        self.run_locked().await
    }

    pub async fn is_ready(&self) -> bool {
        self.channel
            .read()
            .await
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Declare `queue` durable, then publish `payload` persistently.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let channel = self
            .channel
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
            .ok_or(BrokerError::NotReady)?;

        bounded(
            self.call_timeout,
            BrokerError::Timeout,
            channel.declare_durable(queue),
        )
        .await?;
        bounded(
            self.call_timeout,
            BrokerError::Timeout,
            channel.publish_persistent(queue, payload, JSON_CONTENT_TYPE),
        )
        .await?;

        tracing::debug!(queue, bytes = payload.len(), "Published stage request");
        Ok(())
    }

    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        queue: &str,
        message: &T,
    ) -> Result<(), BrokerError> {
        let payload = encode_payload(message)?;
        self.publish(queue, &payload).await
    }

    pub async fn stop(&self) {
        if let Some(channel) = self.channel.write().await.take() {
            channel.close().await;
            tracing::info!("Broker channel closed");
        }
    }
}

//! Broker Gateway: resilient connection and at-least-once publish of stage
//! requests.
//!
//! The connection policy and message shaping live here; the transport sits
//! behind [`BrokerConnector`] / [`BrokerChannel`]:
//!
//! - [`MemoryBroker`]: in-process queues with fault injection, for tests and
//!   local runs.
//! - `PgQueueConnector` (feature `postgres`): durable queues stored in
//!   Postgres, consumed by the stage workers.

mod gateway;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod supervisor;

pub use gateway::BrokerGateway;
pub use memory::{Delivery, MemoryBroker};
#[cfg(feature = "postgres")]
pub use postgres::{PgQueueChannel, PgQueueConnector};
pub use supervisor::ConnectionSupervisor;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker channel is not ready")]
    NotReady,

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("declare of queue '{queue}' failed: {message}")]
    Declare { queue: String, message: String },

    #[error("publish to queue '{queue}' rejected: {message}")]
    Publish { queue: String, message: String },

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker call timed out after {0:?}")]
    Timeout(Duration),
}

/// Opens channels to a broker. One call is one connection attempt.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// An open channel. Implementations are internally synchronized.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare `queue` durable. Idempotent.
    async fn declare_durable(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish with persistent delivery mode.
    async fn publish_persistent(
        &self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

// ─── Retry policy ────────────────────────────────────────────────────────────

/// Bounded, linearly increasing retry schedule for connection attempts.
///
/// The delay after failed attempt `n` (1-based) is `n * backoff_step`, so the
/// default schedule waits 1s, 2s, 3s, 4s, 5s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_step,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// Sum of all delays when every attempt fails.
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts).map(|n| self.delay_for(n)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_secs(1),
        }
    }
}

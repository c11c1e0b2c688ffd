//! ConnectionSupervisor: background task that restores a dropped broker
//! channel at runtime.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::BrokerGateway;

/// Default interval between readiness checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub struct ConnectionSupervisor {
    gateway: Arc<BrokerGateway>,
    check_interval: Duration,
}

impl ConnectionSupervisor {
    pub fn new(gateway: Arc<BrokerGateway>, check_interval: Duration) -> Self {
        Self {
            gateway,
            check_interval,
        }
    }

    /// Run until the shutdown signal flips to `true`.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.check_interval.as_millis() as u64,
            "ConnectionSupervisor started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.check_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("ConnectionSupervisor shutting down (during sleep)");
                    break;
                }
            }
        }

        tracing::info!("ConnectionSupervisor stopped");
    }

    async fn check_once(&self) {
        if self.gateway.is_ready().await {
            return;
        }
        tracing::warn!("Broker channel lost, reconnecting");
        match self.gateway.reconnect().await {
            Ok(()) => tracing::info!("Broker channel restored"),
            // Exhaustion here is not fatal: publishes fail with NotReady until
            // a later check succeeds.
            Err(e) => tracing::error!(error = %e, "Broker reconnect failed"),
        }
    }
}

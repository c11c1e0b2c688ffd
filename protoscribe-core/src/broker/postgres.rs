//! Durable queues stored in Postgres.
//!
//! `broker_queues` records declared queues; `broker_messages` holds published
//! payloads until a stage worker claims them with `FOR UPDATE SKIP LOCKED`.
//! Queries are runtime-checked `sqlx::query()`; the tables come from `migrate`.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{BrokerChannel, BrokerConnector, BrokerError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS broker_queues (
        name        TEXT PRIMARY KEY,
        durable     BOOLEAN NOT NULL DEFAULT true,
        declared_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS broker_messages (
        id           BIGSERIAL PRIMARY KEY,
        queue        TEXT NOT NULL REFERENCES broker_queues(name),
        payload      BYTEA NOT NULL,
        content_type TEXT NOT NULL,
        persistent   BOOLEAN NOT NULL DEFAULT true,
        published_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        claimed_at   TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS broker_messages_unclaimed
        ON broker_messages (queue, id) WHERE claimed_at IS NULL
    "#,
];

pub struct PgQueueConnector {
    pool: PgPool,
}

impl PgQueueConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), BrokerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
        }
        tracing::info!("Broker queue schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for PgQueueConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Arc::new(PgQueueChannel {
            pool: self.pool.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

pub struct PgQueueChannel {
    pool: PgPool,
    open: AtomicBool,
}

#[async_trait]
impl BrokerChannel for PgQueueChannel {
    async fn declare_durable(&self, queue: &str) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO broker_queues (name, durable) VALUES ($1, true) ON CONFLICT (name) DO NOTHING",
        )
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(e, sqlx::Error::PoolClosed | sqlx::Error::Io(_)) {
                self.open.store(false, Ordering::SeqCst);
            }
            BrokerError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(())
    }

    async fn publish_persistent(
        &self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            INSERT INTO broker_messages (queue, payload, content_type, persistent)
            VALUES ($1, $2, $3, true)
            "#,
        )
        .bind(queue)
        .bind(payload)
        .bind(content_type)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(e, sqlx::Error::PoolClosed | sqlx::Error::Io(_)) {
                self.open.store(false, Ordering::SeqCst);
            }
            BrokerError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.pool.is_closed()
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

//! Postgres task store.
//!
//! All queries use runtime-checked `sqlx::query()` because the tables are
//! created by `migrate()` and may not exist when the crate is compiled.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::info;

use super::{AudioLinkStore, FeedbackStore, ProtocolStore, StoreError, TaskStatusStore};
use crate::types::{ProtocolTexts, TaskId, TaskStatus, Valuation};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id              BIGSERIAL PRIMARY KEY,
        task_status     TEXT NOT NULL DEFAULT 'none',
        audio_link      TEXT,
        protocol_short  TEXT NOT NULL DEFAULT '',
        protocol_full   TEXT NOT NULL DEFAULT '',
        error_message   TEXT,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS valuations (
        id                  BIGSERIAL PRIMARY KEY,
        usability           INTEGER NOT NULL,
        processing_speed    INTEGER NOT NULL,
        processing_quality  INTEGER NOT NULL,
        reuse_service       BOOLEAN NOT NULL,
        comment             TEXT NOT NULL DEFAULT '',
        created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `tasks` and `valuations` tables if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Task store schema is up to date");
        Ok(())
    }

    async fn require_exists(&self, id: TaskId) -> Result<(), StoreError> {
        let found = sqlx::query("SELECT 1 FROM tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        found.map(|_| ()).ok_or(StoreError::NotFound(id))
    }

    async fn update_text(&self, id: TaskId, sql: &str, text: &str) -> Result<(), StoreError> {
        let rows = sqlx::query(sql)
            .bind(id.get())
            .bind(text)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::parse(raw).ok_or_else(|| StoreError::Backend(format!("unknown task_status '{}'", raw)))
}

#[async_trait]
impl TaskStatusStore for PgTaskStore {
    async fn create_task(&self) -> Result<TaskId, StoreError> {
        let row = sqlx::query("INSERT INTO tasks DEFAULT VALUES RETURNING id")
            .fetch_one(&self.pool)
            .await?;
        let id: i64 = row.try_get("id")?;
        Ok(TaskId(id))
    }

    async fn get_status(&self, id: TaskId) -> Result<TaskStatus, StoreError> {
        let row = sqlx::query("SELECT task_status FROM tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let raw: String = row.try_get("task_status")?;
        parse_status(&raw)
    }

    async fn compare_and_set_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks SET task_status = $3, updated_at = now()
            WHERE id = $1 AND task_status = $2
            "#,
        )
        .bind(id.get())
        .bind(expected.as_str())
        .bind(new.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            self.require_exists(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        expected: TaskStatus,
        message: &str,
    ) -> Result<bool, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks SET task_status = 'failed', error_message = $3, updated_at = now()
            WHERE id = $1 AND task_status = $2
            "#,
        )
        .bind(id.get())
        .bind(expected.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            self.require_exists(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_error_message(&self, id: TaskId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT error_message FROM tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Ok(row.try_get("error_message")?)
    }
}

#[async_trait]
impl AudioLinkStore for PgTaskStore {
    async fn save_audio_link(&self, id: TaskId, link: &str) -> Result<(), StoreError> {
        self.update_text(
            id,
            "UPDATE tasks SET audio_link = $2, updated_at = now() WHERE id = $1",
            link,
        )
        .await
    }

    async fn get_audio_link(&self, id: TaskId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT audio_link FROM tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Ok(row.try_get("audio_link")?)
    }
}

#[async_trait]
impl ProtocolStore for PgTaskStore {
    async fn update_protocol_short(&self, id: TaskId, text: &str) -> Result<(), StoreError> {
        self.update_text(
            id,
            "UPDATE tasks SET protocol_short = $2, updated_at = now() WHERE id = $1",
            text,
        )
        .await
    }

    async fn update_protocol_full(&self, id: TaskId, text: &str) -> Result<(), StoreError> {
        self.update_text(
            id,
            "UPDATE tasks SET protocol_full = $2, updated_at = now() WHERE id = $1",
            text,
        )
        .await
    }

    async fn get_protocol(&self, id: TaskId) -> Result<ProtocolTexts, StoreError> {
        let row = sqlx::query("SELECT protocol_short, protocol_full FROM tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Ok(ProtocolTexts {
            short: row.try_get("protocol_short")?,
            full: row.try_get("protocol_full")?,
        })
    }
}

#[async_trait]
impl FeedbackStore for PgTaskStore {
    async fn save_valuation(&self, valuation: &Valuation) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO valuations
                (usability, processing_speed, processing_quality, reuse_service, comment)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(valuation.usability)
        .bind(valuation.processing_speed)
        .bind(valuation.processing_quality)
        .bind(valuation.reuse_service)
        .bind(&valuation.comment)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }
}

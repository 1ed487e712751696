//! Postgres-backed durable queue.
//!
//! Records live in `atelier_queue_jobs`. The singleton policy is enforced by
//! the database, not by the consumer: a partial unique index allows at most
//! one `active` row per singleton queue, and `fetch` skips the claim while one
//! exists. Two connections racing for the same queue therefore cannot both
//! activate a record; the loser sees a unique violation and reports "nothing
//! to fetch".
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Result |
//! |------------|----------------------|--------|
//! | Database (unique violation) in `fetch` | `23505` | `Ok(None)` |
//! | PoolClosed | N/A | `QueueError::Closed` |
//! | Other | Any | `QueueError::Backend` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use atelier_core::JobId;

use super::backend::{
    QueueBackend, QueueConnector, QueueError, QueuePolicy, QueueRecord, QueueRecordState,
};
use crate::credentials::Credential;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS atelier_queues (
    name        TEXT PRIMARY KEY,
    policy      TEXT NOT NULL CHECK (policy IN ('standard', 'singleton')),
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS atelier_queue_jobs (
    id            UUID PRIMARY KEY,
    queue         TEXT NOT NULL REFERENCES atelier_queues (name),
    state         TEXT NOT NULL CHECK (state IN ('created', 'active', 'completed', 'failed')),
    singleton     BOOLEAN NOT NULL DEFAULT FALSE,
    payload       JSONB NOT NULL,
    output        JSONB,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    started_at    TIMESTAMPTZ,
    completed_at  TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS atelier_queue_jobs_fetch_idx
    ON atelier_queue_jobs (queue, state, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS atelier_queue_jobs_singleton_idx
    ON atelier_queue_jobs (queue) WHERE state = 'active' AND singleton;
"#;

/// One pooled, authenticated connection to the queue database.
#[derive(Debug, Clone)]
pub struct PostgresQueue {
    pool: Arc<PgPool>,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn finish(
        &self,
        name: &str,
        id: JobId,
        state: QueueRecordState,
        outcome: Value,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE atelier_queue_jobs
            SET state = $3, output = $4, completed_at = now()
            WHERE queue = $1 AND id = $2 AND state = 'active'
            "#,
        )
        .bind(name)
        .bind(id.as_uuid())
        .bind(state.as_str())
        .bind(&outcome)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotActive {
                queue: name.to_owned(),
                id,
            });
        }
        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM atelier_queues WHERE name = $1) AS found")
            .bind(name)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queue_exists", e))?;
        row.try_get::<bool, _>("found")
            .map_err(|e| QueueError::Backend(e.to_string()))
    }
}

#[async_trait]
impl QueueBackend for PostgresQueue {
    async fn create_queue(&self, name: &str, policy: QueuePolicy) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO atelier_queues (name, policy)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(policy.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_queue", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn purge_stale(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM atelier_queue_jobs
            WHERE state IN ('created', 'active')
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_stale", e))?;
        Ok(result.rows_affected())
    }

    async fn send(&self, name: &str, id: JobId, payload: Value) -> Result<Option<JobId>, QueueError> {
        let row = sqlx::query(
            r#"
            INSERT INTO atelier_queue_jobs (id, queue, state, singleton, payload)
            SELECT $1, q.name, 'created', q.policy = 'singleton', $3
            FROM atelier_queues q
            WHERE q.name = $2
            ON CONFLICT (id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(name)
        .bind(&payload)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("send", e))?;

        let Some(row) = row else {
            // Nothing inserted: either a duplicate id or an undeclared queue.
            if self.queue_exists(name).await? {
                return Ok(None);
            }
            return Err(QueueError::UnknownQueue(name.to_owned()));
        };

        let stored: uuid::Uuid = row
            .try_get("id")
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(Some(JobId::from_uuid(stored)))
    }

    async fn fetch(&self, name: &str) -> Result<Option<QueueRecord>, QueueError> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT j.id
                FROM atelier_queue_jobs j
                WHERE j.queue = $1
                  AND j.state = 'created'
                  AND NOT (
                      j.singleton AND EXISTS (
                          SELECT 1 FROM atelier_queue_jobs a
                          WHERE a.queue = $1 AND a.state = 'active'
                      )
                  )
                ORDER BY j.created_at ASC, j.id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE atelier_queue_jobs q
            SET state = 'active', started_at = now()
            FROM next
            WHERE q.id = next.id
            RETURNING q.id, q.queue, q.payload, q.state, q.created_at, q.started_at
            "#,
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await;

        let row = match row {
            Ok(row) => row,
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                debug!(queue = name, "singleton slot taken by a concurrent fetch");
                return Ok(None);
            }
            Err(e) => return Err(map_sqlx_error("fetch", e)),
        };

        row.as_ref().map(record_from_row).transpose()
    }

    async fn complete(&self, name: &str, id: JobId, output: Value) -> Result<(), QueueError> {
        self.finish(name, id, QueueRecordState::Completed, output).await
    }

    async fn fail(&self, name: &str, id: JobId, reason: Value) -> Result<(), QueueError> {
        self.finish(name, id, QueueRecordState::Failed, reason).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &PgRow) -> Result<QueueRecord, QueueError> {
    let decode = |e: sqlx::Error| QueueError::Backend(format!("failed to decode queue row: {e}"));

    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let queue: String = row.try_get("queue").map_err(decode)?;
    let payload: Value = row.try_get("payload").map_err(decode)?;
    let state: String = row.try_get("state").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(decode)?;

    let state = match state.as_str() {
        "created" => QueueRecordState::Created,
        "active" => QueueRecordState::Active,
        "completed" => QueueRecordState::Completed,
        "failed" => QueueRecordState::Failed,
        other => return Err(QueueError::Backend(format!("unknown record state: {other}"))),
    };

    Ok(QueueRecord {
        id: JobId::from_uuid(id),
        queue,
        payload,
        state,
        created_at,
        started_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::PoolClosed => QueueError::Closed,
        sqlx::Error::Database(db_err) => {
            QueueError::Backend(format!("database error in {}: {}", operation, db_err.message()))
        }
        other => QueueError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

/// Opens a fresh connection pool per call, using the credential token as the
/// database password when one is given.
#[derive(Debug, Clone)]
pub struct PostgresQueueConnector {
    options: PgConnectOptions,
    max_connections: u32,
}

impl PostgresQueueConnector {
    pub fn from_url(url: &str) -> Result<Self, QueueError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| QueueError::Connect(format!("invalid database url: {e}")))?;
        Ok(Self {
            options,
            max_connections: 10,
        })
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

#[async_trait]
impl QueueConnector for PostgresQueueConnector {
    async fn connect(
        &self,
        credential: Option<&Credential>,
    ) -> Result<Arc<dyn QueueBackend>, QueueError> {
        let mut options = self.options.clone();
        if let Some(credential) = credential {
            options = options.password(credential.token());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        let queue = PostgresQueue::new(pool);
        queue.ensure_schema().await?;
        Ok(Arc::new(queue))
    }
}

//! Postgres-backed task store.
//!
//! Updates run inside a transaction that locks the row (`FOR UPDATE`), applies
//! the domain transition rules in memory and writes the result back, so two
//! concurrent updates cannot both move the same task.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskStoreError |
//! |------------|----------------------|----------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (check constraint violation) | `23514` | `InvalidTransition` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use atelier_core::{JobId, JobKind, RoomId, Task, TaskError, TaskStatus, TaskUpdate, UserId};

use super::r#trait::{TaskStore, TaskStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS atelier_tasks (
    job_id      UUID PRIMARY KEY,
    kind        TEXT NOT NULL,
    room_id     TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('created', 'active', 'completed', 'failed')),
    opened      BOOLEAN NOT NULL DEFAULT FALSE,
    metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
    error       JSONB,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS atelier_tasks_room_idx ON atelier_tasks (room_id, created_at);
"#;

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the task table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(None, "ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(job_id = %task.job_id, kind = %task.kind), err)]
    async fn create_task(&self, task: Task) -> Result<(), TaskStoreError> {
        let job_id = task.job_id;
        sqlx::query(
            r#"
            INSERT INTO atelier_tasks
                (job_id, kind, room_id, user_id, status, opened, metadata, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(task.job_id.as_uuid())
        .bind(task.kind.as_str())
        .bind(task.room_id.as_str())
        .bind(task.user_id.as_str())
        .bind(task.status.as_str())
        .bind(task.opened)
        .bind(&task.metadata)
        .bind(encode_error(task.error.as_ref())?)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(Some(job_id), "create_task", e))?;
        Ok(())
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, status = ?update.status), err)]
    async fn update_task(&self, job_id: JobId, update: TaskUpdate) -> Result<Task, TaskStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(Some(job_id), "update_task.begin", e))?;

        let row = sqlx::query(
            r#"
            SELECT job_id, kind, room_id, user_id, status, opened, metadata, error, created_at, updated_at
            FROM atelier_tasks
            WHERE job_id = $1
            FOR UPDATE
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(Some(job_id), "update_task.select", e))?
        .ok_or(TaskStoreError::NotFound(job_id))?;

        let mut task = task_from_row(&row)?;
        task.apply(&update, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE atelier_tasks
            SET status = $2, opened = $3, metadata = $4, error = $5, updated_at = $6
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(task.status.as_str())
        .bind(task.opened)
        .bind(&task.metadata)
        .bind(encode_error(task.error.as_ref())?)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(Some(job_id), "update_task.update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(Some(job_id), "update_task.commit", e))?;
        Ok(task)
    }

    async fn get_task(&self, job_id: JobId) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, kind, room_id, user_id, status, opened, metadata, error, created_at, updated_at
            FROM atelier_tasks
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(Some(job_id), "get_task", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_room_tasks(&self, room_id: &RoomId) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, kind, room_id, user_id, status, opened, metadata, error, created_at, updated_at
            FROM atelier_tasks
            WHERE room_id = $1
            ORDER BY created_at ASC, job_id ASC
            "#,
        )
        .bind(room_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(None, "list_room_tasks", e))?;

        rows.iter().map(task_from_row).collect()
    }
}

fn encode_error(error: Option<&TaskError>) -> Result<Option<serde_json::Value>, TaskStoreError> {
    error
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| TaskStoreError::Storage(format!("failed to encode task error: {e}")))
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task, TaskStoreError> {
    let decode = |e: sqlx::Error| TaskStoreError::Storage(format!("failed to decode task row: {e}"));

    let job_id: uuid::Uuid = row.try_get("job_id").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;
    let room_id: String = row.try_get("room_id").map_err(decode)?;
    let user_id: String = row.try_get("user_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let opened: bool = row.try_get("opened").map_err(decode)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(decode)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    let kind: JobKind = kind
        .parse()
        .map_err(|e| TaskStoreError::Storage(format!("stored task {job_id}: {e}")))?;
    let status: TaskStatus = status
        .parse()
        .map_err(|e| TaskStoreError::Storage(format!("stored task {job_id}: {e}")))?;
    let error: Option<TaskError> = error
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| TaskStoreError::Storage(format!("stored task {job_id}: bad error column: {e}")))?;

    Ok(Task {
        job_id: JobId::from_uuid(job_id),
        kind,
        room_id: RoomId::new(room_id),
        user_id: UserId::new(user_id),
        status,
        opened,
        metadata,
        error,
        created_at,
        updated_at,
    })
}

fn map_sqlx_error(job_id: Option<JobId>, operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match (db_err.code().as_deref(), job_id) {
                (Some("23505"), Some(id)) => TaskStoreError::AlreadyExists(id),
                (Some("23514"), _) => TaskStoreError::InvalidTransition(msg),
                _ => TaskStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => TaskStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

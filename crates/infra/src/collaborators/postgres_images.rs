//! Postgres-backed image rows, shared by every process pointed at the same
//! database.
//!
//! Inserts use the primary key to refuse ids that are already taken
//! (`23505` maps to `CollaboratorError::Conflict`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use atelier_core::{ImageId, RoomId, UserId};

use super::CollaboratorError;
use super::images::{ImageRecord, ImageStatus, ImageStore, RemovalStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS atelier_images (
    id               TEXT PRIMARY KEY,
    room_id          TEXT NOT NULL,
    user_id          TEXT NOT NULL,
    status           TEXT NOT NULL CHECK (status IN ('working', 'ready', 'failed')),
    removal_status   TEXT CHECK (removal_status IN ('working', 'failed')),
    blob_key         TEXT,
    source_image_id  TEXT,
    created_at       TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS atelier_images_room_idx ON atelier_images (room_id, created_at);
"#;

const COLUMNS: &str = "id, room_id, user_id, status, removal_status, blob_key, source_image_id, created_at";

#[derive(Debug, Clone)]
pub struct PostgresImageStore {
    pool: Arc<PgPool>,
}

impl PostgresImageStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the image table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), CollaboratorError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl ImageStore for PostgresImageStore {
    #[instrument(skip(self, record), fields(image_id = %record.id, room_id = %record.room_id), err)]
    async fn insert(&self, record: ImageRecord) -> Result<(), CollaboratorError> {
        let result = sqlx::query(
            r#"
            INSERT INTO atelier_images
                (id, room_id, user_id, status, removal_status, blob_key, source_image_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.room_id.as_str())
        .bind(record.user_id.as_str())
        .bind(status_str(record.status))
        .bind(record.removal_status.map(removal_str))
        .bind(record.blob_key.as_deref())
        .bind(record.source_image_id.as_ref().map(ImageId::as_str))
        .bind(record.created_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(CollaboratorError::Conflict(format!("image {}", record.id)))
            }
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    async fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>, CollaboratorError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM atelier_images WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn set_status(
        &self,
        id: &ImageId,
        status: ImageStatus,
        blob_key: Option<String>,
    ) -> Result<(), CollaboratorError> {
        let result = sqlx::query(
            "UPDATE atelier_images SET status = $2, blob_key = COALESCE($3, blob_key) WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(status_str(status))
        .bind(blob_key)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_status", e))?;
        expect_row(id, result.rows_affected())
    }

    async fn set_removal_status(
        &self,
        id: &ImageId,
        removal_status: Option<RemovalStatus>,
    ) -> Result<(), CollaboratorError> {
        let result = sqlx::query("UPDATE atelier_images SET removal_status = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(removal_status.map(removal_str))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_removal_status", e))?;
        expect_row(id, result.rows_affected())
    }

    async fn delete(&self, id: &ImageId) -> Result<bool, CollaboratorError> {
        let result = sqlx::query("DELETE FROM atelier_images WHERE id = $1")
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_room(&self, room_id: &RoomId) -> Result<Vec<ImageRecord>, CollaboratorError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM atelier_images WHERE room_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(room_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_room", e))?;
        rows.iter().map(record_from_row).collect()
    }
}

fn expect_row(id: &ImageId, rows_affected: u64) -> Result<(), CollaboratorError> {
    if rows_affected == 0 {
        return Err(CollaboratorError::NotFound(format!("image {id}")));
    }
    Ok(())
}

fn status_str(status: ImageStatus) -> &'static str {
    match status {
        ImageStatus::Working => "working",
        ImageStatus::Ready => "ready",
        ImageStatus::Failed => "failed",
    }
}

fn parse_status(raw: &str) -> Result<ImageStatus, CollaboratorError> {
    match raw {
        "working" => Ok(ImageStatus::Working),
        "ready" => Ok(ImageStatus::Ready),
        "failed" => Ok(ImageStatus::Failed),
        other => Err(CollaboratorError::Io(format!("unknown image status: {other}"))),
    }
}

fn removal_str(status: RemovalStatus) -> &'static str {
    match status {
        RemovalStatus::Working => "working",
        RemovalStatus::Failed => "failed",
    }
}

fn parse_removal(raw: &str) -> Result<RemovalStatus, CollaboratorError> {
    match raw {
        "working" => Ok(RemovalStatus::Working),
        "failed" => Ok(RemovalStatus::Failed),
        other => Err(CollaboratorError::Io(format!("unknown removal status: {other}"))),
    }
}

fn record_from_row(row: &PgRow) -> Result<ImageRecord, CollaboratorError> {
    let decode = |e: sqlx::Error| CollaboratorError::Io(format!("failed to decode image row: {e}"));

    let id: String = row.try_get("id").map_err(decode)?;
    let room_id: String = row.try_get("room_id").map_err(decode)?;
    let user_id: String = row.try_get("user_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let removal_status: Option<String> = row.try_get("removal_status").map_err(decode)?;
    let blob_key: Option<String> = row.try_get("blob_key").map_err(decode)?;
    let source_image_id: Option<String> = row.try_get("source_image_id").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    Ok(ImageRecord {
        id: ImageId::new(id),
        room_id: RoomId::new(room_id),
        user_id: UserId::new(user_id),
        status: parse_status(&status)?,
        removal_status: removal_status.as_deref().map(parse_removal).transpose()?,
        blob_key,
        source_image_id: source_image_id.map(ImageId::new),
        created_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CollaboratorError {
    match err {
        sqlx::Error::Database(db_err) => {
            CollaboratorError::Io(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => CollaboratorError::Io(format!("connection pool closed in {operation}")),
        other => CollaboratorError::Io(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_columns_match_the_serde_names() {
        for status in [ImageStatus::Working, ImageStatus::Ready, ImageStatus::Failed] {
            let serde_name = serde_json::to_value(status).unwrap();
            assert_eq!(serde_name, status_str(status));
            assert_eq!(parse_status(status_str(status)).unwrap(), status);
        }
        for status in [RemovalStatus::Working, RemovalStatus::Failed] {
            assert_eq!(serde_json::to_value(status).unwrap(), removal_str(status));
            assert_eq!(parse_removal(removal_str(status)).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        assert!(matches!(parse_status("deleted"), Err(CollaboratorError::Io(_))));
        assert!(matches!(parse_removal("ready"), Err(CollaboratorError::Io(_))));
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use atelier_core::JobId;

use crate::credentials::Credential;

/// How many records of one queue may be active at the same time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// No limit; every queued record may be fetched immediately.
    Standard,
    /// At most one record is active; later submissions are accepted and
    /// wait until the active one is completed or failed.
    Singleton,
}

impl QueuePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePolicy::Standard => "standard",
            QueuePolicy::Singleton => "singleton",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueRecordState {
    Created,
    Active,
    Completed,
    Failed,
}

impl QueueRecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueRecordState::Created => "created",
            QueueRecordState::Active => "active",
            QueueRecordState::Completed => "completed",
            QueueRecordState::Failed => "failed",
        }
    }
}

/// A unit of work as stored by the queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: JobId,
    pub queue: String,
    pub payload: Value,
    pub state: QueueRecordState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue not declared: {0}")]
    UnknownQueue(String),

    #[error("record {id} is not active on queue {queue}")]
    NotActive { queue: String, id: JobId },

    #[error("queue connection closed")]
    Closed,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// One authenticated connection to a durable queue backend.
///
/// The job core only relies on this contract; `fetch` plus the manager's
/// polling loop is how consumers "work" a queue. Acks (`complete` / `fail`)
/// must go through the connection the record was fetched on.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Declare a queue. Idempotent; re-declaring keeps the first policy.
    async fn create_queue(&self, name: &str, policy: QueuePolicy) -> Result<(), QueueError>;

    /// Drop records left `created`/`active` by a previous process.
    /// Returns the number of purged records.
    async fn purge_stale(&self) -> Result<u64, QueueError>;

    /// Enqueue `payload` under the proposed `id`. Returns the stored id, or
    /// `None` when the backend declined the record.
    async fn send(&self, name: &str, id: JobId, payload: Value) -> Result<Option<JobId>, QueueError>;

    /// Claim the next eligible record, honoring the queue policy.
    async fn fetch(&self, name: &str) -> Result<Option<QueueRecord>, QueueError>;

    async fn complete(&self, name: &str, id: JobId, output: Value) -> Result<(), QueueError>;

    async fn fail(&self, name: &str, id: JobId, reason: Value) -> Result<(), QueueError>;

    /// Close the connection. Further calls fail with `QueueError::Closed`.
    async fn close(&self);
}

/// Builds fresh backend connections, optionally authenticated with a
/// short-lived credential.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(
        &self,
        credential: Option<&Credential>,
    ) -> Result<Arc<dyn QueueBackend>, QueueError>;
}

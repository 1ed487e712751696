//! Per-kind job definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use atelier_core::{JobId, JobKind, RoomId, UserId};

use crate::error::JobError;
use crate::queue::QueuePolicy;

/// Who submitted a job, and which room observes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOwner {
    pub room_id: RoomId,
    pub user_id: UserId,
}

impl JobOwner {
    pub fn new(room_id: impl Into<RoomId>, user_id: impl Into<UserId>) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Identity of the job a hook runs for.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub kind: JobKind,
    pub owner: JobOwner,
}

/// What one kind of job does. The generic
/// [`JobHandler`](super::handler::JobHandler) drives the lifecycle; a spec
/// only supplies the kind-specific steps.
///
/// Hook order:
///
/// - submission: `validate` → `prepare` → (task row, enqueue)
/// - processing: `execute` → `on_success`, or `on_failure` when any step
///   (including enqueueing) fails
#[async_trait]
pub trait JobSpec: Send + Sync + 'static {
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Send + 'static;

    fn kind(&self) -> JobKind;

    fn policy(&self) -> QueuePolicy {
        QueuePolicy::Singleton
    }

    /// Synchronous submission check. A rejection creates no task row.
    fn validate(&self, _owner: &JobOwner, _payload: &Self::Payload) -> Result<(), JobError> {
        Ok(())
    }

    /// Derive output ids and write placeholder rows before the task exists.
    /// Returns the task's initial metadata.
    async fn prepare(&self, _ctx: &JobContext, _payload: &mut Self::Payload) -> Result<Value, JobError> {
        Ok(Value::Null)
    }

    async fn execute(&self, ctx: &JobContext, payload: &Self::Payload) -> Result<Self::Output, JobError>;

    /// Persist the output. Returns metadata merged into the completed task.
    async fn on_success(
        &self,
        ctx: &JobContext,
        payload: &Self::Payload,
        output: Self::Output,
    ) -> Result<Value, JobError>;

    /// Roll placeholder or referencing rows to their failed state.
    async fn on_failure(
        &self,
        _ctx: &JobContext,
        _payload: &Self::Payload,
        _error: &JobError,
    ) -> Result<(), JobError> {
        Ok(())
    }
}

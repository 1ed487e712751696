use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use atelier_core::{DomainError, JobId, RoomId, Task, TaskUpdate};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(JobId),

    #[error("task already exists: {0}")]
    AlreadyExists(JobId),

    /// The update would move the task backwards or skip a state.
    #[error("{0}")]
    InvalidTransition(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for TaskStoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition(msg) => TaskStoreError::InvalidTransition(msg),
            other => TaskStoreError::Storage(other.to_string()),
        }
    }
}

/// Persistence boundary for [`Task`] rows.
///
/// Implementations must enforce the forward-only lifecycle on
/// `update_task`; a rejected update leaves the stored row unchanged.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `AlreadyExists` on a duplicate job id.
    async fn create_task(&self, task: Task) -> Result<(), TaskStoreError>;

    /// Apply a partial update and return the stored result.
    async fn update_task(&self, job_id: JobId, update: TaskUpdate) -> Result<Task, TaskStoreError>;

    async fn get_task(&self, job_id: JobId) -> Result<Option<Task>, TaskStoreError>;

    /// Tasks of one room, oldest first.
    async fn list_room_tasks(&self, room_id: &RoomId) -> Result<Vec<Task>, TaskStoreError>;
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn create_task(&self, task: Task) -> Result<(), TaskStoreError> {
        (**self).create_task(task).await
    }

    async fn update_task(&self, job_id: JobId, update: TaskUpdate) -> Result<Task, TaskStoreError> {
        (**self).update_task(job_id, update).await
    }

    async fn get_task(&self, job_id: JobId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get_task(job_id).await
    }

    async fn list_room_tasks(&self, room_id: &RoomId) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list_room_tasks(room_id).await
    }
}

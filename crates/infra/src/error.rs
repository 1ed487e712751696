//! Job-level error taxonomy.
//!
//! Every failure a job can hit is one `JobError`. Submission-time errors are
//! returned to the caller of `start`; execution-time errors are recorded on the
//! task (see [`JobError::to_task_error`]) and broadcast with the `failed`
//! notification. Only a credential failure during rotation stops intake.

use std::time::Duration;

use thiserror::Error;

use atelier_core::{DomainError, JobId, ParseJobKindError, TaskError};

use crate::credentials::CredentialError;
use crate::queue::QueueError;
use crate::task_store::TaskStoreError;
use crate::worker_pool::WorkerExecutionError;

#[derive(Debug, Error)]
pub enum JobError {
    /// No handler is registered for the requested kind.
    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    /// The payload was rejected at submission time.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The queue refused or failed to store the record.
    #[error("queue submission to {queue} failed: {reason}")]
    QueueSubmissionFailed { queue: String, reason: String },

    #[error("worker script {script} failed: {cause}")]
    WorkerExecutionFailed {
        script: String,
        cause: WorkerExecutionError,
    },

    #[error("worker script {script} timed out after {after:?}")]
    WorkerTimeout { script: String, after: Duration },

    /// No fresh backend credential could be obtained.
    #[error("credential acquisition failed: {0}")]
    CredentialAcquisitionFailed(String),

    #[error("task not found: {0}")]
    TaskNotFound(JobId),

    /// A resource the job operates on (image, blob, room) is missing.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// An external collaborator (blob storage, generation API, ...) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// The queued payload could not be encoded or decoded.
    #[error("invalid job payload: {0}")]
    Payload(String),

    /// A job hook panicked; the job is failed and the consumer carries on.
    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("task store error: {0}")]
    TaskStore(TaskStoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    pub fn resource_not_found(msg: impl Into<String>) -> Self {
        Self::ResourceNotFound(msg.into())
    }

    /// Stable, machine-readable name of the error class.
    pub fn name(&self) -> &'static str {
        match self {
            JobError::UnknownJobKind(_) => "UnknownJobKind",
            JobError::Validation(_) => "ValidationError",
            JobError::QueueSubmissionFailed { .. } => "QueueSubmissionFailed",
            JobError::WorkerExecutionFailed { .. } => "WorkerExecutionFailed",
            JobError::WorkerTimeout { .. } => "WorkerTimeout",
            JobError::CredentialAcquisitionFailed(_) => "CredentialAcquisitionFailed",
            JobError::TaskNotFound(_) => "TaskNotFound",
            JobError::ResourceNotFound(_) => "ResourceNotFound",
            JobError::Collaborator(_) => "CollaboratorError",
            JobError::Payload(_) => "PayloadError",
            JobError::Panicked(_) => "JobPanicked",
            JobError::TaskStore(_) => "TaskStoreError",
            JobError::Queue(_) => "QueueError",
        }
    }

    /// The `{name, message}` pair persisted on a failed task.
    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(self.name(), self.to_string())
    }
}

impl From<DomainError> for JobError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::Validation(msg),
            DomainError::InvalidTransition(msg) => {
                JobError::TaskStore(TaskStoreError::InvalidTransition(msg))
            }
        }
    }
}

impl From<TaskStoreError> for JobError {
    fn from(value: TaskStoreError) -> Self {
        match value {
            TaskStoreError::NotFound(id) => JobError::TaskNotFound(id),
            other => JobError::TaskStore(other),
        }
    }
}

impl From<ParseJobKindError> for JobError {
    fn from(value: ParseJobKindError) -> Self {
        JobError::UnknownJobKind(value.0)
    }
}

impl From<CredentialError> for JobError {
    fn from(value: CredentialError) -> Self {
        JobError::CredentialAcquisitionFailed(value.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(value: serde_json::Error) -> Self {
        JobError::Payload(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_pool::WorkerFailure;

    #[test]
    fn missing_task_maps_to_task_not_found() {
        let id = JobId::new();
        let err: JobError = TaskStoreError::NotFound(id).into();
        assert!(matches!(err, JobError::TaskNotFound(found) if found == id));
    }

    #[test]
    fn task_error_carries_class_and_message() {
        let err = JobError::WorkerExecutionFailed {
            script: "flip-image".into(),
            cause: WorkerExecutionError::Transform(WorkerFailure::new("DecodeError", "bad header")),
        };
        let task_error = err.to_task_error();
        assert_eq!(task_error.name, "WorkerExecutionFailed");
        assert!(task_error.message.contains("DecodeError: bad header"));
    }

    #[test]
    fn unknown_kind_name_is_preserved() {
        let err: JobError = "resize-video".parse::<atelier_core::JobKind>().unwrap_err().into();
        assert_eq!(err.to_string(), "unknown job kind: resize-video");
    }
}

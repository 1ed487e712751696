use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use atelier_core::{JobId, JobKind, RoomId, Task, TaskError, TaskStatus, UserId};

/// Lifecycle notification broadcast to a room whenever a task changes status.
///
/// Notes:
/// - `metadata` mirrors the task metadata at the time of the change, so
///   clients can locate produced resources without a round trip.
/// - `error` is only present on `failed` notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    job_id: JobId,
    kind: JobKind,
    room_id: RoomId,
    user_id: UserId,
    status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
    metadata: Value,
    occurred_at: DateTime<Utc>,
}

impl JobNotification {
    /// Snapshot of `task` as of `occurred_at`.
    pub fn from_task(task: &Task, occurred_at: DateTime<Utc>) -> Self {
        Self {
            job_id: task.job_id,
            kind: task.kind,
            room_id: task.room_id.clone(),
            user_id: task.user_id.clone(),
            status: task.status,
            error: task.error.clone(),
            metadata: task.metadata.clone(),
            occurred_at,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_notification_carries_reason_on_the_wire() {
        let mut task = Task::new(
            JobId::new(),
            JobKind::FlipImage,
            RoomId::from("room1"),
            UserId::from("user1"),
            json!({}),
            Utc::now(),
        );
        task.status = TaskStatus::Failed;
        task.error = Some(TaskError::new("WorkerExecutionFailed", "bad input"));

        let wire = serde_json::to_value(JobNotification::from_task(&task, Utc::now())).unwrap();
        assert_eq!(wire["status"], "failed");
        assert_eq!(wire["kind"], "flip-image");
        assert_eq!(wire["error"]["name"], "WorkerExecutionFailed");
    }

    #[test]
    fn error_is_omitted_when_absent() {
        let task = Task::new(
            JobId::new(),
            JobKind::ExportPdf,
            RoomId::from("room1"),
            UserId::from("user1"),
            json!({ "export_id": "e1" }),
            Utc::now(),
        );
        let wire = serde_json::to_value(JobNotification::from_task(&task, Utc::now())).unwrap();
        assert!(wire.get("error").is_none());
        assert_eq!(wire["metadata"]["export_id"], "e1");
    }
}

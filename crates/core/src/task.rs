//! Task: the durable, user-visible record of one job's lifecycle.
//!
//! A task is created when a job is submitted and moves strictly forward:
//!
//! ```text
//! created -> active -> completed
//!                   -> failed
//! ```
//!
//! The `opened` flag is orthogonal to status; the API layer sets it once a
//! user has looked at the result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, RoomId, UserId};
use crate::job_kind::JobKind;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether `self -> next` is a forward step of the lifecycle.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Created, TaskStatus::Active)
                | (TaskStatus::Active, TaskStatus::Completed)
                | (TaskStatus::Active, TaskStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "active" => Ok(TaskStatus::Active),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(DomainError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Error reason recorded on a failed task and carried by `failed`
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub name: String,
    pub message: String,
}

impl TaskError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub job_id: JobId,
    pub kind: JobKind,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub status: TaskStatus,
    pub opened: bool,
    /// Kind-specific JSON object (ids of produced resources, blob keys, ...).
    pub metadata: Value,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A freshly submitted task, in `created` status.
    pub fn new(
        job_id: JobId,
        kind: JobKind,
        room_id: RoomId,
        user_id: UserId,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            kind,
            room_id,
            user_id,
            status: TaskStatus::Created,
            opened: false,
            metadata: normalize_metadata(metadata),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update, enforcing forward-only status moves.
    ///
    /// Re-applying the current status is accepted so that field-only updates
    /// can carry it along; any other non-forward move is rejected and leaves
    /// the task untouched.
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(next) = update.status {
            if next != self.status && !self.status.can_transition_to(next) {
                return Err(DomainError::invalid_transition(format!(
                    "task {}: {} -> {}",
                    self.job_id, self.status, next
                )));
            }
        }

        if let Some(next) = update.status {
            self.status = next;
        }
        if let Some(metadata) = &update.metadata {
            merge_metadata(&mut self.metadata, metadata);
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if let Some(opened) = update.opened {
            self.opened = opened;
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial task update. Absent fields are left unchanged; `metadata` is
/// shallow-merged into the existing object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub metadata: Option<Value>,
    pub error: Option<TaskError>,
    pub opened: Option<bool>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn opened() -> Self {
        Self {
            opened: Some(true),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }
}

fn normalize_metadata(metadata: Value) -> Value {
    match metadata {
        Value::Object(_) => metadata,
        Value::Null => Value::Object(Map::new()),
        other => {
            let mut map = Map::new();
            map.insert("value".to_owned(), other);
            Value::Object(map)
        }
    }
}

/// Shallow merge of `patch` into `target`. Non-object patches replace the
/// whole value.
pub fn merge_metadata(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *target = normalize_metadata(patch.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn test_task() -> Task {
        Task::new(
            JobId::new(),
            JobKind::DeleteImage,
            RoomId::from("room1"),
            UserId::from("user1"),
            json!({ "image_id": "img1" }),
            Utc::now(),
        )
    }

    #[test]
    fn new_task_starts_created_and_unopened() {
        let task = test_task();
        assert_eq!(task.status, TaskStatus::Created);
        assert!(!task.opened);
        assert!(task.error.is_none());
    }

    #[test]
    fn cannot_skip_active() {
        let mut task = test_task();
        let err = task
            .apply(&TaskUpdate::status(TaskStatus::Completed), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(task.status, TaskStatus::Created);
    }

    #[test]
    fn terminal_tasks_do_not_move_back() {
        let mut task = test_task();
        task.apply(&TaskUpdate::status(TaskStatus::Active), Utc::now())
            .unwrap();
        task.apply(&TaskUpdate::status(TaskStatus::Failed), Utc::now())
            .unwrap();

        for next in [TaskStatus::Created, TaskStatus::Active, TaskStatus::Completed] {
            assert!(task.apply(&TaskUpdate::status(next), Utc::now()).is_err());
        }
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn metadata_is_merged_not_replaced() {
        let mut task = test_task();
        task.apply(
            &TaskUpdate::status(TaskStatus::Active).with_metadata(json!({ "blob_key": "k" })),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(task.metadata, json!({ "image_id": "img1", "blob_key": "k" }));
    }

    #[test]
    fn opened_is_independent_of_status() {
        let mut task = test_task();
        task.apply(&TaskUpdate::opened(), Utc::now()).unwrap();
        assert!(task.opened);
        assert_eq!(task.status, TaskStatus::Created);
    }

    #[test]
    fn failure_records_error_reason() {
        let mut task = test_task();
        task.apply(&TaskUpdate::status(TaskStatus::Active), Utc::now())
            .unwrap();
        task.apply(
            &TaskUpdate::status(TaskStatus::Failed)
                .with_error(TaskError::new("WorkerTimeout", "timed out")),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(task.error.as_ref().unwrap().name, "WorkerTimeout");
    }

    fn any_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Created),
            Just(TaskStatus::Active),
            Just(TaskStatus::Completed),
            Just(TaskStatus::Failed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of updates is attempted, the observed
        /// status history is a prefix of created→active→completed or
        /// created→active→failed.
        #[test]
        fn observed_history_is_a_forward_prefix(
            attempts in prop::collection::vec(any_status(), 0..16)
        ) {
            let mut task = test_task();
            let mut history = vec![task.status];

            for next in attempts {
                if task.apply(&TaskUpdate::status(next), Utc::now()).is_ok()
                    && history.last() != Some(&task.status)
                {
                    history.push(task.status);
                }
            }

            let completed = [TaskStatus::Created, TaskStatus::Active, TaskStatus::Completed];
            let failed = [TaskStatus::Created, TaskStatus::Active, TaskStatus::Failed];
            prop_assert!(
                completed.starts_with(&history) || failed.starts_with(&history),
                "unexpected history {:?}",
                history
            );
        }
    }
}

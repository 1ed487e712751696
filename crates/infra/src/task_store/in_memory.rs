//! In-memory task store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use atelier_core::{JobId, RoomId, Task, TaskUpdate};

use super::r#trait::{TaskStore, TaskStoreError};

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<JobId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> TaskStoreError {
    TaskStoreError::Storage("task store lock poisoned".to_owned())
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: Task) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(|_| poisoned())?;
        if tasks.contains_key(&task.job_id) {
            return Err(TaskStoreError::AlreadyExists(task.job_id));
        }
        tasks.insert(task.job_id, task);
        Ok(())
    }

    async fn update_task(&self, job_id: JobId, update: TaskUpdate) -> Result<Task, TaskStoreError> {
        let mut tasks = self.tasks.write().map_err(|_| poisoned())?;
        let task = tasks
            .get_mut(&job_id)
            .ok_or(TaskStoreError::NotFound(job_id))?;

        // Apply to a copy so a rejected transition leaves the row untouched.
        let mut next = task.clone();
        next.apply(&update, Utc::now())?;
        *task = next.clone();
        Ok(next)
    }

    async fn get_task(&self, job_id: JobId) -> Result<Option<Task>, TaskStoreError> {
        let tasks = self.tasks.read().map_err(|_| poisoned())?;
        Ok(tasks.get(&job_id).cloned())
    }

    async fn list_room_tasks(&self, room_id: &RoomId) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.tasks.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| &t.room_id == room_id)
            .cloned()
            .collect();
        result.sort_by_key(|t| (t.created_at, t.job_id));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{JobKind, TaskStatus, UserId};
    use serde_json::json;

    fn test_task(room: &str) -> Task {
        Task::new(
            JobId::new(),
            JobKind::ExportPng,
            RoomId::from(room),
            UserId::from("user1"),
            json!({}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryTaskStore::new();
        let task = test_task("room1");
        store.create_task(task.clone()).await.unwrap();

        let err = store.create_task(task.clone()).await.unwrap_err();
        assert_eq!(err, TaskStoreError::AlreadyExists(task.job_id));
    }

    #[tokio::test]
    async fn rejected_transition_leaves_row_untouched() {
        let store = InMemoryTaskStore::new();
        let task = test_task("room1");
        store.create_task(task.clone()).await.unwrap();

        let err = store
            .update_task(
                task.job_id,
                TaskUpdate::status(TaskStatus::Completed).with_metadata(json!({ "x": 1 })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::InvalidTransition(_)));

        let stored = store.get_task(task.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Created);
        assert_eq!(stored.metadata, json!({}));
    }

    #[tokio::test]
    async fn update_of_missing_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = JobId::new();
        let err = store
            .update_task(id, TaskUpdate::status(TaskStatus::Active))
            .await
            .unwrap_err();
        assert_eq!(err, TaskStoreError::NotFound(id));
    }

    #[tokio::test]
    async fn room_listing_is_scoped() {
        let store = InMemoryTaskStore::new();
        store.create_task(test_task("room1")).await.unwrap();
        store.create_task(test_task("room1")).await.unwrap();
        store.create_task(test_task("room2")).await.unwrap();

        let tasks = store.list_room_tasks(&RoomId::from("room1")).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.room_id.as_str() == "room1"));
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use atelier_core::{JobId, JobKind, RoomId, Task, TaskUpdate};

use super::handler::{JobHandler, RegisteredJob};
use super::spec::{JobOwner, JobSpec};
use crate::error::JobError;
use crate::task_store::TaskStore;

/// Maps job kinds to their handlers. Built once at startup, read-only after.
pub struct JobRegistry {
    handlers: BTreeMap<JobKind, Arc<dyn RegisteredJob>>,
    tasks: Arc<dyn TaskStore>,
}

pub struct JobRegistryBuilder {
    handlers: BTreeMap<JobKind, Arc<dyn RegisteredJob>>,
    tasks: Arc<dyn TaskStore>,
}

impl JobRegistryBuilder {
    /// Register one handler. A second handler for the same kind is rejected.
    pub fn register<H: RegisteredJob>(mut self, handler: H) -> Result<Self, JobError> {
        let kind = handler.kind();
        if self.handlers.contains_key(&kind) {
            return Err(JobError::validation(format!(
                "a handler for {kind} is already registered"
            )));
        }
        debug!(kind = %kind, policy = handler.policy().as_str(), "job handler registered");
        self.handlers.insert(kind, Arc::new(handler));
        Ok(self)
    }

    pub fn build(self) -> Arc<JobRegistry> {
        Arc::new(JobRegistry {
            handlers: self.handlers,
            tasks: self.tasks,
        })
    }
}

impl JobRegistry {
    pub fn builder(tasks: Arc<dyn TaskStore>) -> JobRegistryBuilder {
        JobRegistryBuilder {
            handlers: BTreeMap::new(),
            tasks,
        }
    }

    pub fn resolve(&self, kind: JobKind) -> Result<Arc<dyn RegisteredJob>, JobError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| JobError::UnknownJobKind(kind.to_string()))
    }

    pub fn resolve_name(&self, name: &str) -> Result<Arc<dyn RegisteredJob>, JobError> {
        let kind: JobKind = name.parse()?;
        self.resolve(kind)
    }

    /// Typed access to a handler, for callers that know the payload type.
    pub fn handler<S: JobSpec>(&self, kind: JobKind) -> Option<Arc<JobHandler<S>>> {
        self.handlers
            .get(&kind)?
            .clone()
            .into_any()
            .downcast::<JobHandler<S>>()
            .ok()
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn RegisteredJob>> {
        self.handlers.values()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }

    /// Submit by kind name with a JSON payload.
    #[instrument(skip(self, owner, payload), err)]
    pub async fn start(&self, kind: &str, owner: JobOwner, payload: Value) -> Result<JobId, JobError> {
        self.resolve_name(kind)?.start_json(owner, payload).await
    }

    pub async fn get_task(&self, job_id: JobId) -> Result<Task, JobError> {
        self.tasks
            .get_task(job_id)
            .await?
            .ok_or(JobError::TaskNotFound(job_id))
    }

    /// Record that the submitter has seen the result.
    pub async fn mark_opened(&self, job_id: JobId) -> Result<Task, JobError> {
        Ok(self.tasks.update_task(job_id, TaskUpdate::opened()).await?)
    }

    pub async fn list_room_tasks(&self, room_id: &RoomId) -> Result<Vec<Task>, JobError> {
        Ok(self.tasks.list_room_tasks(room_id).await?)
    }
}

//! Generic job lifecycle driver.
//!
//! One [`JobHandler`] exists per job kind. It owns the parts every kind shares
//! (task rows, queue submission, status transitions, notifications, acks) and
//! delegates the kind-specific steps to its [`JobSpec`].

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinError;
use tracing::{Instrument, debug, error, info, instrument, warn};

use atelier_core::{JobId, JobKind, Task, TaskError, TaskStatus, TaskUpdate};
use atelier_events::JobNotification;

use super::notify::Notifier;
use super::spec::{JobContext, JobOwner, JobSpec};
use crate::error::JobError;
use crate::manager::QueueClient;
use crate::queue::{QueueBackend, QueuePolicy, QueueRecord};
use crate::task_store::TaskStore;

/// Queue record payload: the submitter plus the kind's payload.
#[derive(Debug, Serialize)]
struct OutgoingJob<'a, P> {
    owner: &'a JobOwner,
    payload: &'a P,
}

#[derive(Debug, Deserialize)]
struct IncomingJob<P> {
    owner: JobOwner,
    payload: P,
}

/// Shared collaborators every handler needs.
#[derive(Clone)]
pub struct JobServices {
    pub tasks: Arc<dyn TaskStore>,
    pub notifier: Arc<dyn Notifier>,
    pub queue: QueueClient,
}

impl JobServices {
    pub fn new(tasks: Arc<dyn TaskStore>, notifier: Arc<dyn Notifier>, queue: QueueClient) -> Self {
        Self {
            tasks,
            notifier,
            queue,
        }
    }
}

/// Type-erased view of a handler, as stored in the registry and driven by
/// consumer loops.
#[async_trait]
pub trait RegisteredJob: Send + Sync + 'static {
    fn kind(&self) -> JobKind;

    fn policy(&self) -> QueuePolicy;

    /// Submit with a JSON payload (deserialized into the kind's payload type).
    async fn start_json(&self, owner: JobOwner, payload: Value) -> Result<JobId, JobError>;

    /// Handle one delivered record. Never fails: every outcome is recorded on
    /// the task and acked on `backend`.
    async fn process(&self, backend: &dyn QueueBackend, record: QueueRecord);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct JobHandler<S: JobSpec> {
    spec: Arc<S>,
    services: JobServices,
}

impl<S: JobSpec> JobHandler<S> {
    pub fn new(spec: S, services: &JobServices) -> Self {
        Self {
            spec: Arc::new(spec),
            services: services.clone(),
        }
    }

    /// Submit a job.
    ///
    /// Validates, runs the kind's `prepare`, writes the task row in `created`
    /// status, announces it and enqueues the record. If enqueueing fails the
    /// kind's `on_failure` rolls back placeholder rows; the task row stays
    /// `created`.
    #[instrument(
        skip(self, owner, payload),
        fields(kind = %self.spec.kind(), room_id = %owner.room_id, user_id = %owner.user_id),
        err
    )]
    pub async fn start(&self, owner: JobOwner, payload: S::Payload) -> Result<JobId, JobError> {
        let kind = self.spec.kind();
        self.spec.validate(&owner, &payload)?;

        let ctx = JobContext {
            job_id: JobId::new(),
            kind,
            owner,
        };
        let mut payload = payload;
        let metadata = self.spec.prepare(&ctx, &mut payload).await?;

        let envelope = serde_json::to_value(OutgoingJob {
            owner: &ctx.owner,
            payload: &payload,
        })?;

        let task = Task::new(
            ctx.job_id,
            kind,
            ctx.owner.room_id.clone(),
            ctx.owner.user_id.clone(),
            metadata,
            Utc::now(),
        );
        if let Err(e) = self.services.tasks.create_task(task.clone()).await {
            let err = JobError::from(e);
            self.roll_back(&ctx, &payload, &err).await;
            return Err(err);
        }
        // Published before the record is visible to consumers so `created`
        // always precedes `active` on the bus.
        self.publish(&task);

        if let Err(err) = self
            .services
            .queue
            .send(kind.queue_name(), ctx.job_id, envelope)
            .await
        {
            warn!(job_id = %ctx.job_id, error = %err, "failed to enqueue job");
            self.roll_back(&ctx, &payload, &err).await;
            return Err(err);
        }
        info!(job_id = %ctx.job_id, "job submitted");
        Ok(ctx.job_id)
    }

    async fn roll_back(&self, ctx: &JobContext, payload: &S::Payload, cause: &JobError) {
        if let Err(e) = self.spec.on_failure(ctx, payload, cause).await {
            warn!(job_id = %ctx.job_id, error = %e, "failed to roll back job resources");
        }
    }

    fn publish(&self, task: &Task) {
        self.services
            .notifier
            .notify(JobNotification::from_task(task, Utc::now()));
    }

    async fn transition(&self, job_id: JobId, update: TaskUpdate) -> Option<Task> {
        let status = update.status;
        match self.services.tasks.update_task(job_id, update).await {
            Ok(task) => {
                self.publish(&task);
                Some(task)
            }
            Err(e) => {
                error!(job_id = %job_id, status = ?status, error = %e, "failed to update task");
                None
            }
        }
    }

    #[instrument(skip(self, backend, record), fields(kind = %self.spec.kind(), job_id = %record.id))]
    async fn run(&self, backend: &dyn QueueBackend, record: QueueRecord) {
        let job_id = record.id;
        let queue = self.spec.kind().queue_name();

        let raw = record.payload;
        let incoming = match serde_json::from_value::<IncomingJob<S::Payload>>(raw.clone()) {
            Ok(incoming) => incoming,
            Err(e) => {
                error!(error = %e, "undecodable queue record");
                self.fail_undecodable(backend, job_id, JobError::from(e)).await;
                return;
            }
        };

        let task = match self.services.tasks.get_task(job_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("queue record has no task row; failing it");
                self.fail_record(backend, job_id, &JobError::TaskNotFound(job_id)).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to load task");
                self.fail_record(backend, job_id, &JobError::from(e)).await;
                return;
            }
        };

        if task.status.is_terminal() {
            info!(status = %task.status, "task already finished; acknowledging without re-running");
            if let Err(e) = backend
                .complete(queue, job_id, json!({ "skipped": task.status.as_str() }))
                .await
            {
                warn!(error = %e, "failed to ack record of finished task");
            }
            return;
        }

        if task.status == TaskStatus::Created
            && self
                .transition(job_id, TaskUpdate::status(TaskStatus::Active))
                .await
                .is_none()
        {
            self.fail_record(
                backend,
                job_id,
                &JobError::collaborator("task could not be activated"),
            )
            .await;
            return;
        }

        let ctx = JobContext {
            job_id,
            kind: self.spec.kind(),
            owner: incoming.owner,
        };
        let payload = incoming.payload;

        // Hooks run on their own task so a panic fails this job only and
        // the consumer keeps going.
        let spec = self.spec.clone();
        let body_ctx = ctx.clone();
        let body = async move {
            let outcome = match spec.execute(&body_ctx, &payload).await {
                Ok(output) => spec.on_success(&body_ctx, &payload, output).await,
                Err(e) => Err(e),
            };
            (outcome, payload)
        };
        let body = tokio::spawn(body.in_current_span()).await;

        let (outcome, payload) = match body {
            Ok((outcome, payload)) => (outcome, Some(payload)),
            Err(e) => (Err(panicked(e)), None),
        };

        match outcome {
            Ok(result) => {
                if let Err(e) = backend.complete(queue, job_id, result.clone()).await {
                    warn!(error = %e, "failed to ack completed record");
                }
                if self
                    .transition(job_id, TaskUpdate::status(TaskStatus::Completed).with_metadata(result))
                    .await
                    .is_some()
                {
                    info!("job completed");
                }
            }
            Err(err) => {
                warn!(error = %err, "job failed");
                let failure = err.to_task_error();
                // The payload moved into a body that panicked; decode it again.
                let payload = payload.or_else(|| {
                    serde_json::from_value::<IncomingJob<S::Payload>>(raw)
                        .ok()
                        .map(|incoming| incoming.payload)
                });
                if let Some(payload) = payload {
                    self.roll_back_isolated(ctx, payload, err).await;
                }
                self.fail_with(backend, job_id, failure).await;
            }
        }
    }

    /// `on_failure` for the consumer path, isolated like the job body.
    async fn roll_back_isolated(&self, ctx: JobContext, payload: S::Payload, cause: JobError) {
        let spec = self.spec.clone();
        let job_id = ctx.job_id;
        let rollback = async move { spec.on_failure(&ctx, &payload, &cause).await };
        let rollback = tokio::spawn(rollback.in_current_span()).await;
        match rollback {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "failed to roll back job resources"),
            Err(e) => error!(job_id = %job_id, error = %panicked(e), "job rollback panicked"),
        }
    }

    /// Fail the record, then the task.
    async fn fail_with(&self, backend: &dyn QueueBackend, job_id: JobId, failure: TaskError) {
        self.fail_record_with(backend, job_id, &failure).await;
        self.transition(job_id, TaskUpdate::status(TaskStatus::Failed).with_error(failure))
            .await;
    }

    async fn fail_record(&self, backend: &dyn QueueBackend, job_id: JobId, err: &JobError) {
        self.fail_record_with(backend, job_id, &err.to_task_error()).await;
    }

    async fn fail_record_with(&self, backend: &dyn QueueBackend, job_id: JobId, failure: &TaskError) {
        let reason = serde_json::to_value(failure).unwrap_or(Value::Null);
        if let Err(e) = backend
            .fail(self.spec.kind().queue_name(), job_id, reason)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to ack failed record");
        }
    }

    /// The payload cannot be decoded, so no kind hook can run. The task still
    /// walks created → active → failed so observers see a normal failure.
    async fn fail_undecodable(&self, backend: &dyn QueueBackend, job_id: JobId, err: JobError) {
        self.fail_record(backend, job_id, &err).await;

        let status = match self.services.tasks.get_task(job_id).await {
            Ok(Some(task)) => task.status,
            _ => return,
        };
        if status == TaskStatus::Created {
            self.transition(job_id, TaskUpdate::status(TaskStatus::Active))
                .await;
        }
        if !status.is_terminal() {
            self.transition(
                job_id,
                TaskUpdate::status(TaskStatus::Failed).with_error(err.to_task_error()),
            )
            .await;
        }
        debug!(job_id = %job_id, "undecodable record failed");
    }
}

fn panicked(err: JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::Panicked("job task was cancelled".to_owned());
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    JobError::Panicked(message)
}

#[async_trait]
impl<S: JobSpec> RegisteredJob for JobHandler<S> {
    fn kind(&self) -> JobKind {
        self.spec.kind()
    }

    fn policy(&self) -> QueuePolicy {
        self.spec.policy()
    }

    async fn start_json(&self, owner: JobOwner, payload: Value) -> Result<JobId, JobError> {
        let payload: S::Payload = serde_json::from_value(payload)
            .map_err(|e| JobError::validation(format!("invalid {} payload: {e}", self.spec.kind())))?;
        self.start(owner, payload).await
    }

    async fn process(&self, backend: &dyn QueueBackend, record: QueueRecord) {
        self.run(backend, record).await
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

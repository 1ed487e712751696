//! Bounded pool for CPU-heavy worker scripts.
//!
//! The pool owns a fixed number of slots (default: available cores). Each
//! [`WorkerPool::run`] call waits for a free slot, runs the named script once
//! and releases the slot when the reply arrives or the timeout fires. Waiting
//! for a slot is the backpressure mechanism: callers are never rejected for
//! being over capacity.
//!
//! The pool is shared by every job kind and is independent of queue
//! concurrency; it never touches the task store or the notification bus.

pub mod executor;
pub mod reply;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::error::JobError;

pub use executor::{BlockingExecutor, ProcessExecutor, TransportError, WORKER_ARGS_ENV, WorkerExecutor};
pub use reply::{ReplyFraming, WorkerFailure, WorkerReply};

/// Input of one worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Script parameters (e.g. flip direction).
    pub args: Value,
    /// Opaque input bytes (e.g. the source image).
    pub input: Vec<u8>,
}

impl WorkerRequest {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            args: Value::Null,
            input,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

/// Why a worker invocation produced no artifact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerExecutionError {
    /// The script ran and reported a transform error.
    #[error("{0}")]
    Transform(WorkerFailure),

    /// The script could not be run or its reply could not be read.
    #[error("transport error: {0}")]
    Transport(String),
}

pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
    timeout: Option<Duration>,
    scripts: HashMap<String, Arc<dyn WorkerExecutor>>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("available", &self.slots.available_permits())
            .field("timeout", &self.timeout)
            .field("scripts", &self.scripts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::default()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held by an invocation.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }

    /// Run `script` once and return the artifact bytes.
    ///
    /// Waits for a free slot first. With a timeout configured, an invocation
    /// that has not replied in time fails with `WorkerTimeout` and its slot is
    /// released immediately.
    #[instrument(skip(self, request), fields(script = script, input_len = request.input.len()))]
    pub async fn run(&self, script: &str, request: WorkerRequest) -> Result<Vec<u8>, JobError> {
        let executor = self.scripts.get(script).cloned().ok_or_else(|| {
            JobError::WorkerExecutionFailed {
                script: script.to_owned(),
                cause: WorkerExecutionError::Transport("no such worker script".to_owned()),
            }
        })?;

        let _permit = self.slots.clone().acquire_owned().await.map_err(|_| {
            JobError::WorkerExecutionFailed {
                script: script.to_owned(),
                cause: WorkerExecutionError::Transport("worker pool closed".to_owned()),
            }
        })?;
        debug!(available = self.slots.available_permits(), "worker slot acquired");

        let invocation = executor.execute(request);
        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(after = ?limit, "worker timed out");
                    return Err(JobError::WorkerTimeout {
                        script: script.to_owned(),
                        after: limit,
                    });
                }
            },
            None => invocation.await,
        };

        match reply {
            Ok(WorkerReply::Ok(bytes)) => Ok(bytes),
            Ok(WorkerReply::Err(failure)) => Err(JobError::WorkerExecutionFailed {
                script: script.to_owned(),
                cause: WorkerExecutionError::Transform(failure),
            }),
            Err(TransportError(message)) => Err(JobError::WorkerExecutionFailed {
                script: script.to_owned(),
                cause: WorkerExecutionError::Transport(message),
            }),
        }
    }
}

pub struct WorkerPoolBuilder {
    slots: usize,
    timeout: Option<Duration>,
    scripts: HashMap<String, Arc<dyn WorkerExecutor>>,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            timeout: None,
            scripts: HashMap::new(),
        }
    }
}

impl WorkerPoolBuilder {
    /// Number of concurrent invocations; clamped to at least one.
    pub fn slots(mut self, slots: usize) -> Self {
        self.slots = slots.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn script(mut self, name: impl Into<String>, executor: impl WorkerExecutor + 'static) -> Self {
        self.scripts.insert(name.into(), Arc::new(executor));
        self
    }

    pub fn build(self) -> WorkerPool {
        WorkerPool {
            slots: Arc::new(Semaphore::new(self.slots)),
            capacity: self.slots,
            timeout: self.timeout,
            scripts: self.scripts,
        }
    }
}

/// One slot per available core.
pub fn default_slots() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Async executor that holds its slot until the gate opens.
    struct GatedExecutor {
        gate: Arc<Semaphore>,
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerExecutor for GatedExecutor {
        async fn execute(&self, request: WorkerRequest) -> Result<WorkerReply, TransportError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _pass = self
                .gate
                .acquire()
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            Ok(WorkerReply::Ok(request.input))
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn invocation_beyond_capacity_waits_for_a_free_slot() {
        const SLOTS: usize = 3;
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(
            WorkerPool::builder()
                .slots(SLOTS)
                .script(
                    "export-png",
                    GatedExecutor {
                        gate: gate.clone(),
                        started: started.clone(),
                    },
                )
                .build(),
        );

        let mut runs = Vec::new();
        for i in 0..=SLOTS {
            let pool = pool.clone();
            runs.push(tokio::spawn(async move {
                pool.run("export-png", WorkerRequest::new(vec![i as u8])).await
            }));
        }

        wait_until(|| started.load(Ordering::SeqCst) == SLOTS).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), SLOTS, "N+1th invocation must wait");
        assert_eq!(pool.available_slots(), 0);

        gate.add_permits(SLOTS + 1);
        for run in runs {
            assert!(run.await.unwrap().is_ok());
        }
        assert_eq!(started.load(Ordering::SeqCst), SLOTS + 1);
        assert_eq!(pool.available_slots(), SLOTS);
    }

    #[tokio::test]
    async fn timeout_releases_the_slot() {
        let pool = WorkerPool::builder()
            .slots(1)
            .timeout(Duration::from_millis(50))
            .script(
                "remove-background",
                BlockingExecutor::new(|request: WorkerRequest| {
                    std::thread::sleep(Duration::from_millis(300));
                    WorkerReply::Ok(request.input)
                }),
            )
            .build();

        let err = pool
            .run("remove-background", WorkerRequest::new(vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::WorkerTimeout { .. }));
        assert_eq!(pool.available_slots(), 1);
    }

    /// True once the process is gone or only a zombie awaiting reaping.
    #[cfg(target_os = "linux")]
    fn process_finished(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_the_worker_process_and_frees_its_slot() {
        let pid_file = std::env::temp_dir().join(format!("atelier-worker-{}.pid", uuid::Uuid::now_v7()));
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let pool = WorkerPool::builder()
            .slots(1)
            .timeout(Duration::from_millis(300))
            .script("export-pdf", ProcessExecutor::new("sh").with_args(["-c", script.as_str()]))
            .script("export-png", ProcessExecutor::new("cat").with_framing(ReplyFraming::Untagged))
            .build();

        let started = std::time::Instant::now();
        let err = pool
            .run("export-pdf", WorkerRequest::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::WorkerTimeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.available_slots(), 1);

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim().to_owned();
        let _ = std::fs::remove_file(&pid_file);
        wait_until(|| process_finished(&pid)).await;

        let bytes = pool
            .run("export-png", WorkerRequest::new(b"page".to_vec()))
            .await
            .unwrap();
        assert_eq!(bytes, b"page".to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_worker_process_fails_the_run() {
        let pool = WorkerPool::builder()
            .slots(1)
            .script("flip-image", ProcessExecutor::new("sh").with_args(["-c", "exit 4"]))
            .build();

        match pool.run("flip-image", WorkerRequest::new(Vec::new())).await {
            Err(JobError::WorkerExecutionFailed {
                script,
                cause: WorkerExecutionError::Transport(message),
            }) => {
                assert_eq!(script, "flip-image");
                assert!(message.contains("exit status: 4"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(pool.available_slots(), 1);
    }

    #[tokio::test]
    async fn transform_failure_is_distinguished_from_transport() {
        let pool = WorkerPool::builder()
            .slots(1)
            .script(
                "flip-image",
                BlockingExecutor::new(|_| WorkerReply::failure("DecodeError", "not an image")),
            )
            .build();

        match pool.run("flip-image", WorkerRequest::new(vec![])).await {
            Err(JobError::WorkerExecutionFailed {
                cause: WorkerExecutionError::Transform(failure),
                ..
            }) => assert_eq!(failure.name, "DecodeError"),
            other => panic!("unexpected result: {other:?}"),
        }

        match pool.run("missing", WorkerRequest::new(vec![])).await {
            Err(JobError::WorkerExecutionFailed {
                cause: WorkerExecutionError::Transport(_),
                ..
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn zero_slots_is_clamped() {
        assert_eq!(WorkerPool::builder().slots(0).build().capacity(), 1);
    }
}

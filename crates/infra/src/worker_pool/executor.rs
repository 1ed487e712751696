//! Ways to run a worker script.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::WorkerRequest;
use super::reply::{ReplyFraming, WorkerReply};

/// Environment variable carrying the JSON `args` of a process invocation.
pub const WORKER_ARGS_ENV: &str = "ATELIER_WORKER_ARGS";

/// The worker could not be run or did not answer with a readable reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Runs one invocation of a worker script and returns its single reply.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerReply, TransportError>;
}

/// Runs a CPU-bound closure on the blocking thread pool.
///
/// A panic inside the closure becomes a transport error. The closure cannot
/// be interrupted: when the pool's timeout fires, the slot is released but
/// the thread runs to completion in the background.
pub struct BlockingExecutor<F> {
    f: Arc<F>,
}

impl<F> BlockingExecutor<F>
where
    F: Fn(WorkerRequest) -> WorkerReply + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> WorkerExecutor for BlockingExecutor<F>
where
    F: Fn(WorkerRequest) -> WorkerReply + Send + Sync + 'static,
{
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerReply, TransportError> {
        let f = self.f.clone();
        tokio::task::spawn_blocking(move || f(request))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    TransportError("worker panicked".to_owned())
                } else {
                    TransportError(format!("worker task aborted: {e}"))
                }
            })
    }
}

/// Runs a worker as a child process.
///
/// `args` are passed as JSON in [`WORKER_ARGS_ENV`], the input bytes on stdin,
/// and the reply is read from stdout. The child is killed if the invocation
/// is dropped (e.g. on timeout). A success reply only counts when the child
/// also exits successfully.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    framing: ReplyFraming,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            framing: ReplyFraming::Tagged,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_framing(mut self, framing: ReplyFraming) -> Self {
        self.framing = framing;
        self
    }
}

#[async_trait]
impl WorkerExecutor for ProcessExecutor {
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerReply, TransportError> {
        let args = serde_json::to_string(&request.args)
            .map_err(|e| TransportError(format!("failed to encode worker args: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ARGS_ENV, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError(format!("failed to spawn {}: {e}", self.program.display())))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError("worker stdin unavailable".to_owned()))?;
        let input = request.input;

        // Feed stdin while stdout is drained, so large payloads cannot
        // deadlock on full pipes.
        let feed = async move {
            let written = stdin.write_all(&input).await;
            drop(stdin);
            written
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output.map_err(|e| TransportError(format!("worker io error: {e}")))?;
        if let Err(e) = fed {
            debug!(program = %self.program.display(), error = %e, "worker closed stdin early");
        }

        if output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError(format!(
                "worker exited with {} and no reply: {}",
                output.status,
                stderr.trim()
            )));
        }

        let reply = WorkerReply::decode(output.stdout, self.framing).map_err(TransportError)?;
        // A failed exit discards any artifact; a reported failure stays a transform error.
        if !output.status.success() && matches!(reply, WorkerReply::Ok(_)) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError(format!(
                "worker exited with {} after writing a reply: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn blocking_executor_returns_the_closure_reply() {
        let executor = BlockingExecutor::new(|request: WorkerRequest| {
            let mut out = request.input;
            out.reverse();
            WorkerReply::Ok(out)
        });

        let reply = executor
            .execute(WorkerRequest::new(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(reply, WorkerReply::Ok(vec![3, 2, 1]));
    }

    #[tokio::test]
    async fn blocking_executor_panic_is_a_transport_error() {
        let executor = BlockingExecutor::new(|_request: WorkerRequest| -> WorkerReply {
            panic!("boom");
        });

        let err = executor
            .execute(WorkerRequest::new(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError("worker panicked".into()));
    }

    #[tokio::test]
    async fn missing_program_is_a_transport_error() {
        let executor = ProcessExecutor::new("/nonexistent/atelier-worker-script");
        let err = executor
            .execute(WorkerRequest::new(Vec::new()).with_args(json!({ "direction": "horizontal" })))
            .await
            .unwrap_err();
        assert!(err.0.contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_executor_reads_untagged_stdout() {
        // `cat` echoes stdin, which is a valid untagged success reply.
        let executor = ProcessExecutor::new("cat").with_framing(ReplyFraming::Untagged);
        let reply = executor
            .execute(WorkerRequest::new(b"pixels".to_vec()))
            .await
            .unwrap();
        assert_eq!(reply, WorkerReply::Ok(b"pixels".to_vec()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_without_reply_is_a_transport_error() {
        let executor = ProcessExecutor::new("sh").with_args(["-c", "echo 'cannot open input' >&2; exit 3"]);
        let err = executor
            .execute(WorkerRequest::new(b"pixels".to_vec()))
            .await
            .unwrap_err();
        assert!(err.0.contains("no reply"), "{err}");
        assert!(err.0.contains("cannot open input"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_discards_a_success_reply() {
        let executor = ProcessExecutor::new("sh").with_args(["-c", "printf '\\000partial'; exit 2"]);
        let err = executor
            .execute(WorkerRequest::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(err.0.contains("after writing a reply"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_keeps_a_reported_failure() {
        let executor = ProcessExecutor::new("sh").with_args([
            "-c",
            r#"printf '\001{"name":"DecodeError","message":"not an image"}'; exit 1"#,
        ]);
        let reply = executor
            .execute(WorkerRequest::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(reply, WorkerReply::failure("DecodeError", "not an image"));
    }
}

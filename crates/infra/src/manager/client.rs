use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atelier_core::JobId;

use crate::error::JobError;
use crate::queue::QueueBackend;

/// One backend connection plus the consumers working it.
pub struct QueueConnection {
    backend: Arc<dyn QueueBackend>,
    generation: u64,
    expires_at: Option<DateTime<Utc>>,
    /// Monotonic deadline matching `expires_at`; used for rotation checks.
    deadline: Option<Instant>,
    draining: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueConnection {
    pub(crate) fn new(
        backend: Arc<dyn QueueBackend>,
        generation: u64,
        expires_at: Option<DateTime<Utc>>,
        draining: CancellationToken,
    ) -> Self {
        let deadline = expires_at.map(|at| {
            let remaining = (at - Utc::now()).to_std().unwrap_or_default();
            Instant::now() + remaining
        });
        Self {
            backend,
            generation,
            expires_at,
            deadline,
            draining,
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Expiry of the credential the connection was opened with.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Lifetime left on the connection's credential. `None` when it was opened
    /// without one.
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn draining(&self) -> &CancellationToken {
        &self.draining
    }

    pub(crate) fn add_consumer(&self, handle: JoinHandle<()>) {
        match self.consumers.lock() {
            Ok(mut consumers) => consumers.push(handle),
            Err(_) => handle.abort(),
        }
    }

    /// Stop fetching new records. In-flight jobs keep running and can still
    /// ack through this connection until it is closed.
    pub fn stop_consuming(&self) {
        self.draining.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// Wait for every consumer loop of this connection to exit.
    pub(crate) async fn join_consumers(&self) {
        let handles = match self.consumers.lock() {
            Ok(mut consumers) => std::mem::take(&mut *consumers),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(generation = self.generation, error = %e, "queue consumer ended abnormally");
            }
        }
    }

    pub async fn close(&self) {
        self.stop_consuming();
        self.backend.close().await;
        debug!(generation = self.generation, "queue connection closed");
    }
}

impl core::fmt::Debug for QueueConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueConnection")
            .field("generation", &self.generation)
            .field("expires_at", &self.expires_at)
            .field("draining", &self.is_draining())
            .finish()
    }
}

#[derive(Default)]
struct ClientState {
    current: RwLock<Option<Arc<QueueConnection>>>,
    halted: RwLock<Option<String>>,
}

/// Stable handle used to submit jobs.
///
/// The connection behind it is swapped atomically on credential rotation;
/// holders of a `QueueClient` never see the swap. Each `send` goes through
/// whichever connection is current when it starts.
#[derive(Clone, Default)]
pub struct QueueClient {
    state: Arc<ClientState>,
}

impl QueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue on the current connection.
    pub async fn send(&self, queue: &str, id: JobId, payload: Value) -> Result<JobId, JobError> {
        if let Some(reason) = self.halted() {
            return Err(JobError::CredentialAcquisitionFailed(reason));
        }
        let connection = self.current().ok_or_else(|| JobError::QueueSubmissionFailed {
            queue: queue.to_owned(),
            reason: "queue client not started".to_owned(),
        })?;

        match connection.backend().send(queue, id, payload).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Err(JobError::QueueSubmissionFailed {
                queue: queue.to_owned(),
                reason: "backend declined the record".to_owned(),
            }),
            Err(e) => Err(JobError::QueueSubmissionFailed {
                queue: queue.to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn current(&self) -> Option<Arc<QueueConnection>> {
        self.state.current.read().ok()?.clone()
    }

    /// Generation of the current connection; 0 before the first one.
    pub fn generation(&self) -> u64 {
        self.current().map(|c| c.generation()).unwrap_or(0)
    }

    /// Install `connection` as current and return the one it replaces.
    pub(crate) fn publish(&self, connection: Arc<QueueConnection>) -> Option<Arc<QueueConnection>> {
        match self.state.current.write() {
            Ok(mut current) => current.replace(connection),
            Err(_) => None,
        }
    }

    pub(crate) fn take(&self) -> Option<Arc<QueueConnection>> {
        self.state.current.write().ok()?.take()
    }

    pub(crate) fn halt(&self, reason: impl Into<String>) {
        if let Ok(mut halted) = self.state.halted.write() {
            halted.get_or_insert_with(|| reason.into());
        }
    }

    /// Reason the client stopped accepting submissions, if it did.
    pub fn halted(&self) -> Option<String> {
        self.state.halted.read().ok()?.clone()
    }
}

impl core::fmt::Debug for QueueClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueClient")
            .field("generation", &self.generation())
            .field("halted", &self.halted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, QueuePolicy};
    use serde_json::json;

    async fn connection(generation: u64) -> Arc<QueueConnection> {
        let backend = Arc::new(InMemoryQueue::new());
        backend.create_queue("flip-image", QueuePolicy::Singleton).await.unwrap();
        Arc::new(QueueConnection::new(backend, generation, None, CancellationToken::new()))
    }

    #[tokio::test]
    async fn send_before_start_is_a_submission_failure() {
        let client = QueueClient::new();
        let err = client.send("flip-image", JobId::new(), json!({})).await.unwrap_err();
        assert!(matches!(err, JobError::QueueSubmissionFailed { .. }));
    }

    #[tokio::test]
    async fn publish_swaps_for_every_clone() {
        let client = QueueClient::new();
        let other = client.clone();

        assert!(client.publish(connection(1).await).is_none());
        let replaced = client.publish(connection(2).await).unwrap();

        assert_eq!(replaced.generation(), 1);
        assert_eq!(other.generation(), 2);
        let id = JobId::new();
        assert_eq!(other.send("flip-image", id, json!({})).await.unwrap(), id);
    }

    #[tokio::test]
    async fn halted_client_refuses_sends() {
        let client = QueueClient::new();
        client.publish(connection(1).await);
        client.halt("token endpoint unreachable");
        client.halt("second reason is ignored");

        let err = client.send("flip-image", JobId::new(), json!({})).await.unwrap_err();
        assert!(
            matches!(err, JobError::CredentialAcquisitionFailed(reason) if reason == "token endpoint unreachable")
        );
    }

    #[tokio::test]
    async fn declined_record_is_a_submission_failure() {
        let client = QueueClient::new();
        let conn = connection(1).await;
        client.publish(conn.clone());
        let id = JobId::new();
        client.send("flip-image", id, json!({})).await.unwrap();

        let err = client.send("flip-image", id, json!({})).await.unwrap_err();
        assert!(matches!(err, JobError::QueueSubmissionFailed { reason, .. } if reason.contains("declined")));
    }

    #[tokio::test]
    async fn remaining_is_none_without_a_credential() {
        assert!(connection(1).await.remaining().is_none());
    }
}

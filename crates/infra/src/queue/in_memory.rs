//! In-memory queue backend for tests/dev.
//!
//! All connections opened by one [`InMemoryQueueConnector`] share the same
//! queue state, the way several pools share one database. Each connection can
//! be closed on its own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use atelier_core::JobId;

use super::backend::{
    QueueBackend, QueueConnector, QueueError, QueuePolicy, QueueRecord, QueueRecordState,
};
use crate::credentials::Credential;

#[derive(Debug)]
struct QueueState {
    policy: QueuePolicy,
    records: HashMap<JobId, QueueRecord>,
    pending: VecDeque<JobId>,
    active: HashSet<JobId>,
    outputs: HashMap<JobId, Value>,
}

impl QueueState {
    fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            pending: VecDeque::new(),
            active: HashSet::new(),
            outputs: HashMap::new(),
        }
    }
}

/// Queue state shared by every connection of one connector.
#[derive(Debug, Default)]
pub struct SharedQueues {
    queues: Mutex<HashMap<String, QueueState>>,
    declining: AtomicBool,
}

impl SharedQueues {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, QueueState>>, QueueError> {
        self.queues
            .lock()
            .map_err(|_| QueueError::Backend("queue state lock poisoned".to_owned()))
    }

    /// Make every subsequent `send` decline its record (returns `None`).
    pub fn set_declining(&self, declining: bool) {
        self.declining.store(declining, Ordering::SeqCst);
    }

    pub fn record(&self, queue: &str, id: JobId) -> Option<QueueRecord> {
        let queues = self.queues.lock().ok()?;
        queues.get(queue)?.records.get(&id).cloned()
    }

    /// Output or failure reason stored when the record was acked.
    pub fn outcome(&self, queue: &str, id: JobId) -> Option<Value> {
        let queues = self.queues.lock().ok()?;
        queues.get(queue)?.outputs.get(&id).cloned()
    }

    pub fn active_count(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .ok()
            .and_then(|q| q.get(queue).map(|s| s.active.len()))
            .unwrap_or(0)
    }

    pub fn pending_count(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .ok()
            .and_then(|q| q.get(queue).map(|s| s.pending.len()))
            .unwrap_or(0)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.queues
            .lock()
            .map(|q| q.contains_key(queue))
            .unwrap_or(false)
    }
}

/// One connection to the shared in-memory queues.
#[derive(Debug)]
pub struct InMemoryQueue {
    shared: Arc<SharedQueues>,
    connection_id: u64,
    token: Option<String>,
    closed: AtomicBool,
}

impl InMemoryQueue {
    /// A standalone connection with its own private state.
    pub fn new() -> Self {
        Self::attached(Arc::new(SharedQueues::default()), 0, None)
    }

    fn attached(shared: Arc<SharedQueues>, connection_id: u64, token: Option<String>) -> Self {
        Self {
            shared,
            connection_id,
            token,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Token this connection authenticated with, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> &Arc<SharedQueues> {
        &self.shared
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn finish(
        &self,
        name: &str,
        id: JobId,
        state: QueueRecordState,
        outcome: Value,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut queues = self.shared.lock()?;
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_owned()))?;

        if !queue.active.remove(&id) {
            return Err(QueueError::NotActive {
                queue: name.to_owned(),
                id,
            });
        }
        if let Some(record) = queue.records.get_mut(&id) {
            record.state = state;
        }
        queue.outputs.insert(id, outcome);
        Ok(())
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn create_queue(&self, name: &str, policy: QueuePolicy) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut queues = self.shared.lock()?;
        queues
            .entry(name.to_owned())
            .or_insert_with(|| QueueState::new(policy));
        Ok(())
    }

    async fn purge_stale(&self) -> Result<u64, QueueError> {
        self.ensure_open()?;
        let mut queues = self.shared.lock()?;
        let mut purged = 0u64;
        for queue in queues.values_mut() {
            let stale: Vec<JobId> = queue.pending.drain(..).chain(queue.active.drain()).collect();
            for id in stale {
                queue.records.remove(&id);
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn send(&self, name: &str, id: JobId, payload: Value) -> Result<Option<JobId>, QueueError> {
        self.ensure_open()?;
        let mut queues = self.shared.lock()?;
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_owned()))?;

        if self.shared.declining.load(Ordering::SeqCst) || queue.records.contains_key(&id) {
            return Ok(None);
        }

        queue.records.insert(
            id,
            QueueRecord {
                id,
                queue: name.to_owned(),
                payload,
                state: QueueRecordState::Created,
                created_at: Utc::now(),
                started_at: None,
            },
        );
        queue.pending.push_back(id);
        Ok(Some(id))
    }

    async fn fetch(&self, name: &str) -> Result<Option<QueueRecord>, QueueError> {
        self.ensure_open()?;
        let mut queues = self.shared.lock()?;
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_owned()))?;

        if queue.policy == QueuePolicy::Singleton && !queue.active.is_empty() {
            return Ok(None);
        }

        let Some(id) = queue.pending.pop_front() else {
            return Ok(None);
        };
        queue.active.insert(id);

        let record = queue
            .records
            .get_mut(&id)
            .ok_or_else(|| QueueError::Backend(format!("record {id} missing from {name}")))?;
        record.state = QueueRecordState::Active;
        record.started_at = Some(Utc::now());
        Ok(Some(record.clone()))
    }

    async fn complete(&self, name: &str, id: JobId, output: Value) -> Result<(), QueueError> {
        self.finish(name, id, QueueRecordState::Completed, output)
    }

    async fn fail(&self, name: &str, id: JobId, reason: Value) -> Result<(), QueueError> {
        self.finish(name, id, QueueRecordState::Failed, reason)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens [`InMemoryQueue`] connections over one shared state and remembers
/// them so tests can inspect which connection was closed when.
#[derive(Debug, Default)]
pub struct InMemoryQueueConnector {
    shared: Arc<SharedQueues>,
    next_id: AtomicU64,
    opened: Mutex<Vec<Arc<InMemoryQueue>>>,
}

impl InMemoryQueueConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<SharedQueues> {
        self.shared.clone()
    }

    /// Every connection opened so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<InMemoryQueue>> {
        self.opened.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl QueueConnector for InMemoryQueueConnector {
    async fn connect(
        &self,
        credential: Option<&Credential>,
    ) -> Result<Arc<dyn QueueBackend>, QueueError> {
        if let Some(credential) = credential {
            if credential.is_expired(Utc::now()) {
                return Err(QueueError::Connect("credential expired".to_owned()));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(InMemoryQueue::attached(
            self.shared.clone(),
            id,
            credential.map(|c| c.token().to_owned()),
        ));
        self.opened
            .lock()
            .map_err(|_| QueueError::Backend("connector lock poisoned".to_owned()))?
            .push(connection.clone());
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn singleton_admits_one_active_record() {
        let queue = InMemoryQueue::new();
        queue.create_queue("flip-image", QueuePolicy::Singleton).await.unwrap();

        let first = JobId::new();
        let second = JobId::new();
        queue.send("flip-image", first, json!({})).await.unwrap();
        queue.send("flip-image", second, json!({})).await.unwrap();

        let fetched = queue.fetch("flip-image").await.unwrap().unwrap();
        assert_eq!(fetched.id, first);
        assert!(queue.fetch("flip-image").await.unwrap().is_none());

        queue.complete("flip-image", first, json!({})).await.unwrap();
        let next = queue.fetch("flip-image").await.unwrap().unwrap();
        assert_eq!(next.id, second);
    }

    #[tokio::test]
    async fn standard_queue_has_no_active_limit() {
        let queue = InMemoryQueue::new();
        queue.create_queue("bulk", QueuePolicy::Standard).await.unwrap();
        queue.send("bulk", JobId::new(), json!({})).await.unwrap();
        queue.send("bulk", JobId::new(), json!({})).await.unwrap();

        assert!(queue.fetch("bulk").await.unwrap().is_some());
        assert!(queue.fetch("bulk").await.unwrap().is_some());
        assert_eq!(queue.shared().active_count("bulk"), 2);
    }

    #[tokio::test]
    async fn duplicate_id_is_declined() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q", QueuePolicy::Singleton).await.unwrap();
        let id = JobId::new();

        assert_eq!(queue.send("q", id, json!({})).await.unwrap(), Some(id));
        assert_eq!(queue.send("q", id, json!({})).await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_to_undeclared_queue_fails() {
        let queue = InMemoryQueue::new();
        let err = queue.send("nope", JobId::new(), json!({})).await.unwrap_err();
        assert_eq!(err, QueueError::UnknownQueue("nope".into()));
    }

    #[tokio::test]
    async fn purge_drops_created_and_active_but_keeps_declarations() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q", QueuePolicy::Singleton).await.unwrap();
        queue.send("q", JobId::new(), json!({})).await.unwrap();
        queue.send("q", JobId::new(), json!({})).await.unwrap();
        queue.fetch("q").await.unwrap();

        assert_eq!(queue.purge_stale().await.unwrap(), 2);
        assert!(queue.fetch("q").await.unwrap().is_none());
        assert!(queue.shared().is_declared("q"));
    }

    #[tokio::test]
    async fn closed_connection_rejects_calls_but_siblings_keep_working() {
        let connector = InMemoryQueueConnector::new();
        let old = connector.connect(None).await.unwrap();
        let new = connector.connect(None).await.unwrap();
        old.create_queue("q", QueuePolicy::Singleton).await.unwrap();

        old.close().await;
        assert_eq!(old.fetch("q").await.unwrap_err(), QueueError::Closed);
        assert!(new.send("q", JobId::new(), json!({})).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ack_requires_an_active_record() {
        let queue = InMemoryQueue::new();
        queue.create_queue("q", QueuePolicy::Singleton).await.unwrap();
        let id = JobId::new();
        queue.send("q", id, json!({})).await.unwrap();

        let err = queue.complete("q", id, json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::NotActive { .. }));
    }
}

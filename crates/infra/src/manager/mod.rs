//! Queue connection lifecycle.
//!
//! The [`QueueClientManager`] opens the primary backend connection, starts one
//! consumer loop per registered job kind and hands out a [`QueueClient`] whose
//! connection can be swapped underneath it.
//!
//! When the backend authenticates with short-lived credentials the manager
//! checks the current credential on a fixed period. Once its remaining
//! lifetime drops to the refresh threshold it builds a replacement connection
//! (fresh token, queues declared, consumers running), publishes it, and
//! retires the old one: the old consumers stop fetching right away, and the
//! old connection is closed after a grace period so in-flight jobs can still
//! ack. A rotation that fails is retried at the next check while the current
//! token outlives it; otherwise the manager halts.

mod client;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::credentials::{Credential, CredentialProvider};
use crate::error::JobError;
use crate::jobs::{JobRegistry, RegisteredJob};
use crate::queue::{QueueBackend, QueueConnector, QueueError};

pub use client::{QueueClient, QueueConnection};

#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    /// Idle wait between fetches on an empty queue.
    pub poll_interval: Duration,
    /// How often the current credential's lifetime is checked.
    pub credential_check_interval: Duration,
    /// Rotate once the remaining lifetime is at or below this.
    pub refresh_threshold: Duration,
    /// How long a retired connection stays open for in-flight acks.
    pub connection_grace: Duration,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            credential_check_interval: Duration::from_secs(60),
            refresh_threshold: Duration::from_secs(300),
            connection_grace: Duration::from_secs(300),
        }
    }
}

pub struct QueueClientManager {
    connector: Arc<dyn QueueConnector>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    config: QueueManagerConfig,
    client: QueueClient,
    registry: OnceLock<Arc<JobRegistry>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    halted: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueClientManager {
    /// `credentials` is `None` when the backend uses static authentication;
    /// no rotation loop runs in that case.
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        credentials: Option<Arc<dyn CredentialProvider>>,
        config: QueueManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            credentials,
            config,
            client: QueueClient::new(),
            registry: OnceLock::new(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            halted: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Handle for submitting jobs. Valid before `start_primary`; sends fail
    /// until a connection is published.
    pub fn client(&self) -> QueueClient {
        self.client.clone()
    }

    /// Generation of the connection currently serving sends (1 = primary).
    pub fn active_generation(&self) -> u64 {
        self.client.generation()
    }

    /// Open the primary connection, purge leftovers of a previous process,
    /// declare one queue per registered kind and start consuming.
    #[instrument(skip_all, err)]
    pub async fn start_primary(self: &Arc<Self>, registry: Arc<JobRegistry>) -> Result<(), JobError> {
        if self.registry.set(registry.clone()).is_err() {
            return Err(JobError::validation("queue client manager already started"));
        }

        let credential = match &self.credentials {
            Some(provider) => Some(provider.get_token().await?),
            None => None,
        };
        let backend = self.connector.connect(credential.as_ref()).await?;

        let purged = match backend.purge_stale().await {
            Ok(purged) => purged,
            Err(e) => {
                backend.close().await;
                return Err(e.into());
            }
        };
        if purged > 0 {
            info!(purged, "purged stale queue records");
        }

        let connection = self.attach(backend, credential.as_ref(), &registry).await?;
        let generation = connection.generation();
        self.client.publish(connection);
        info!(generation, kinds = registry.kinds().len(), "queue client started");

        if let Some(provider) = self.credentials.clone() {
            let manager = Arc::clone(self);
            let handle = tokio::spawn(async move { manager.rotation_loop(provider, registry).await });
            self.track(handle);
        }
        Ok(())
    }

    /// Declare every registered queue on `backend` and start its consumers.
    /// Closes `backend` if a declaration fails.
    async fn attach(
        &self,
        backend: Arc<dyn QueueBackend>,
        credential: Option<&Credential>,
        registry: &JobRegistry,
    ) -> Result<Arc<QueueConnection>, JobError> {
        for handler in registry.handlers() {
            let queue = handler.kind().queue_name();
            if let Err(e) = backend.create_queue(queue, handler.policy()).await {
                warn!(queue, error = %e, "failed to declare queue");
                backend.close().await;
                return Err(e.into());
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(QueueConnection::new(
            backend,
            generation,
            credential.map(Credential::expires_at),
            self.shutdown.child_token(),
        ));
        for handler in registry.handlers() {
            let handle = tokio::spawn(consume(
                connection.clone(),
                handler.clone(),
                self.config.poll_interval,
            ));
            connection.add_consumer(handle);
        }
        debug!(generation, "queue connection attached");
        Ok(connection)
    }

    async fn rotation_loop(
        self: Arc<Self>,
        provider: Arc<dyn CredentialProvider>,
        registry: Arc<JobRegistry>,
    ) {
        let period = self.config.credential_check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(remaining) = self.client.current().and_then(|c| c.remaining()) else {
                continue;
            };
            if remaining > self.config.refresh_threshold {
                debug!(remaining_secs = remaining.as_secs(), "credential still fresh");
                continue;
            }

            match self.rotate(provider.as_ref(), &registry).await {
                Ok(generation) => info!(generation, "queue connection rotated"),
                Err(e) => {
                    let remaining = self
                        .client
                        .current()
                        .and_then(|c| c.remaining())
                        .unwrap_or_default();
                    if remaining > period {
                        warn!(
                            error = %e,
                            remaining_secs = remaining.as_secs(),
                            "credential rotation failed; retrying at next check"
                        );
                    } else {
                        self.halt(e.to_string());
                        break;
                    }
                }
            }
        }
    }

    /// Build a replacement connection with a fresh credential and swap it in.
    #[instrument(skip_all, err)]
    async fn rotate(
        &self,
        provider: &dyn CredentialProvider,
        registry: &JobRegistry,
    ) -> Result<u64, JobError> {
        let credential = provider.get_token().await?;
        let backend = self.connector.connect(Some(&credential)).await?;
        let connection = self.attach(backend, Some(&credential), registry).await?;
        let generation = connection.generation();

        if let Some(old) = self.client.publish(connection) {
            self.retire(old);
        }
        Ok(generation)
    }

    fn retire(&self, old: Arc<QueueConnection>) {
        old.stop_consuming();
        let grace = self.config.connection_grace;
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = sleep(grace) => {}
                _ = shutdown.cancelled() => {}
            }
            old.join_consumers().await;
            old.close().await;
            info!(generation = old.generation(), "retired queue connection closed");
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.background.lock() {
            Ok(mut background) => {
                background.retain(|h| !h.is_finished());
                background.push(handle);
            }
            Err(_) => handle.abort(),
        }
    }

    /// Stop intake: sends fail with `CredentialAcquisitionFailed` and the
    /// consumers stop fetching. In-flight jobs may still finish.
    fn halt(&self, reason: String) {
        error!(reason = %reason, "queue credentials could not be refreshed; halting job intake");
        self.client.halt(reason);
        if let Some(current) = self.client.current() {
            current.stop_consuming();
        }
        self.halted.cancel();
    }

    /// Set once the manager halted.
    pub fn fatal_error(&self) -> Option<JobError> {
        self.client.halted().map(JobError::CredentialAcquisitionFailed)
    }

    /// Resolves when the manager halts. Never resolves otherwise.
    pub async fn wait_fatal(&self) -> JobError {
        self.halted.cancelled().await;
        self.fatal_error()
            .unwrap_or_else(|| JobError::CredentialAcquisitionFailed("halted".to_owned()))
    }

    /// Stop every consumer, wait for in-flight jobs and close all connections.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(current) = self.client.take() {
            current.join_consumers().await;
            current.close().await;
        }
        let background = match self.background.lock() {
            Ok(mut background) => std::mem::take(&mut *background),
            Err(_) => Vec::new(),
        };
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "queue background task ended abnormally");
            }
        }
        info!("queue client manager stopped");
    }
}

/// Work one queue on one connection until the connection drains or closes.
async fn consume(connection: Arc<QueueConnection>, handler: Arc<dyn RegisteredJob>, poll: Duration) {
    let queue = handler.kind().queue_name();
    let generation = connection.generation();
    debug!(queue, generation, "queue consumer started");

    loop {
        if connection.is_draining() {
            break;
        }
        match connection.backend().fetch(queue).await {
            Ok(Some(record)) => {
                handler.process(connection.backend().as_ref(), record).await;
                continue;
            }
            Ok(None) => {}
            Err(QueueError::Closed) => break,
            Err(e) => warn!(queue, generation, error = %e, "queue fetch failed"),
        }

        tokio::select! {
            _ = connection.draining().cancelled() => break,
            _ = sleep(poll) => {}
        }
    }
    debug!(queue, generation, "queue consumer stopped");
}

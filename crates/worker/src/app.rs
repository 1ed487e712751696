//! Process wiring: configuration in, running job core out.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use atelier_events::{InMemoryNotificationBus, JobNotification};
use atelier_infra::collaborators::{
    BlobRoomSnapshots, BlobStore, FsBlobStore, HttpImageGenerator, ImageGenerator, ImageStore,
    InMemoryBlobStore, InMemoryImageStore, PostgresImageStore,
};
use atelier_infra::config::{AtelierConfig, QueueAuth};
use atelier_infra::credentials::{CredentialProvider, ImdsCredentialProvider};
use atelier_infra::jobs::{JobDependencies, JobRegistry, JobServices, Notifier, standard_registry};
use atelier_infra::manager::QueueClientManager;
use atelier_infra::queue::{InMemoryQueueConnector, PostgresQueueConnector, QueueConnector};
use atelier_infra::task_store::{InMemoryTaskStore, PostgresTaskStore, TaskStore};
use atelier_infra::worker_pool::{ProcessExecutor, WorkerPool};

/// Worker scripts the standard job kinds invoke.
pub const WORKER_SCRIPTS: [&str; 4] = ["remove-background", "flip-image", "export-pdf", "export-png"];

/// A started job core.
pub struct AtelierApp {
    manager: Arc<QueueClientManager>,
    registry: Arc<JobRegistry>,
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
}

impl AtelierApp {
    pub fn manager(&self) -> &Arc<QueueClientManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn images(&self) -> &Arc<dyn ImageStore> {
        &self.images
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        tracing::info!("job core stopped");
    }
}

/// Build every collaborator from `config`, register the standard job kinds and
/// start the primary queue connection.
pub async fn build_app(config: &AtelierConfig) -> anyhow::Result<AtelierApp> {
    let credentials = credential_provider(config)?;

    let stores = if config.use_persistent_stores {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL is required for persistent stores")?;
        tracing::info!("using Postgres task, image and queue stores");
        persistent_stores(url, credentials.as_deref()).await?
    } else {
        tracing::info!("using in-memory task, image and queue stores");
        Stores {
            tasks: Arc::new(InMemoryTaskStore::new()),
            images: Arc::new(InMemoryImageStore::new()),
            connector: Arc::new(InMemoryQueueConnector::new()),
        }
    };
    let Stores {
        tasks,
        images,
        connector,
    } = stores;

    let notifier = notifier(config);
    let manager = QueueClientManager::new(connector, credentials, config.queue.clone());
    let services = JobServices::new(tasks, notifier, manager.client());

    let blobs: Arc<dyn BlobStore> = match &config.blob_dir {
        Some(dir) => Arc::new(FsBlobStore::new(dir.clone())),
        None => Arc::new(InMemoryBlobStore::new()),
    };
    let generator = match &config.image_api {
        Some(api) => {
            let generator = HttpImageGenerator::new(api.url.clone(), api.api_key.clone(), api.timeout)?;
            Some(Arc::new(generator) as Arc<dyn ImageGenerator>)
        }
        None => {
            tracing::warn!("ATELIER_IMAGE_API_URL not set; generate and edit jobs are disabled");
            None
        }
    };

    let deps = JobDependencies {
        images: images.clone(),
        blobs: blobs.clone(),
        workers: Arc::new(worker_pool(config)),
        snapshots: Arc::new(BlobRoomSnapshots::new(blobs.clone())),
        generator,
    };
    let registry = standard_registry(&services, &deps)?;

    manager
        .start_primary(registry.clone())
        .await
        .context("failed to start the primary queue connection")?;

    Ok(AtelierApp {
        manager,
        registry,
        images,
        blobs,
    })
}

fn credential_provider(config: &AtelierConfig) -> anyhow::Result<Option<Arc<dyn CredentialProvider>>> {
    match &config.queue_auth {
        QueueAuth::Static => Ok(None),
        QueueAuth::ManagedIdentity { resource, client_id } => {
            let mut provider = ImdsCredentialProvider::new(resource.clone())?;
            if let Some(client_id) = client_id {
                provider = provider.with_client_id(client_id.clone());
            }
            Ok(Some(Arc::new(provider)))
        }
    }
}

/// Stores that must agree across processes: all in memory or all in Postgres.
struct Stores {
    tasks: Arc<dyn TaskStore>,
    images: Arc<dyn ImageStore>,
    connector: Arc<dyn QueueConnector>,
}

async fn persistent_stores(url: &str, credentials: Option<&dyn CredentialProvider>) -> anyhow::Result<Stores> {
    let mut options = PgConnectOptions::from_str(url).context("invalid DATABASE_URL")?;
    // The task and image pool authenticates once at startup; only queue
    // connections follow credential rotation.
    if let Some(provider) = credentials {
        let credential = provider.get_token().await?;
        options = options.password(credential.token());
    }
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
        .context("failed to connect task and image stores")?;

    let tasks = PostgresTaskStore::new(pool.clone());
    tasks.ensure_schema().await?;
    let images = PostgresImageStore::new(pool);
    images.ensure_schema().await?;
    let connector = PostgresQueueConnector::from_url(url)?;
    Ok(Stores {
        tasks: Arc::new(tasks),
        images: Arc::new(images),
        connector: Arc::new(connector),
    })
}

fn notifier(config: &AtelierConfig) -> Arc<dyn Notifier> {
    redis_notifier(config).unwrap_or_else(|| Arc::new(InMemoryNotificationBus::<JobNotification>::new()))
}

#[cfg(feature = "redis")]
fn redis_notifier(config: &AtelierConfig) -> Option<Arc<dyn Notifier>> {
    use atelier_infra::event_bus::{DEFAULT_CHANNEL_PREFIX, RedisNotificationBus};

    let url = config.redis_url.as_deref()?;
    match RedisNotificationBus::new(url, DEFAULT_CHANNEL_PREFIX) {
        Ok(bus) => {
            tracing::info!("publishing job notifications to Redis");
            Some(Arc::new(bus))
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to connect to Redis, falling back to in-memory notifications");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
fn redis_notifier(config: &AtelierConfig) -> Option<Arc<dyn Notifier>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but the redis feature is disabled; using in-memory notifications");
    }
    None
}

fn worker_pool(config: &AtelierConfig) -> WorkerPool {
    let mut builder = WorkerPool::builder()
        .slots(config.worker_slots)
        .maybe_timeout(config.worker_timeout);
    match &config.worker_script_dir {
        Some(dir) => {
            for script in WORKER_SCRIPTS {
                builder = builder.script(script, ProcessExecutor::new(dir.join(script)));
            }
        }
        None => tracing::warn!("ATELIER_WORKER_SCRIPT_DIR not set; worker-backed jobs will fail"),
    }
    builder.build()
}

//! Process configuration from `ATELIER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::manager::QueueManagerConfig;
use crate::worker_pool::default_slots;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is required{reason}")]
    Missing { key: &'static str, reason: &'static str },

    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How the queue backend authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAuth {
    /// Credentials embedded in `DATABASE_URL`; nothing to rotate.
    Static,
    /// Short-lived tokens from the instance metadata identity endpoint.
    ManagedIdentity {
        resource: String,
        client_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageApiConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AtelierConfig {
    /// Postgres task store and queue instead of the in-memory ones.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    /// Enables the Redis notification bus when the `redis` feature is on.
    pub redis_url: Option<String>,
    pub queue_auth: QueueAuth,
    pub queue: QueueManagerConfig,
    pub worker_slots: usize,
    pub worker_timeout: Option<Duration>,
    /// Directory holding one executable per worker script.
    pub worker_script_dir: Option<PathBuf>,
    /// Root of the filesystem blob store; in-memory when unset.
    pub blob_dir: Option<PathBuf>,
    pub image_api: Option<ImageApiConfig>,
}

impl AtelierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let use_persistent_stores = parse_or(&get, "ATELIER_USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL",
                reason: " when ATELIER_USE_PERSISTENT_STORES=true",
            });
        }

        let queue_auth = match get("ATELIER_QUEUE_AUTH").as_deref() {
            None | Some("static") => QueueAuth::Static,
            Some("managed-identity") => QueueAuth::ManagedIdentity {
                resource: get("ATELIER_IDENTITY_RESOURCE").ok_or(ConfigError::Missing {
                    key: "ATELIER_IDENTITY_RESOURCE",
                    reason: " when ATELIER_QUEUE_AUTH=managed-identity",
                })?,
                client_id: get("ATELIER_IDENTITY_CLIENT_ID"),
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "ATELIER_QUEUE_AUTH",
                    value: other.to_owned(),
                    reason: "expected `static` or `managed-identity`".to_owned(),
                });
            }
        };

        let defaults = QueueManagerConfig::default();
        let queue = QueueManagerConfig {
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "ATELIER_QUEUE_POLL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            credential_check_interval: secs_or(
                &get,
                "ATELIER_CREDENTIAL_CHECK_SECS",
                defaults.credential_check_interval,
            )?,
            refresh_threshold: secs_or(&get, "ATELIER_CREDENTIAL_REFRESH_SECS", defaults.refresh_threshold)?,
            connection_grace: secs_or(&get, "ATELIER_CONNECTION_GRACE_SECS", defaults.connection_grace)?,
        };

        let worker_slots = parse_or(&get, "ATELIER_WORKER_SLOTS", default_slots())?;
        if worker_slots == 0 {
            return Err(ConfigError::Invalid {
                key: "ATELIER_WORKER_SLOTS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let worker_timeout = parse_opt::<u64, _>(&get, "ATELIER_WORKER_TIMEOUT_SECS")?.map(Duration::from_secs);

        let image_api = match get("ATELIER_IMAGE_API_URL") {
            Some(url) => Some(ImageApiConfig {
                url,
                api_key: get("ATELIER_IMAGE_API_KEY"),
                timeout: secs_or(&get, "ATELIER_IMAGE_API_TIMEOUT_SECS", Duration::from_secs(120))?,
            }),
            None => None,
        };

        Ok(Self {
            use_persistent_stores,
            database_url,
            redis_url: get("REDIS_URL"),
            queue_auth,
            queue,
            worker_slots,
            worker_timeout,
            worker_script_dir: get("ATELIER_WORKER_SCRIPT_DIR").map(PathBuf::from),
            blob_dir: get("ATELIER_BLOB_DIR").map(PathBuf::from),
            image_api,
        })
    }
}

fn parse_opt<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn secs_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt::<u64, _>(get, key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

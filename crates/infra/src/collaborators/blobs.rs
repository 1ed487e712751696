use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

use super::CollaboratorError;

/// Binary object storage keyed by slash-separated paths
/// (`images/{id}`, `exports/{room}/{export}.pdf`, ...).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CollaboratorError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollaboratorError>;

    /// Returns whether a blob was deleted.
    async fn delete(&self, key: &str) -> Result<bool, CollaboratorError>;

    /// Delete every blob under `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CollaboratorError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs
            .read()
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned() -> CollaboratorError {
    CollaboratorError::Io("blob store lock poisoned".to_owned())
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CollaboratorError> {
        self.blobs
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_owned(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollaboratorError> {
        Ok(self.blobs.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, CollaboratorError> {
        Ok(self
            .blobs
            .write()
            .map_err(|_| poisoned())?
            .remove(key)
            .is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CollaboratorError> {
        let mut blobs = self.blobs.write().map_err(|_| poisoned())?;
        let before = blobs.len();
        blobs.retain(|key, _| !key.starts_with(prefix));
        Ok((before - blobs.len()) as u64)
    }
}

/// Blobs stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `key` below the root, rejecting absolute paths and `..`.
    fn path_for(&self, key: &str) -> Result<PathBuf, CollaboratorError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(CollaboratorError::Io(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(key: &str, err: std::io::Error) -> CollaboratorError {
    CollaboratorError::Io(format!("{key}: {err}"))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CollaboratorError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error(key, e))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollaboratorError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CollaboratorError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(key, e)),
        }
    }

    /// Prefixes are treated as directories (`exports/room1/`).
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CollaboratorError> {
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        let mut removed = 0u64;
        let mut pending = vec![dir.clone()];

        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(prefix, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(prefix, e))? {
                let file_type = entry.file_type().await.map_err(|e| io_error(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else {
                    removed += 1;
                }
            }
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_error(prefix, e)),
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{ImageId, RoomId, UserId};

use super::CollaboratorError;

/// Processing state of an image produced by a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Placeholder written at submission; the job has not produced it yet.
    Working,
    Ready,
    Failed,
}

/// Progress of a pending deletion. `None` on the record means no deletion
/// was requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStatus {
    Working,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub status: ImageStatus,
    pub removal_status: Option<RemovalStatus>,
    pub blob_key: Option<String>,
    /// Image this one was derived from, if any.
    pub source_image_id: Option<ImageId>,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// An image that already has its bytes stored.
    pub fn ready(id: ImageId, room_id: RoomId, user_id: UserId, blob_key: impl Into<String>) -> Self {
        Self {
            id,
            room_id,
            user_id,
            status: ImageStatus::Ready,
            removal_status: None,
            blob_key: Some(blob_key.into()),
            source_image_id: None,
            created_at: Utc::now(),
        }
    }

    /// Row written at submission for an image a job will produce.
    pub fn placeholder(
        id: ImageId,
        room_id: RoomId,
        user_id: UserId,
        source_image_id: Option<ImageId>,
    ) -> Self {
        Self {
            id,
            room_id,
            user_id,
            status: ImageStatus::Working,
            removal_status: None,
            blob_key: None,
            source_image_id,
            created_at: Utc::now(),
        }
    }
}

/// Image metadata rows owned by the application.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Insert a new row. Fails with `Conflict` when the id is taken.
    async fn insert(&self, record: ImageRecord) -> Result<(), CollaboratorError>;

    async fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>, CollaboratorError>;

    /// Set processing status, and the blob key once bytes exist.
    async fn set_status(
        &self,
        id: &ImageId,
        status: ImageStatus,
        blob_key: Option<String>,
    ) -> Result<(), CollaboratorError>;

    async fn set_removal_status(
        &self,
        id: &ImageId,
        removal_status: Option<RemovalStatus>,
    ) -> Result<(), CollaboratorError>;

    /// Returns whether a row was deleted.
    async fn delete(&self, id: &ImageId) -> Result<bool, CollaboratorError>;

    async fn list_room(&self, room_id: &RoomId) -> Result<Vec<ImageRecord>, CollaboratorError>;
}

#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    images: RwLock<HashMap<ImageId, ImageRecord>>,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn update<F>(&self, id: &ImageId, f: F) -> Result<(), CollaboratorError>
    where
        F: FnOnce(&mut ImageRecord),
    {
        let mut images = self.images.write().map_err(|_| poisoned())?;
        let record = images
            .get_mut(id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("image {id}")))?;
        f(record);
        Ok(())
    }
}

fn poisoned() -> CollaboratorError {
    CollaboratorError::Io("image store lock poisoned".to_owned())
}

#[async_trait]
impl ImageStore for InMemoryImageStore {
    async fn insert(&self, record: ImageRecord) -> Result<(), CollaboratorError> {
        let mut images = self.images.write().map_err(|_| poisoned())?;
        if images.contains_key(&record.id) {
            return Err(CollaboratorError::Conflict(format!("image {}", record.id)));
        }
        images.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>, CollaboratorError> {
        let images = self.images.read().map_err(|_| poisoned())?;
        Ok(images.get(id).cloned())
    }

    async fn set_status(
        &self,
        id: &ImageId,
        status: ImageStatus,
        blob_key: Option<String>,
    ) -> Result<(), CollaboratorError> {
        self.update(id, |record| {
            record.status = status;
            if blob_key.is_some() {
                record.blob_key = blob_key;
            }
        })
    }

    async fn set_removal_status(
        &self,
        id: &ImageId,
        removal_status: Option<RemovalStatus>,
    ) -> Result<(), CollaboratorError> {
        self.update(id, |record| record.removal_status = removal_status)
    }

    async fn delete(&self, id: &ImageId) -> Result<bool, CollaboratorError> {
        let mut images = self.images.write().map_err(|_| poisoned())?;
        Ok(images.remove(id).is_some())
    }

    async fn list_room(&self, room_id: &RoomId) -> Result<Vec<ImageRecord>, CollaboratorError> {
        let images = self.images.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = images
            .values()
            .filter(|r| &r.room_id == room_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_refuses_to_overwrite_an_existing_row() {
        let store = InMemoryImageStore::new();
        let id = ImageId::from("img1");
        store
            .insert(ImageRecord::ready(id.clone(), "room1".into(), "user1".into(), "images/img1"))
            .await
            .unwrap();

        let err = store
            .insert(ImageRecord::placeholder(id.clone(), "room2".into(), "user2".into(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Conflict(_)));

        let kept = store.get(&id).await.unwrap().unwrap();
        assert_eq!(kept.room_id, RoomId::from("room1"));
        assert_eq!(kept.status, ImageStatus::Ready);
    }

    #[tokio::test]
    async fn status_update_keeps_existing_blob_key_when_none_given() {
        let store = InMemoryImageStore::new();
        let id = ImageId::from("img1");
        store
            .insert(ImageRecord::ready(id.clone(), "room1".into(), "user1".into(), "images/img1"))
            .await
            .unwrap();

        store.set_status(&id, ImageStatus::Failed, None).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Failed);
        assert_eq!(record.blob_key.as_deref(), Some("images/img1"));
    }

    #[tokio::test]
    async fn updating_a_missing_image_is_not_found() {
        let store = InMemoryImageStore::new();
        let err = store
            .set_removal_status(&ImageId::from("ghost"), Some(RemovalStatus::Working))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
    }
}

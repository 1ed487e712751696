use std::sync::Arc;

use async_trait::async_trait;

use atelier_core::RoomId;

use super::CollaboratorError;
use super::blobs::BlobStore;

/// Source of encoded room document snapshots (the collaborative editing
/// engine's state). The bytes are opaque to the job core.
#[async_trait]
pub trait RoomSnapshots: Send + Sync {
    async fn snapshot(&self, room_id: &RoomId) -> Result<Vec<u8>, CollaboratorError>;
}

/// Reads the latest snapshot the editing engine persisted to blob storage
/// under `rooms/{room_id}/document`.
pub struct BlobRoomSnapshots {
    blobs: Arc<dyn BlobStore>,
}

impl BlobRoomSnapshots {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn key_for(room_id: &RoomId) -> String {
        format!("rooms/{room_id}/document")
    }
}

#[async_trait]
impl RoomSnapshots for BlobRoomSnapshots {
    async fn snapshot(&self, room_id: &RoomId) -> Result<Vec<u8>, CollaboratorError> {
        self.blobs
            .get(&Self::key_for(room_id))
            .await?
            .ok_or_else(|| CollaboratorError::NotFound(format!("document of room {room_id}")))
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use atelier_core::JobKind;

use super::{JobDependencies, require_room_key_segment, room_export_prefix};
use crate::collaborators::{BlobStore, ImageStore};
use crate::error::JobError;
use crate::jobs::spec::{JobContext, JobOwner, JobSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRoomPayload {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomDeletion {
    pub images: u64,
    pub blobs: u64,
}

/// Removes every image of the room (bytes and rows) and its exports.
pub struct DeleteRoomJob {
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
}

impl DeleteRoomJob {
    pub fn new(deps: &JobDependencies) -> Self {
        Self {
            images: deps.images.clone(),
            blobs: deps.blobs.clone(),
        }
    }
}

#[async_trait]
impl JobSpec for DeleteRoomJob {
    type Payload = DeleteRoomPayload;
    type Output = RoomDeletion;

    fn kind(&self) -> JobKind {
        JobKind::DeleteRoom
    }

    fn validate(&self, owner: &JobOwner, _payload: &Self::Payload) -> Result<(), JobError> {
        require_room_key_segment(&owner.room_id)
    }

    async fn execute(&self, ctx: &JobContext, _payload: &Self::Payload) -> Result<RoomDeletion, JobError> {
        let room_id = &ctx.owner.room_id;
        require_room_key_segment(room_id)?;
        let mut deletion = RoomDeletion { images: 0, blobs: 0 };

        for image in self.images.list_room(room_id).await? {
            if let Some(key) = &image.blob_key {
                if self.blobs.delete(key).await? {
                    deletion.blobs += 1;
                }
            }
            if self.images.delete(&image.id).await? {
                deletion.images += 1;
            }
        }
        deletion.blobs += self.blobs.delete_prefix(&room_export_prefix(room_id)).await?;

        info!(room_id = %room_id, images = deletion.images, blobs = deletion.blobs, "room content deleted");
        Ok(deletion)
    }

    async fn on_success(
        &self,
        _ctx: &JobContext,
        _payload: &Self::Payload,
        deletion: RoomDeletion,
    ) -> Result<Value, JobError> {
        Ok(json!({ "deleted_images": deletion.images, "deleted_blobs": deletion.blobs }))
    }
}

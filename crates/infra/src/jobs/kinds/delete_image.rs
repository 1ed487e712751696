use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use atelier_core::{ImageId, JobKind};

use super::{JobDependencies, room_image};
use crate::collaborators::{BlobStore, ImageStore, RemovalStatus};
use crate::error::JobError;
use crate::jobs::spec::{JobContext, JobOwner, JobSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteImagePayload {
    pub image_id: ImageId,
}

impl DeleteImagePayload {
    pub fn new(image_id: impl Into<ImageId>) -> Self {
        Self {
            image_id: image_id.into(),
        }
    }
}

/// Deletes an image's bytes and row. The row carries `removal_status =
/// working` while the job is pending and `failed` if it fails.
pub struct DeleteImageJob {
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
}

impl DeleteImageJob {
    pub fn new(deps: &JobDependencies) -> Self {
        Self {
            images: deps.images.clone(),
            blobs: deps.blobs.clone(),
        }
    }
}

#[async_trait]
impl JobSpec for DeleteImageJob {
    type Payload = DeleteImagePayload;
    /// Whether a row was removed.
    type Output = bool;

    fn kind(&self) -> JobKind {
        JobKind::DeleteImage
    }

    fn validate(&self, _owner: &JobOwner, payload: &Self::Payload) -> Result<(), JobError> {
        ImageId::parse(payload.image_id.as_str())?;
        Ok(())
    }

    async fn prepare(&self, ctx: &JobContext, payload: &mut Self::Payload) -> Result<Value, JobError> {
        room_image(self.images.as_ref(), &ctx.owner, &payload.image_id).await?;
        self.images
            .set_removal_status(&payload.image_id, Some(RemovalStatus::Working))
            .await?;
        Ok(json!({ "image_id": payload.image_id }))
    }

    async fn execute(&self, _ctx: &JobContext, payload: &Self::Payload) -> Result<bool, JobError> {
        let Some(record) = self.images.get(&payload.image_id).await? else {
            debug!(image_id = %payload.image_id, "image already gone");
            return Ok(false);
        };
        if let Some(key) = &record.blob_key {
            self.blobs.delete(key).await?;
        }
        Ok(self.images.delete(&payload.image_id).await?)
    }

    async fn on_success(
        &self,
        _ctx: &JobContext,
        payload: &Self::Payload,
        deleted: bool,
    ) -> Result<Value, JobError> {
        Ok(json!({ "image_id": payload.image_id, "deleted": deleted }))
    }

    async fn on_failure(
        &self,
        _ctx: &JobContext,
        payload: &Self::Payload,
        _error: &JobError,
    ) -> Result<(), JobError> {
        self.images
            .set_removal_status(&payload.image_id, Some(RemovalStatus::Failed))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::kinds::testing::{ctx, fixture};

    #[tokio::test]
    async fn prepare_marks_removal_working() {
        let fx = fixture(None);
        fx.seed_image("room1", "img1", b"png").await;
        let job = DeleteImageJob::new(&fx.deps);

        let mut payload = DeleteImagePayload::new("img1");
        job.prepare(&ctx(JobKind::DeleteImage), &mut payload).await.unwrap();

        let record = fx.images.get(&"img1".into()).await.unwrap().unwrap();
        assert_eq!(record.removal_status, Some(RemovalStatus::Working));
    }

    #[tokio::test]
    async fn image_of_another_room_is_not_found() {
        let fx = fixture(None);
        fx.seed_image("room2", "img1", b"png").await;
        let job = DeleteImageJob::new(&fx.deps);

        let mut payload = DeleteImagePayload::new("img1");
        let err = job
            .prepare(&ctx(JobKind::DeleteImage), &mut payload)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn execute_removes_row_and_blob() {
        let fx = fixture(None);
        fx.seed_image("room1", "img1", b"png").await;
        let job = DeleteImageJob::new(&fx.deps);

        let deleted = job
            .execute(&ctx(JobKind::DeleteImage), &DeleteImagePayload::new("img1"))
            .await
            .unwrap();
        assert!(deleted);
        assert!(fx.images.get(&"img1".into()).await.unwrap().is_none());
        assert!(fx.blobs.keys().is_empty());
    }

    #[tokio::test]
    async fn failure_marks_removal_failed() {
        let fx = fixture(None);
        fx.seed_image("room1", "img1", b"png").await;
        let job = DeleteImageJob::new(&fx.deps);

        job.on_failure(
            &ctx(JobKind::DeleteImage),
            &DeleteImagePayload::new("img1"),
            &JobError::collaborator("blob store down"),
        )
        .await
        .unwrap();
        let record = fx.images.get(&"img1".into()).await.unwrap().unwrap();
        assert_eq!(record.removal_status, Some(RemovalStatus::Failed));
    }

    #[test]
    fn blank_image_id_is_rejected() {
        let fx = fixture(None);
        let job = DeleteImageJob::new(&fx.deps);
        let err = job
            .validate(&JobOwner::new("room1", "user1"), &DeleteImagePayload::new(" "))
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use atelier_core::{ImageId, JobKind};

use super::{
    JobDependencies, insert_output_placeholder, load_image_bytes, mark_output_failed, output_id,
    room_image, store_output_image,
};
use crate::collaborators::{BlobStore, ImageStore};
use crate::error::JobError;
use crate::jobs::spec::{JobContext, JobOwner, JobSpec};
use crate::worker_pool::{WorkerPool, WorkerRequest};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipDirection {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTransformPayload {
    pub source_image_id: ImageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<FlipDirection>,
    /// Assigned at submission; a submitted value is ignored.
    #[serde(default)]
    pub output_image_id: Option<ImageId>,
}

impl ImageTransformPayload {
    pub fn new(source_image_id: impl Into<ImageId>) -> Self {
        Self {
            source_image_id: source_image_id.into(),
            direction: None,
            output_image_id: None,
        }
    }

    pub fn with_direction(mut self, direction: FlipDirection) -> Self {
        self.direction = Some(direction);
        self
    }
}

/// Runs a worker script over an image's bytes and stores the result as a new
/// image derived from the source.
pub struct ImageTransformJob {
    kind: JobKind,
    script: &'static str,
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
    workers: Arc<WorkerPool>,
}

impl ImageTransformJob {
    pub fn remove_background(deps: &JobDependencies) -> Self {
        Self::with_script(JobKind::RemoveBackground, "remove-background", deps)
    }

    pub fn flip(deps: &JobDependencies) -> Self {
        Self::with_script(JobKind::FlipImage, "flip-image", deps)
    }

    fn with_script(kind: JobKind, script: &'static str, deps: &JobDependencies) -> Self {
        Self {
            kind,
            script,
            images: deps.images.clone(),
            blobs: deps.blobs.clone(),
            workers: deps.workers.clone(),
        }
    }
}

#[async_trait]
impl JobSpec for ImageTransformJob {
    type Payload = ImageTransformPayload;
    type Output = Vec<u8>;

    fn kind(&self) -> JobKind {
        self.kind
    }

    fn validate(&self, _owner: &JobOwner, payload: &Self::Payload) -> Result<(), JobError> {
        ImageId::parse(payload.source_image_id.as_str())?;
        if self.kind == JobKind::FlipImage && payload.direction.is_none() {
            return Err(JobError::validation("flip-image requires a direction"));
        }
        Ok(())
    }

    async fn prepare(&self, ctx: &JobContext, payload: &mut Self::Payload) -> Result<Value, JobError> {
        room_image(self.images.as_ref(), &ctx.owner, &payload.source_image_id).await?;
        let output = insert_output_placeholder(
            self.images.as_ref(),
            &ctx.owner,
            &mut payload.output_image_id,
            Some(payload.source_image_id.clone()),
        )
        .await?;
        Ok(json!({
            "source_image_id": payload.source_image_id,
            "output_image_id": output,
        }))
    }

    async fn execute(&self, ctx: &JobContext, payload: &Self::Payload) -> Result<Vec<u8>, JobError> {
        let input = load_image_bytes(
            self.images.as_ref(),
            self.blobs.as_ref(),
            &ctx.owner,
            &payload.source_image_id,
        )
        .await?;
        let mut request = WorkerRequest::new(input);
        if let Some(direction) = payload.direction {
            request = request.with_args(json!({ "direction": direction }));
        }
        self.workers.run(self.script, request).await
    }

    async fn on_success(
        &self,
        ctx: &JobContext,
        payload: &Self::Payload,
        output: Vec<u8>,
    ) -> Result<Value, JobError> {
        let image_id = output_id(payload.output_image_id.as_ref())?;
        let key = store_output_image(
            self.images.as_ref(),
            self.blobs.as_ref(),
            &ctx.owner,
            image_id,
            output,
        )
        .await?;
        Ok(json!({ "output_image_id": image_id, "blob_key": key }))
    }

    async fn on_failure(
        &self,
        _ctx: &JobContext,
        payload: &Self::Payload,
        _error: &JobError,
    ) -> Result<(), JobError> {
        mark_output_failed(self.images.as_ref(), payload.output_image_id.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ImageStatus;
    use crate::jobs::kinds::testing::{ctx, fixture};
    use atelier_core::RoomId;

    #[test]
    fn flip_without_direction_is_rejected() {
        let fx = fixture(None);
        let job = ImageTransformJob::flip(&fx.deps);
        let err = job
            .validate(&JobOwner::new("room1", "user1"), &ImageTransformPayload::new("img1"))
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));

        let background = ImageTransformJob::remove_background(&fx.deps);
        background
            .validate(&JobOwner::new("room1", "user1"), &ImageTransformPayload::new("img1"))
            .unwrap();
    }

    #[tokio::test]
    async fn flip_runs_the_script_and_readies_the_output() {
        let fx = fixture(None);
        fx.seed_image("room1", "img1", &[1, 2, 3]).await;
        let job = ImageTransformJob::flip(&fx.deps);
        let ctx = ctx(JobKind::FlipImage);

        let mut payload = ImageTransformPayload::new("img1").with_direction(FlipDirection::Horizontal);
        let metadata = job.prepare(&ctx, &mut payload).await.unwrap();
        let output = payload.output_image_id.clone().unwrap();
        assert_eq!(metadata["output_image_id"], output.as_str());

        let placeholder = fx.images.get(&output).await.unwrap().unwrap();
        assert_eq!(placeholder.status, ImageStatus::Working);
        assert_eq!(placeholder.source_image_id, Some(ImageId::from("img1")));

        let bytes = job.execute(&ctx, &payload).await.unwrap();
        assert_eq!(bytes, vec![3, 2, 1]);

        let result = job.on_success(&ctx, &payload, bytes).await.unwrap();
        let ready = fx.images.get(&output).await.unwrap().unwrap();
        assert_eq!(ready.status, ImageStatus::Ready);
        assert_eq!(result["blob_key"], ready.blob_key.unwrap().as_str());
    }

    #[tokio::test]
    async fn failure_marks_the_output_failed() {
        let fx = fixture(None);
        fx.seed_image("room1", "img1", &[1]).await;
        let job = ImageTransformJob::remove_background(&fx.deps);
        let ctx = ctx(JobKind::RemoveBackground);

        let mut payload = ImageTransformPayload::new("img1");
        job.prepare(&ctx, &mut payload).await.unwrap();
        job.on_failure(&ctx, &payload, &JobError::collaborator("boom"))
            .await
            .unwrap();

        let output = fx
            .images
            .get(payload.output_image_id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.status, ImageStatus::Failed);
    }

    #[tokio::test]
    async fn missing_source_bytes_fail_execution() {
        let fx = fixture(None);
        let job = ImageTransformJob::remove_background(&fx.deps);
        let err = job
            .execute(&ctx(JobKind::RemoveBackground), &ImageTransformPayload::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn submitted_output_id_cannot_target_the_source() {
        let fx = fixture(None);
        fx.seed_image("room1", "img1", &[1, 2, 3]).await;
        let job = ImageTransformJob::flip(&fx.deps);
        let ctx = ctx(JobKind::FlipImage);

        let mut payload: ImageTransformPayload = serde_json::from_value(json!({
            "source_image_id": "img1",
            "direction": "horizontal",
            "output_image_id": "img1",
        }))
        .unwrap();
        job.prepare(&ctx, &mut payload).await.unwrap();

        let output = payload.output_image_id.clone().unwrap();
        assert_ne!(output, ImageId::from("img1"));
        let source = fx.images.get(&ImageId::from("img1")).await.unwrap().unwrap();
        assert_eq!(source.status, ImageStatus::Ready);
        assert!(source.blob_key.is_some());
        assert_eq!(job.execute(&ctx, &payload).await.unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn submitted_output_id_cannot_take_over_another_room_image() {
        let fx = fixture(None);
        fx.seed_image("room1", "img1", &[1]).await;
        fx.seed_image("room2", "victim", &[9]).await;
        let job = ImageTransformJob::remove_background(&fx.deps);

        let mut payload = ImageTransformPayload::new("img1");
        payload.output_image_id = Some(ImageId::from("victim"));
        job.prepare(&ctx(JobKind::RemoveBackground), &mut payload).await.unwrap();

        assert_ne!(payload.output_image_id, Some(ImageId::from("victim")));
        let victim = fx.images.get(&ImageId::from("victim")).await.unwrap().unwrap();
        assert_eq!(victim.room_id, RoomId::from("room2"));
        assert_eq!(victim.status, ImageStatus::Ready);
    }
}

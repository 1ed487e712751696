use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use atelier_core::{ImageId, JobKind};

use super::{
    JobDependencies, insert_output_placeholder, mark_output_failed, output_id, require_prompt,
    store_output_image,
};
use crate::collaborators::{BlobStore, ImageGenerator, ImageSize, ImageStore};
use crate::error::JobError;
use crate::jobs::spec::{JobContext, JobOwner, JobSpec};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateImagePayload {
    pub prompt: String,
    #[serde(default)]
    pub size: ImageSize,
    #[serde(default)]
    pub output_image_id: Option<ImageId>,
}

impl GenerateImagePayload {
    pub fn new(prompt: impl Into<String>, size: ImageSize) -> Self {
        Self {
            prompt: prompt.into(),
            size,
            output_image_id: None,
        }
    }
}

pub struct GenerateImageJob {
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
    generator: Option<Arc<dyn ImageGenerator>>,
}

impl GenerateImageJob {
    pub fn new(deps: &JobDependencies) -> Self {
        Self {
            images: deps.images.clone(),
            blobs: deps.blobs.clone(),
            generator: deps.generator.clone(),
        }
    }

    fn generator(&self) -> Result<&Arc<dyn ImageGenerator>, JobError> {
        self.generator
            .as_ref()
            .ok_or_else(|| JobError::validation("image generation is not configured"))
    }
}

#[async_trait]
impl JobSpec for GenerateImageJob {
    type Payload = GenerateImagePayload;
    type Output = Vec<u8>;

    fn kind(&self) -> JobKind {
        JobKind::GenerateImage
    }

    fn validate(&self, _owner: &JobOwner, payload: &Self::Payload) -> Result<(), JobError> {
        self.generator()?;
        require_prompt(&payload.prompt)
    }

    async fn prepare(&self, ctx: &JobContext, payload: &mut Self::Payload) -> Result<Value, JobError> {
        let output = insert_output_placeholder(
            self.images.as_ref(),
            &ctx.owner,
            &mut payload.output_image_id,
            None,
        )
        .await?;
        Ok(json!({ "output_image_id": output, "size": payload.size }))
    }

    async fn execute(&self, _ctx: &JobContext, payload: &Self::Payload) -> Result<Vec<u8>, JobError> {
        Ok(self.generator()?.generate(&payload.prompt, payload.size).await?)
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
    use crate::collaborators::{CollaboratorError, ImageStatus};
    use crate::jobs::kinds::testing::{ctx, fixture};

    struct FixedGenerator;

    #[async_trait]
    impl ImageGenerator for FixedGenerator {
        async fn generate(&self, prompt: &str, size: ImageSize) -> Result<Vec<u8>, CollaboratorError> {
            Ok(format!("{prompt}@{}", size.as_str()).into_bytes())
        }

        async fn edit(
            &self,
            _prompt: &str,
            _source: Vec<u8>,
            _references: Vec<Vec<u8>>,
        ) -> Result<Vec<u8>, CollaboratorError> {
            Err(CollaboratorError::Upstream("not used".into()))
        }
    }

    #[test]
    fn size_defaults_to_square() {
        let payload: GenerateImagePayload = serde_json::from_value(json!({ "prompt": "a cat" })).unwrap();
        assert_eq!(payload.size, ImageSize::Square);
    }

    #[tokio::test]
    async fn generated_image_lands_in_the_placeholder() {
        let fx = fixture(Some(Arc::new(FixedGenerator)));
        let job = GenerateImageJob::new(&fx.deps);
        let ctx = ctx(JobKind::GenerateImage);

        let mut payload = GenerateImagePayload::new("a cat", ImageSize::Portrait);
        job.prepare(&ctx, &mut payload).await.unwrap();
        let bytes = job.execute(&ctx, &payload).await.unwrap();
        job.on_success(&ctx, &payload, bytes).await.unwrap();

        let image_id = payload.output_image_id.unwrap();
        let record = fx.images.get(&image_id).await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Ready);
        assert_eq!(record.source_image_id, None);
        let stored = fx.blobs.get(&record.blob_key.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored, b"a cat@1024x1536");
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use atelier_core::{ImageId, JobKind};

use super::{
    JobDependencies, insert_output_placeholder, load_image_bytes, mark_output_failed, output_id,
    require_prompt, room_image, store_output_image,
};
use crate::collaborators::{BlobStore, ImageGenerator, ImageStore};
use crate::error::JobError;
use crate::jobs::spec::{JobContext, JobOwner, JobSpec};

/// Upper bound on reference images per edit.
pub const MAX_REFERENCE_IMAGES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditImagePayload {
    pub source_image_id: ImageId,
    pub prompt: String,
    #[serde(default)]
    pub reference_image_ids: Vec<ImageId>,
    #[serde(default)]
    pub output_image_id: Option<ImageId>,
}

impl EditImagePayload {
    pub fn new(source_image_id: impl Into<ImageId>, prompt: impl Into<String>) -> Self {
        Self {
            source_image_id: source_image_id.into(),
            prompt: prompt.into(),
            reference_image_ids: Vec::new(),
            output_image_id: None,
        }
    }

    pub fn with_references<I, T>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ImageId>,
    {
        self.reference_image_ids = references.into_iter().map(Into::into).collect();
        self
    }
}

/// Prompt-driven edit of an existing image through the generation API.
pub struct EditImageJob {
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
    generator: Option<Arc<dyn ImageGenerator>>,
}

impl EditImageJob {
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
impl JobSpec for EditImageJob {
    type Payload = EditImagePayload;
    type Output = Vec<u8>;

    fn kind(&self) -> JobKind {
        JobKind::EditImage
    }

    fn validate(&self, _owner: &JobOwner, payload: &Self::Payload) -> Result<(), JobError> {
        self.generator()?;
        require_prompt(&payload.prompt)?;
        ImageId::parse(payload.source_image_id.as_str())?;
        if payload.reference_image_ids.len() > MAX_REFERENCE_IMAGES {
            return Err(JobError::validation(format!(
                "at most {MAX_REFERENCE_IMAGES} reference images are allowed, got {}",
                payload.reference_image_ids.len()
            )));
        }
        Ok(())
    }

    async fn prepare(&self, ctx: &JobContext, payload: &mut Self::Payload) -> Result<Value, JobError> {
        room_image(self.images.as_ref(), &ctx.owner, &payload.source_image_id).await?;
        for reference in &payload.reference_image_ids {
            room_image(self.images.as_ref(), &ctx.owner, reference).await?;
        }
        let output = insert_output_placeholder(
            self.images.as_ref(),
            &ctx.owner,
            &mut payload.output_image_id,
            Some(payload.source_image_id.clone()),
        )
        .await?;
        Ok(json!({
            "source_image_id": payload.source_image_id,
            "reference_image_ids": payload.reference_image_ids,
            "output_image_id": output,
        }))
    }

    async fn execute(&self, ctx: &JobContext, payload: &Self::Payload) -> Result<Vec<u8>, JobError> {
        let generator = self.generator()?;
        let source = load_image_bytes(
            self.images.as_ref(),
            self.blobs.as_ref(),
            &ctx.owner,
            &payload.source_image_id,
        )
        .await?;
        let mut references = Vec::with_capacity(payload.reference_image_ids.len());
        for reference in &payload.reference_image_ids {
            references.push(
                load_image_bytes(self.images.as_ref(), self.blobs.as_ref(), &ctx.owner, reference)
                    .await?,
            );
        }
        Ok(generator.edit(&payload.prompt, source, references).await?)
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

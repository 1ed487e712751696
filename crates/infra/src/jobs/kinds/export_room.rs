use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use atelier_core::{ExportId, JobKind, RoomId};

use super::{JobDependencies, require_room_key_segment, room_export_prefix};
use crate::collaborators::{BlobStore, RoomSnapshots};
use crate::error::JobError;
use crate::jobs::spec::{JobContext, JobOwner, JobSpec};
use crate::worker_pool::{WorkerPool, WorkerRequest};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Pdf,
    Png,
}

impl ExportFormat {
    pub fn kind(&self) -> JobKind {
        match self {
            ExportFormat::Pdf => JobKind::ExportPdf,
            ExportFormat::Png => JobKind::ExportPng,
        }
    }

    pub fn script(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "export-pdf",
            ExportFormat::Png => "export-png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Png => "png",
        }
    }

    pub fn blob_key(&self, room_id: &RoomId, export_id: &ExportId) -> String {
        format!("{}{export_id}.{}", room_export_prefix(room_id), self.extension())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportRoomPayload {
    /// Assigned at submission; a submitted value is ignored.
    #[serde(default)]
    pub export_id: Option<ExportId>,
    /// Renderer options passed through to the worker script.
    #[serde(default)]
    pub options: Value,
}

/// Renders the room's current document snapshot to a file in blob storage.
pub struct ExportRoomJob {
    format: ExportFormat,
    blobs: Arc<dyn BlobStore>,
    snapshots: Arc<dyn RoomSnapshots>,
    workers: Arc<WorkerPool>,
}

impl ExportRoomJob {
    pub fn new(format: ExportFormat, deps: &JobDependencies) -> Self {
        Self {
            format,
            blobs: deps.blobs.clone(),
            snapshots: deps.snapshots.clone(),
            workers: deps.workers.clone(),
        }
    }
}

#[async_trait]
impl JobSpec for ExportRoomJob {
    type Payload = ExportRoomPayload;
    type Output = Vec<u8>;

    fn kind(&self) -> JobKind {
        self.format.kind()
    }

    fn validate(&self, owner: &JobOwner, _payload: &Self::Payload) -> Result<(), JobError> {
        require_room_key_segment(&owner.room_id)
    }

    async fn prepare(&self, _ctx: &JobContext, payload: &mut Self::Payload) -> Result<Value, JobError> {
        let export_id = ExportId::generate();
        payload.export_id = Some(export_id.clone());
        Ok(json!({ "export_id": export_id, "format": self.format }))
    }

    async fn execute(&self, ctx: &JobContext, payload: &Self::Payload) -> Result<Vec<u8>, JobError> {
        let snapshot = self.snapshots.snapshot(&ctx.owner.room_id).await?;
        let request = WorkerRequest::new(snapshot).with_args(payload.options.clone());
        self.workers.run(self.format.script(), request).await
    }

    async fn on_success(
        &self,
        ctx: &JobContext,
        payload: &Self::Payload,
        output: Vec<u8>,
    ) -> Result<Value, JobError> {
        let export_id = payload
            .export_id
            .as_ref()
            .ok_or_else(|| JobError::Payload("export_id was not assigned".to_owned()))?;
        let key = self.format.blob_key(&ctx.owner.room_id, export_id);
        let size = output.len();
        self.blobs.put(&key, output).await?;
        Ok(json!({ "export_id": export_id, "blob_key": key, "bytes": size }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::BlobRoomSnapshots;
    use crate::jobs::kinds::testing::{ctx, fixture};

    #[test]
    fn blob_key_uses_room_and_extension() {
        let key = ExportFormat::Png.blob_key(&RoomId::from("room1"), &ExportId::from("e1"));
        assert_eq!(key, "exports/room1/e1.png");
    }

    #[test]
    fn exports_of_a_nested_room_id_are_rejected() {
        let fx = fixture(None);
        let job = ExportRoomJob::new(ExportFormat::Pdf, &fx.deps);

        let err = job
            .validate(&JobOwner::new("room1/x", "user1"), &ExportRoomPayload::default())
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)), "{err}");
        assert!(job.validate(&JobOwner::new("room1", "user1"), &ExportRoomPayload::default()).is_ok());
    }

    #[tokio::test]
    async fn pdf_export_renders_the_snapshot() {
        let fx = fixture(None);
        fx.blobs
            .put(&BlobRoomSnapshots::key_for(&RoomId::from("room1")), b"doc".to_vec())
            .await
            .unwrap();
        let job = ExportRoomJob::new(ExportFormat::Pdf, &fx.deps);
        let ctx = ctx(JobKind::ExportPdf);

        let mut payload = ExportRoomPayload::default();
        job.prepare(&ctx, &mut payload).await.unwrap();
        let bytes = job.execute(&ctx, &payload).await.unwrap();
        let result = job.on_success(&ctx, &payload, bytes).await.unwrap();

        let key = result["blob_key"].as_str().unwrap();
        assert!(key.starts_with("exports/room1/") && key.ends_with(".pdf"));
        assert_eq!(fx.blobs.get(key).await.unwrap().unwrap(), b"%PDFdoc");
    }

    #[tokio::test]
    async fn missing_snapshot_fails_with_resource_not_found() {
        let fx = fixture(None);
        let job = ExportRoomJob::new(ExportFormat::Png, &fx.deps);
        let err = job
            .execute(&ctx(JobKind::ExportPng), &ExportRoomPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn submitted_export_id_is_replaced() {
        let fx = fixture(None);
        let job = ExportRoomJob::new(ExportFormat::Pdf, &fx.deps);
        let mut payload = ExportRoomPayload {
            export_id: Some(ExportId::from("../room2/e1")),
            ..ExportRoomPayload::default()
        };

        let metadata = job.prepare(&ctx(JobKind::ExportPdf), &mut payload).await.unwrap();
        let export_id = payload.export_id.clone().unwrap();
        assert_ne!(export_id, ExportId::from("../room2/e1"));
        assert_eq!(metadata["export_id"], export_id.as_str());
    }
}

//! Concrete job kinds.
//!
//! Kinds that produce an image share one pattern: `prepare` derives the
//! output id and writes a `working` placeholder row, `on_success` stores the
//! bytes and flips the row to `ready`, `on_failure` flips it to `failed`.

pub mod delete_image;
pub mod delete_room;
pub mod edit_image;
pub mod export_room;
pub mod generate_image;
pub mod image_transform;

use std::sync::Arc;

use atelier_core::{ImageId, RoomId};

use super::handler::{JobHandler, JobServices};
use super::registry::JobRegistry;
use super::spec::JobOwner;
use crate::collaborators::{
    BlobStore, ImageGenerator, ImageRecord, ImageStatus, ImageStore, RoomSnapshots,
};
use crate::error::JobError;
use crate::worker_pool::WorkerPool;

pub use delete_image::{DeleteImageJob, DeleteImagePayload};
pub use delete_room::{DeleteRoomJob, DeleteRoomPayload};
pub use edit_image::{EditImageJob, EditImagePayload, MAX_REFERENCE_IMAGES};
pub use export_room::{ExportFormat, ExportRoomJob, ExportRoomPayload};
pub use generate_image::{GenerateImageJob, GenerateImagePayload};
pub use image_transform::{FlipDirection, ImageTransformJob, ImageTransformPayload};

/// Collaborators the job kinds act upon.
#[derive(Clone)]
pub struct JobDependencies {
    pub images: Arc<dyn ImageStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub workers: Arc<WorkerPool>,
    pub snapshots: Arc<dyn RoomSnapshots>,
    /// `None` when no generation API is configured; generation and edit jobs
    /// are then rejected at submission.
    pub generator: Option<Arc<dyn ImageGenerator>>,
}

/// Registry with a handler for every job kind.
pub fn standard_registry(
    services: &JobServices,
    deps: &JobDependencies,
) -> Result<Arc<JobRegistry>, JobError> {
    let registry = JobRegistry::builder(services.tasks.clone())
        .register(JobHandler::new(DeleteImageJob::new(deps), services))?
        .register(JobHandler::new(ImageTransformJob::remove_background(deps), services))?
        .register(JobHandler::new(ImageTransformJob::flip(deps), services))?
        .register(JobHandler::new(EditImageJob::new(deps), services))?
        .register(JobHandler::new(GenerateImageJob::new(deps), services))?
        .register(JobHandler::new(ExportRoomJob::new(ExportFormat::Pdf, deps), services))?
        .register(JobHandler::new(ExportRoomJob::new(ExportFormat::Png, deps), services))?
        .register(JobHandler::new(DeleteRoomJob::new(deps), services))?
        .build();
    Ok(registry)
}

/// Blob key of a job-produced image.
pub fn image_blob_key(room_id: &RoomId, image_id: &ImageId) -> String {
    format!("images/{room_id}/{image_id}")
}

/// Blob prefix holding every export of a room.
pub fn room_export_prefix(room_id: &RoomId) -> String {
    format!("exports/{room_id}/")
}

/// Room ids are a single blob key segment, so one room's prefix never covers
/// another room's keys.
fn require_room_key_segment(room_id: &RoomId) -> Result<(), JobError> {
    let room = room_id.as_str();
    if room.trim().is_empty() || room.contains('/') || room == "." || room == ".." {
        return Err(JobError::validation(format!(
            "room id {room:?} cannot be used in a blob key"
        )));
    }
    Ok(())
}

/// An image of the owner's room; images of other rooms are reported missing.
async fn room_image(
    images: &dyn ImageStore,
    owner: &JobOwner,
    image_id: &ImageId,
) -> Result<ImageRecord, JobError> {
    match images.get(image_id).await? {
        Some(record) if record.room_id == owner.room_id => Ok(record),
        _ => Err(JobError::resource_not_found(format!(
            "image {image_id} in room {}",
            owner.room_id
        ))),
    }
}

async fn load_image_bytes(
    images: &dyn ImageStore,
    blobs: &dyn BlobStore,
    owner: &JobOwner,
    image_id: &ImageId,
) -> Result<Vec<u8>, JobError> {
    let record = room_image(images, owner, image_id).await?;
    let key = record
        .blob_key
        .ok_or_else(|| JobError::resource_not_found(format!("bytes of image {image_id}")))?;
    blobs
        .get(&key)
        .await?
        .ok_or_else(|| JobError::resource_not_found(format!("blob {key}")))
}

/// Assign a fresh output id and write its `working` placeholder.
///
/// Any id already in `output` came from the submitter and is replaced.
async fn insert_output_placeholder(
    images: &dyn ImageStore,
    owner: &JobOwner,
    output: &mut Option<ImageId>,
    source: Option<ImageId>,
) -> Result<ImageId, JobError> {
    let id = ImageId::generate();
    *output = Some(id.clone());
    images
        .insert(ImageRecord::placeholder(
            id.clone(),
            owner.room_id.clone(),
            owner.user_id.clone(),
            source,
        ))
        .await?;
    Ok(id)
}

/// Store produced bytes and mark the placeholder `ready`. Returns the blob key.
async fn store_output_image(
    images: &dyn ImageStore,
    blobs: &dyn BlobStore,
    owner: &JobOwner,
    image_id: &ImageId,
    bytes: Vec<u8>,
) -> Result<String, JobError> {
    let key = image_blob_key(&owner.room_id, image_id);
    blobs.put(&key, bytes).await?;
    images
        .set_status(image_id, ImageStatus::Ready, Some(key.clone()))
        .await?;
    Ok(key)
}

async fn mark_output_failed(images: &dyn ImageStore, output: Option<&ImageId>) -> Result<(), JobError> {
    if let Some(id) = output {
        images.set_status(id, ImageStatus::Failed, None).await?;
    }
    Ok(())
}

fn output_id(output: Option<&ImageId>) -> Result<&ImageId, JobError> {
    output.ok_or_else(|| JobError::Payload("output_image_id was not assigned".to_owned()))
}

fn require_prompt(prompt: &str) -> Result<(), JobError> {
    if prompt.trim().is_empty() {
        return Err(JobError::validation("prompt must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::collaborators::{BlobRoomSnapshots, InMemoryBlobStore, InMemoryImageStore};
    use crate::worker_pool::{BlockingExecutor, WorkerReply, WorkerRequest};

    pub(crate) struct Fixture {
        pub images: Arc<InMemoryImageStore>,
        pub blobs: Arc<InMemoryBlobStore>,
        pub deps: JobDependencies,
    }

    /// In-memory collaborators. `flip-image` reverses its input, `export-pdf`
    /// prefixes `%PDF`, the other scripts echo.
    pub(crate) fn fixture(generator: Option<Arc<dyn ImageGenerator>>) -> Fixture {
        let images = InMemoryImageStore::arc();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let workers = WorkerPool::builder()
            .slots(2)
            .script("flip-image", BlockingExecutor::new(|req: WorkerRequest| {
                let mut bytes = req.input;
                bytes.reverse();
                WorkerReply::Ok(bytes)
            }))
            .script("remove-background", BlockingExecutor::new(|req: WorkerRequest| WorkerReply::Ok(req.input)))
            .script("export-pdf", BlockingExecutor::new(|req: WorkerRequest| {
                let mut out = b"%PDF".to_vec();
                out.extend(req.input);
                WorkerReply::Ok(out)
            }))
            .script("export-png", BlockingExecutor::new(|req: WorkerRequest| WorkerReply::Ok(req.input)))
            .build();
        let deps = JobDependencies {
            images: images.clone(),
            blobs: blobs.clone(),
            workers: Arc::new(workers),
            snapshots: Arc::new(BlobRoomSnapshots::new(blobs.clone())),
            generator,
        };
        Fixture { images, blobs, deps }
    }

    impl Fixture {
        /// A `ready` image with bytes in blob storage.
        pub(crate) async fn seed_image(&self, room: &str, id: &str, bytes: &[u8]) {
            let room_id = RoomId::from(room);
            let image_id = ImageId::from(id);
            let key = image_blob_key(&room_id, &image_id);
            self.blobs.put(&key, bytes.to_vec()).await.unwrap();
            self.images
                .insert(ImageRecord::ready(image_id, room_id, "user1".into(), key))
                .await
                .unwrap();
        }
    }

    pub(crate) fn ctx(kind: atelier_core::JobKind) -> crate::jobs::JobContext {
        crate::jobs::JobContext {
            job_id: atelier_core::JobId::new(),
            kind,
            owner: JobOwner::new("room1", "user1"),
        }
    }
}

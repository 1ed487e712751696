//! Adapters for the systems jobs act upon.
//!
//! None of these are owned by the job core: image rows and blobs belong to
//! the application, the generation API is a remote service and room documents
//! come from the collaborative editing engine. Each boundary is a trait with
//! an in-memory implementation for tests/dev; image rows also have a
//! Postgres one for multi-process deployments.

pub mod blobs;
pub mod documents;
pub mod generation;
pub mod images;
pub mod postgres_images;

use thiserror::Error;

use crate::error::JobError;

pub use blobs::{BlobStore, FsBlobStore, InMemoryBlobStore};
pub use documents::{BlobRoomSnapshots, RoomSnapshots};
pub use generation::{HttpImageGenerator, ImageGenerator, ImageSize};
pub use images::{ImageRecord, ImageStatus, ImageStore, InMemoryImageStore, RemovalStatus};
pub use postgres_images::PostgresImageStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{0} not found")]
    NotFound(String),

    /// A row with the same id already exists.
    #[error("{0} already exists")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(String),

    /// A remote service answered with an error or could not be reached.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<CollaboratorError> for JobError {
    fn from(value: CollaboratorError) -> Self {
        match value {
            CollaboratorError::NotFound(what) => JobError::ResourceNotFound(what),
            CollaboratorError::Conflict(what) => JobError::validation(format!("{what} already exists")),
            other => JobError::Collaborator(other.to_string()),
        }
    }
}

//! `atelier-core`: domain primitives for background job orchestration.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, job kinds and the task lifecycle state machine.

pub mod error;
pub mod id;
pub mod job_kind;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{ExportId, ImageId, JobId, RoomId, UserId};
pub use job_kind::{JobKind, ParseJobKindError};
pub use task::{Task, TaskError, TaskStatus, TaskUpdate};

//! Job orchestration infrastructure: queues, handlers, workers, collaborators.

pub mod collaborators;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event_bus;
pub mod jobs;
pub mod manager;
pub mod queue;
pub mod task_store;
pub mod worker_pool;

pub use error::JobError;

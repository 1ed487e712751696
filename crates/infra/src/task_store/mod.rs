//! Durable task records.
//!
//! The task store is the source of truth for job lifecycle state. Handlers
//! write through it at every transition; the API layer reads it to answer
//! "what happened to my job".

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use r#trait::{TaskStore, TaskStoreError};

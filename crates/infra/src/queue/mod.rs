//! Durable queue backends.
//!
//! One queue exists per job kind. The job core talks to queues only through
//! [`QueueBackend`]; which connection is "the" connection at any moment is
//! decided by the [`QueueClientManager`](crate::manager::QueueClientManager).

pub mod backend;
pub mod in_memory;
pub mod postgres;

pub use backend::{
    QueueBackend, QueueConnector, QueueError, QueuePolicy, QueueRecord, QueueRecordState,
};
pub use in_memory::{InMemoryQueue, InMemoryQueueConnector, SharedQueues};
pub use postgres::{PostgresQueue, PostgresQueueConnector};

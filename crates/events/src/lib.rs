//! Real-time job notifications.
//!
//! Job handlers publish lifecycle changes to a room-scoped pub/sub bus so that
//! connected clients can react. Delivery is best-effort; the task store is the
//! source of truth.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{NotificationBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryNotificationBus};
pub use notification::JobNotification;

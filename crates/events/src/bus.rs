//! Room-scoped publish/subscribe abstraction (mechanics only).
//!
//! Messages are broadcast to every subscriber of one room. The bus makes
//! minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, ...
//! - **Best-effort**: a failed broadcast is not retried; callers log it
//! - **No persistence**: late subscribers do not see earlier messages
//!
//! Observers that need the authoritative state read the task store.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use atelier_core::RoomId;

/// A subscription to one room's message stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe(&room_id);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(msg) => forward_to_socket(msg)?,
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Bus closed
///     }
/// }
/// ```
///
/// Messages from one publisher arrive in publish order; there is no ordering
/// guarantee between concurrent publishers.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything already delivered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Room-keyed pub/sub bus.
///
/// `broadcast()` can fail (lock poisoning, network error). Failures surface to
/// the caller, which decides whether they matter; job handlers only log them.
pub trait NotificationBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Deliver `message` to every current subscriber of `room_id`.
    fn broadcast(&self, room_id: &RoomId, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self, room_id: &RoomId) -> Subscription<M>;
}

impl<M, B> NotificationBus<M> for Arc<B>
where
    B: NotificationBus<M> + ?Sized,
{
    type Error = B::Error;

    fn broadcast(&self, room_id: &RoomId, message: M) -> Result<(), Self::Error> {
        (**self).broadcast(room_id, message)
    }

    fn subscribe(&self, room_id: &RoomId) -> Subscription<M> {
        (**self).subscribe(room_id)
    }
}

//! In-memory notification bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use atelier_core::RoomId;
use thiserror::Error;

use crate::bus::{NotificationBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Broadcast failed due to internal lock poisoning.
    #[error("notification bus lock poisoned")]
    Poisoned,
}

/// In-memory room-keyed pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out per room
/// - Subscribers that hung up are dropped on the next broadcast to their room
#[derive(Debug)]
pub struct InMemoryNotificationBus<M> {
    rooms: Mutex<HashMap<RoomId, Vec<mpsc::Sender<M>>>>,
}

impl<M> InMemoryNotificationBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions for a room (as of the last broadcast).
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .lock()
            .map(|rooms| rooms.get(room_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl<M> Default for InMemoryNotificationBus<M> {
    fn default() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> NotificationBus<M> for InMemoryNotificationBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn broadcast(&self, room_id: &RoomId, message: M) -> Result<(), Self::Error> {
        let mut rooms = self.rooms.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        if let Some(subs) = rooms.get_mut(room_id) {
            subs.retain(|tx| tx.send(message.clone()).is_ok());
            if subs.is_empty() {
                rooms.remove(room_id);
            }
        }

        Ok(())
    }

    fn subscribe(&self, room_id: &RoomId) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut rooms) = self.rooms.lock() {
            rooms.entry(room_id.clone()).or_default().push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_only_the_target_room() {
        let bus = InMemoryNotificationBus::<u32>::new();
        let room1 = bus.subscribe(&RoomId::from("room1"));
        let room2 = bus.subscribe(&RoomId::from("room2"));

        bus.broadcast(&RoomId::from("room1"), 7).unwrap();

        assert_eq!(room1.try_recv().unwrap(), 7);
        assert!(room2.try_recv().is_err());
    }

    #[test]
    fn every_subscriber_of_a_room_gets_a_copy() {
        let bus = InMemoryNotificationBus::<&'static str>::new();
        let room = RoomId::from("room1");
        let a = bus.subscribe(&room);
        let b = bus.subscribe(&room);

        bus.broadcast(&room, "created").unwrap();
        bus.broadcast(&room, "active").unwrap();

        assert_eq!(a.drain(), vec!["created", "active"]);
        assert_eq!(b.drain(), vec!["created", "active"]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryNotificationBus::<u8>::new();
        let room = RoomId::from("room1");
        drop(bus.subscribe(&room));

        bus.broadcast(&room, 1).unwrap();
        assert_eq!(bus.subscriber_count(&room), 0);
    }

    #[test]
    fn broadcast_without_subscribers_is_ok() {
        let bus = InMemoryNotificationBus::<u8>::new();
        assert!(bus.broadcast(&RoomId::from("empty"), 1).is_ok());
    }
}

//! Redis pub/sub-backed notification bus (optional).
//!
//! Each room maps to one channel, `{prefix}:{room_id}`. Pub/sub is not
//! durable: subscribers that are offline miss messages, which matches the
//! best-effort contract of [`NotificationBus`].

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use atelier_core::RoomId;
use atelier_events::{NotificationBus, Subscription};

pub const DEFAULT_CHANNEL_PREFIX: &str = "atelier:rooms";

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for JSON-serializable messages.
#[derive(Debug, Clone)]
pub struct RedisNotificationBus {
    client: redis::Client,
    prefix: String,
}

impl RedisNotificationBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    pub fn channel(&self, room_id: &RoomId) -> String {
        format!("{}:{}", self.prefix, room_id)
    }
}

impl<M> NotificationBus<M> for RedisNotificationBus
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisBusError;

    fn broadcast(&self, room_id: &RoomId, message: M) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(self.channel(room_id), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        debug!(room_id = %room_id, receivers, "notification published");

        Ok(())
    }

    fn subscribe(&self, room_id: &RoomId) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel(room_id);

        // Blocking pub/sub reader; exits when the subscription is dropped.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "redis subscribe failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %e, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let message: M = match serde_json::from_str(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(channel = %channel, error = %e, "skipping undecodable message");
                        continue;
                    }
                };

                if tx.send(message).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

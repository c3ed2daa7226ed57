//! # Pub/Sub Broker
//!
//! Channel registry for the ephemeral instance. Each subscribed client
//! connection registers an outbound queue; `publish` fans a `message` push
//! frame out to every queue subscribed to the channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use mkv_common::RespValue;

/// Identifier of one subscribed client connection.
pub type SubscriberId = u64;

/// Routes published messages to subscribed connections.
#[derive(Debug, Default)]
pub struct Broker {
    next_id: AtomicU64,
    channels: RwLock<HashMap<Bytes, HashMap<SubscriberId, UnboundedSender<RespValue>>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id for a new client connection.
    pub fn register(&self) -> SubscriberId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds `id` to `channel`. Re-subscribing replaces the queue.
    pub fn subscribe(&self, channel: Bytes, id: SubscriberId, queue: UnboundedSender<RespValue>) {
        self.channels
            .write()
            .entry(channel)
            .or_default()
            .insert(id, queue);
    }

    /// Removes `id` from `channel`. Returns true if it was subscribed.
    pub fn unsubscribe(&self, channel: &[u8], id: SubscriberId) -> bool {
        let mut channels = self.channels.write();
        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Drops every subscription held by `id`, e.g. on disconnect.
    pub fn unsubscribe_all(&self, id: SubscriberId) {
        let mut channels = self.channels.write();
        channels.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
    }

    /// Delivers `payload` to every subscriber of `channel`.
    ///
    /// Returns the number of connections the message was queued for.
    pub fn publish(&self, channel: &[u8], payload: Bytes) -> usize {
        let channels = self.channels.read();
        let Some(subscribers) = channels.get(channel) else {
            return 0;
        };

        let frame = RespValue::array(vec![
            RespValue::bulk(Bytes::from_static(b"message")),
            RespValue::bulk(Bytes::copy_from_slice(channel)),
            RespValue::bulk(payload),
        ]);
        subscribers
            .values()
            .filter(|queue| queue.send(frame.clone()).is_ok())
            .count()
    }

    /// Number of connections subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

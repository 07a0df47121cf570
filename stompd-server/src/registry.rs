//! Concurrent connection and subscription registry.
//!
//! The single shared source of truth for connection identities, channel
//! memberships, and subscription-id mappings. Every method is safe to
//! call concurrently from any connection or worker thread; no internal
//! lock is ever held across a socket write.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stompd_protocol::Frame;

/// Unique, strictly increasing connection identifier.
pub type ConnectionId = u64;

/// A send-capable transport handle owned by one connection.
pub trait ConnectionHandle: Send + Sync {
    /// Writes one frame to the transport. Returns `false` when the
    /// transport is gone; never panics and never blocks on another
    /// connection's I/O.
    fn send(&self, frame: &Frame) -> bool;

    /// Asks the transport to shut down. Sends after this fail harmlessly.
    fn close(&self);
}

/// Registry of live connections and their channel subscriptions.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    /// Transport handle per connection.
    handles: DashMap<ConnectionId, Arc<dyn ConnectionHandle>>,
    /// Subscriber set per channel.
    channels: DashMap<String, HashSet<ConnectionId>>,
    /// Channels each connection belongs to (mirror of `channels`).
    memberships: DashMap<ConnectionId, HashSet<String>>,
    /// Client-chosen subscription id per (connection, channel).
    subscription_ids: DashMap<ConnectionId, HashMap<String, u64>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            handles: DashMap::new(),
            channels: DashMap::new(),
            memberships: DashMap::new(),
            subscription_ids: DashMap::new(),
        }
    }

    /// Allocates a new connection id and initializes its empty channel
    /// set and subscription map. Ids are unique and strictly increasing
    /// across any interleaving of concurrent callers.
    pub fn register(&self) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.memberships.insert(id, HashSet::new());
        self.subscription_ids.insert(id, HashMap::new());
        id
    }

    /// Associates (or replaces) the transport handle for a connection.
    pub fn set_handle(&self, id: ConnectionId, handle: Arc<dyn ConnectionHandle>) {
        self.handles.insert(id, handle);
    }

    /// Sends one frame to one connection. Returns `false` when no live
    /// handle is registered; never raises.
    pub fn send(&self, id: ConnectionId, frame: &Frame) -> bool {
        // Clone the handle out so the map shard lock is released before
        // the transport write.
        let handle = self.handles.get(&id).map(|entry| Arc::clone(entry.value()));
        match handle {
            Some(handle) => handle.send(frame),
            None => false,
        }
    }

    /// Sends one frame to every current subscriber of a channel. A
    /// channel with no subscribers is a silent no-op.
    pub fn broadcast(&self, channel: &str, frame: &Frame) {
        for id in self.subscribers(channel) {
            self.send(id, frame);
        }
    }

    /// Adds a subscription, overwriting a prior subscription id for the
    /// same (connection, channel) pair. Idempotent.
    pub fn subscribe(&self, id: ConnectionId, channel: &str, subscription_id: u64) {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        if let Some(mut membership) = self.memberships.get_mut(&id) {
            membership.insert(channel.to_string());
        }
        if let Some(mut subs) = self.subscription_ids.get_mut(&id) {
            subs.insert(channel.to_string(), subscription_id);
        }
    }

    /// Removes a subscription. No-op if not currently subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, channel: &str) {
        let was_member = match self.memberships.get_mut(&id) {
            Some(mut membership) => membership.remove(channel),
            None => false,
        };
        if was_member {
            if let Some(mut subscribers) = self.channels.get_mut(channel) {
                subscribers.remove(&id);
            }
        }
        if let Some(mut subs) = self.subscription_ids.get_mut(&id) {
            subs.remove(channel);
        }
    }

    /// Full teardown of a connection: removes it from every channel it
    /// belonged to, discards its subscription map and channel set, and
    /// removes its transport handle. Idempotent.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some((_, channels)) = self.memberships.remove(&id) {
            for channel in channels {
                if let Some(mut subscribers) = self.channels.get_mut(&channel) {
                    subscribers.remove(&id);
                }
            }
        }
        self.subscription_ids.remove(&id);
        self.handles.remove(&id);
    }

    /// Snapshot of the current subscriber set of a channel.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The subscription id a connection chose for a channel, or the `0`
    /// sentinel when absent.
    pub fn subscription_id(&self, id: ConnectionId, channel: &str) -> u64 {
        self.subscription_ids
            .get(&id)
            .and_then(|subs| subs.get(channel).copied())
            .unwrap_or(0)
    }

    /// Whether a connection is currently subscribed to a channel.
    pub fn is_subscribed(&self, id: ConnectionId, channel: &str) -> bool {
        self.memberships
            .get(&id)
            .map(|membership| membership.contains(channel))
            .unwrap_or(false)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingHandle;
    use super::*;

    #[test]
    fn test_register_ids_strictly_increasing() {
        let registry = ConnectionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        let c = registry.register();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_register_ids_unique_under_concurrency() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut threads = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            threads.push(std::thread::spawn(move || {
                (0..200).map(|_| registry.register()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<ConnectionId> = Vec::new();
        for thread in threads {
            let ids = thread.join().unwrap();
            // Each thread's ids are strictly increasing.
            assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
            all.extend(ids);
        }
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }

    #[test]
    fn test_subscribe_and_unsubscribe_membership() {
        let registry = ConnectionRegistry::new();
        let id = registry.register();

        registry.subscribe(id, "rooms", 5);
        assert!(registry.subscribers("rooms").contains(&id));
        assert!(registry.is_subscribed(id, "rooms"));
        assert_eq!(registry.subscription_id(id, "rooms"), 5);

        registry.unsubscribe(id, "rooms");
        assert!(!registry.subscribers("rooms").contains(&id));
        assert!(!registry.is_subscribed(id, "rooms"));
        assert_eq!(registry.subscription_id(id, "rooms"), 0);
    }

    #[test]
    fn test_resubscribe_overwrites_subscription_id() {
        let registry = ConnectionRegistry::new();
        let id = registry.register();

        registry.subscribe(id, "rooms", 5);
        registry.subscribe(id, "rooms", 9);
        assert_eq!(registry.subscription_id(id, "rooms"), 9);
        assert_eq!(registry.subscribers("rooms"), vec![id]);
    }

    #[test]
    fn test_disconnect_removes_from_every_channel() {
        let registry = ConnectionRegistry::new();
        let id = registry.register();
        let other = registry.register();

        registry.subscribe(id, "rooms", 1);
        registry.subscribe(id, "news", 2);
        registry.subscribe(other, "rooms", 3);

        registry.disconnect(id);
        assert!(!registry.subscribers("rooms").contains(&id));
        assert!(registry.subscribers("news").is_empty());
        assert!(registry.subscribers("rooms").contains(&other));
        assert_eq!(registry.subscription_id(id, "rooms"), 0);

        // Idempotent.
        registry.disconnect(id);
    }

    #[test]
    fn test_send_without_handle_is_not_delivered() {
        let registry = ConnectionRegistry::new();
        let id = registry.register();
        assert!(!registry.send(id, &Frame::connected()));
    }

    #[test]
    fn test_send_after_disconnect_is_not_delivered() {
        let registry = ConnectionRegistry::new();
        let id = registry.register();
        registry.set_handle(id, RecordingHandle::new());
        assert!(registry.send(id, &Frame::connected()));

        registry.disconnect(id);
        assert!(!registry.send(id, &Frame::connected()));
    }

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let registry = ConnectionRegistry::new();
        let a = registry.register();
        let b = registry.register();
        let c = registry.register();
        let handle_a = RecordingHandle::new();
        let handle_b = RecordingHandle::new();
        let handle_c = RecordingHandle::new();
        registry.set_handle(a, handle_a.clone());
        registry.set_handle(b, handle_b.clone());
        registry.set_handle(c, handle_c.clone());

        registry.subscribe(a, "rooms", 1);
        registry.subscribe(b, "rooms", 2);

        registry.broadcast("rooms", &Frame::receipt("x"));
        assert_eq!(handle_a.frames.lock().len(), 1);
        assert_eq!(handle_b.frames.lock().len(), 1);
        assert!(handle_c.frames.lock().is_empty());

        // Empty channel broadcast is a silent no-op.
        registry.broadcast("empty", &Frame::receipt("y"));
    }
}

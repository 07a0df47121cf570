//! Per-connection session state.

use crate::registry::ConnectionId;
use std::collections::{HashMap, HashSet};

/// State owned by one client connection: its identity, authenticated
/// username, subscription-id bookkeeping, and terminal flag.
///
/// A session is driven by exactly one engine invocation at a time (the
/// blocking handler's thread, or the reactor's chained worker task), so
/// it needs no internal synchronization.
pub struct Session {
    id: ConnectionId,
    username: Option<String>,
    terminated: bool,
    /// subscription id -> channel, for UNSUBSCRIBE lookups.
    channel_by_sub: HashMap<u64, String>,
    /// channel -> subscription id; re-subscribing overwrites.
    sub_by_channel: HashMap<String, u64>,
    /// (filename, channel) pairs already reported to the audit sink.
    uploads: HashSet<String>,
}

impl Session {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            username: None,
            terminated: false,
            channel_by_sub: HashMap::new(),
            sub_by_channel: HashMap::new(),
            uploads: HashSet::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Sets the authenticated username, returning the previous one.
    pub fn replace_username(&mut self, username: String) -> Option<String> {
        self.username.replace(username)
    }

    /// Clears and returns the authenticated username.
    pub fn take_username(&mut self) -> Option<String> {
        self.username.take()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Marks the session terminal. There is no way back.
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    /// Records a subscription, keeping at most one subscription id per
    /// channel (re-subscribing drops the prior id's mapping).
    pub fn record_subscription(&mut self, subscription_id: u64, channel: String) {
        if let Some(previous) = self.sub_by_channel.insert(channel.clone(), subscription_id) {
            self.channel_by_sub.remove(&previous);
        }
        self.channel_by_sub.insert(subscription_id, channel);
    }

    /// Removes the subscription mapped to `subscription_id`, returning
    /// its channel if one was recorded.
    pub fn remove_subscription(&mut self, subscription_id: u64) -> Option<String> {
        let channel = self.channel_by_sub.remove(&subscription_id)?;
        self.sub_by_channel.remove(&channel);
        Some(channel)
    }

    /// Marks a (filename, channel) upload as seen. Returns `true` the
    /// first time a pair is recorded on this session.
    pub fn record_upload(&mut self, filename: &str, channel: &str) -> bool {
        self.uploads.insert(format!("{filename}:{channel}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_clean() {
        let session = Session::new(7);
        assert_eq!(session.id(), 7);
        assert_eq!(session.username(), None);
        assert!(!session.is_terminated());
    }

    #[test]
    fn test_username_lifecycle() {
        let mut session = Session::new(0);
        assert_eq!(session.replace_username("alice".into()), None);
        assert_eq!(session.username(), Some("alice"));
        assert_eq!(session.take_username(), Some("alice".to_string()));
        assert_eq!(session.username(), None);
    }

    #[test]
    fn test_subscription_bookkeeping() {
        let mut session = Session::new(0);
        session.record_subscription(5, "rooms".into());
        assert_eq!(session.remove_subscription(5), Some("rooms".to_string()));
        assert_eq!(session.remove_subscription(5), None);
    }

    #[test]
    fn test_resubscribe_drops_prior_id() {
        let mut session = Session::new(0);
        session.record_subscription(5, "rooms".into());
        session.record_subscription(9, "rooms".into());
        // The old id no longer resolves; the new one does.
        assert_eq!(session.remove_subscription(5), None);
        assert_eq!(session.remove_subscription(9), Some("rooms".to_string()));
    }

    #[test]
    fn test_upload_recorded_once_per_pair() {
        let mut session = Session::new(0);
        assert!(session.record_upload("events.txt", "rooms"));
        assert!(!session.record_upload("events.txt", "rooms"));
        assert!(session.record_upload("events.txt", "news"));
        assert!(session.record_upload("other.txt", "rooms"));
    }
}

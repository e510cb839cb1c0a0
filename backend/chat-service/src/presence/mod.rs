use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::websocket::message_types::ServerEvent;

/// Opaque identity of one accepted transport connection. A reconnect gets a
/// fresh handle, so a stale disconnect event can never evict the connection
/// that superseded it.
pub type ConnectionHandle = Uuid;

/// Live-connection record for one user. The sender is the exclusive path to
/// that user's socket task.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub handle: ConnectionHandle,
    pub sender: UnboundedSender<ServerEvent>,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// userId -> current live connection. At most one entry per user; a second
/// registration replaces the first (supersession). This registry only does
/// bookkeeping — delivery and queueing live in the ConnectionManager.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<DashMap<Uuid, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, user_id: Uuid) -> Option<PresenceEntry> {
        self.inner.get(&user_id).map(|e| e.clone())
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.contains_key(&user_id)
    }

    /// Atomically replaces any prior entry, returning it so the caller can
    /// deliver the superseded notice.
    pub fn upsert(&self, entry: PresenceEntry) -> Option<PresenceEntry> {
        self.inner.insert(entry.user_id, entry)
    }

    /// Removes the entry only when `handle` still matches the registered one.
    pub fn remove_if_handle(&self, user_id: Uuid, handle: ConnectionHandle) -> bool {
        self.inner
            .remove_if(&user_id, |_, entry| entry.handle == handle)
            .is_some()
    }

    /// Heartbeat: refresh `last_seen_at`, but only while `handle` is still
    /// the registered connection. A superseded socket that has not torn down
    /// yet must not keep its replacement's entry looking fresh.
    pub fn touch_if_handle(&self, user_id: Uuid, handle: ConnectionHandle) -> bool {
        match self.inner.get_mut(&user_id) {
            Some(mut entry) if entry.handle == handle => {
                entry.last_seen_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Connections whose last heartbeat is older than `idle_after`.
    pub fn idle_connections(&self, idle_after: Duration) -> Vec<(Uuid, ConnectionHandle)> {
        let cutoff = Utc::now() - idle_after;
        self.inner
            .iter()
            .filter(|e| e.last_seen_at < cutoff)
            .map(|e| (e.user_id, e.handle))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn entry(user_id: Uuid) -> (PresenceEntry, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = unbounded_channel();
        let now = Utc::now();
        (
            PresenceEntry {
                user_id,
                handle: Uuid::new_v4(),
                sender: tx,
                connected_at: now,
                last_seen_at: now,
            },
            rx,
        )
    }

    #[test]
    fn upsert_returns_superseded_entry() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (first, _rx1) = entry(user);
        let first_handle = first.handle;
        assert!(registry.upsert(first).is_none());

        let (second, _rx2) = entry(user);
        let prior = registry.upsert(second).expect("prior entry");
        assert_eq!(prior.handle, first_handle);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_handle_cannot_remove_newer_connection() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (first, _rx1) = entry(user);
        let stale = first.handle;
        registry.upsert(first);
        let (second, _rx2) = entry(user);
        let current = second.handle;
        registry.upsert(second);

        assert!(!registry.remove_if_handle(user, stale));
        assert!(registry.is_online(user));
        assert!(registry.remove_if_handle(user, current));
        assert!(!registry.is_online(user));
    }

    #[test]
    fn touch_requires_the_current_handle() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (first, _rx1) = entry(user);
        let stale = first.handle;
        registry.upsert(first);
        let (second, _rx2) = entry(user);
        let current = second.handle;
        registry.upsert(second);

        assert!(!registry.touch_if_handle(user, stale));
        assert!(registry.touch_if_handle(user, current));
    }
}

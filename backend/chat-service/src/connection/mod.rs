use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics;
use crate::presence::{ConnectionHandle, PresenceEntry, PresenceRegistry};
use crate::state::AppState;
use crate::websocket::message_types::ServerEvent;

/// Outcome of one best-effort push. Durability of the message itself lives in
/// the ConversationStore; none of these outcomes is an error for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Queued,
    Dropped,
}

/// A freshly accepted connection: the handle identifying it, the outbound
/// event stream for its socket task, and whether it replaced a prior one.
pub struct Registration {
    pub handle: ConnectionHandle,
    pub receiver: UnboundedReceiver<ServerEvent>,
    pub superseded_prior: bool,
}

/// Owns the lifecycle of live connections: registration with supersession,
/// best-effort delivery with per-user bounded offline queues, heartbeats, and
/// handle-matched unregistration.
pub struct ConnectionManager {
    registry: PresenceRegistry,
    queues: DashMap<Uuid, VecDeque<ServerEvent>>,
    queue_capacity: usize,
}

impl ConnectionManager {
    pub fn new(registry: PresenceRegistry, queue_capacity: usize) -> Self {
        Self {
            registry,
            queues: DashMap::new(),
            queue_capacity,
        }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.registry.is_online(user_id)
    }

    /// Registers a live connection for `user_id`. An existing connection is
    /// forcibly superseded: it gets a best-effort `connection:superseded`
    /// notice and its handle never delivers again.
    pub fn register(&self, user_id: Uuid) -> Registration {
        let (tx, rx) = unbounded_channel();
        let handle = Uuid::new_v4();
        let now = Utc::now();
        let prior = self.registry.upsert(PresenceEntry {
            user_id,
            handle,
            sender: tx,
            connected_at: now,
            last_seen_at: now,
        });

        let superseded_prior = prior.is_some();
        if let Some(prev) = prior {
            metrics::SUPERSESSIONS_TOTAL.inc();
            tracing::info!(%user_id, old_handle=%prev.handle, new_handle=%handle, "connection superseded");
            let _ = prev.sender.send(ServerEvent::ConnectionSuperseded);
        }
        metrics::LIVE_CONNECTIONS.set(self.registry.len() as i64);

        Registration {
            handle,
            receiver: rx,
            superseded_prior,
        }
    }

    /// Delivers to the user's live connection, or parks the event in their
    /// bounded offline queue (oldest evicted first when full).
    pub fn send(&self, user_id: Uuid, event: ServerEvent) -> SendOutcome {
        if let Some(entry) = self.registry.lookup(user_id) {
            // A closed sender means the socket task is gone but the sweep has
            // not caught up yet; fall through to the queue.
            if entry.sender.send(event.clone()).is_ok() {
                metrics::DELIVERY_LIVE_TOTAL.inc();
                return SendOutcome::Delivered;
            }
        }

        if self.queue_capacity == 0 {
            metrics::DELIVERY_DROPPED_TOTAL.inc();
            return SendOutcome::Dropped;
        }

        let mut queue = self.queues.entry(user_id).or_default();
        if queue.len() >= self.queue_capacity {
            queue.pop_front();
            metrics::QUEUE_EVICTIONS_TOTAL.inc();
            tracing::debug!(%user_id, "offline queue full, evicted oldest push");
        }
        queue.push_back(event);
        metrics::DELIVERY_QUEUED_TOTAL.inc();
        SendOutcome::Queued
    }

    /// Takes everything parked for `user_id`. Reconciliation drains this
    /// before a reconnecting client is declared caught-up.
    pub fn drain_queued(&self, user_id: Uuid) -> Vec<ServerEvent> {
        self.queues
            .remove(&user_id)
            .map(|(_, queue)| queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Handle-matched, like `unregister`: a superseded socket's heartbeats
    /// must not refresh the connection that replaced it.
    pub fn heartbeat(&self, user_id: Uuid, handle: ConnectionHandle) {
        self.registry.touch_if_handle(user_id, handle);
    }

    /// Removes the registration only when `handle` is still current, so a
    /// stale disconnect never evicts a newer connection.
    pub fn unregister(&self, user_id: Uuid, handle: ConnectionHandle) -> bool {
        let removed = self.registry.remove_if_handle(user_id, handle);
        if removed {
            metrics::LIVE_CONNECTIONS.set(self.registry.len() as i64);
        }
        removed
    }

    /// Evicts connections that have not heartbeat within `timeout`. Returns
    /// the affected users so the caller can fan out offline presence.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<Uuid> {
        let idle_after = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut swept = Vec::new();
        for (user_id, handle) in self.registry.idle_connections(idle_after) {
            if self.registry.remove_if_handle(user_id, handle) {
                swept.push(user_id);
            }
        }
        if !swept.is_empty() {
            metrics::LIVE_CONNECTIONS.set(self.registry.len() as i64);
        }
        swept
    }
}

/// Background liveness task: periodically evicts connections whose heartbeat
/// lapsed and pushes offline presence to their conversation peers.
pub fn spawn_liveness_sweeper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(state.config.heartbeat_interval_secs);
        let timeout = Duration::from_secs(state.config.heartbeat_timeout_secs);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            for user_id in state.connections.sweep_idle(timeout) {
                tracing::info!(%user_id, "connection timed out, marking offline");
                state.engine.broadcast_presence(user_id, false).await;
            }
        }
    })
}

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{ConnectionManager, SendOutcome};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::Message;
use crate::store::{ConversationStore, UnreadUpdate};
use crate::websocket::message_types::ServerEvent;

/// Where a send is aimed: an existing conversation, or a peer user (the
/// conversation is then resolved by participant pair, created on first
/// contact).
#[derive(Debug, Clone, Copy)]
pub enum SendTarget {
    Conversation(Uuid),
    Recipient(Uuid),
}

/// The core state machine: validates send intents, serializes order-key and
/// unread-count mutation per conversation, persists through the store, and
/// fans out best-effort pushes through the ConnectionManager.
pub struct ConversationEngine {
    store: Arc<dyn ConversationStore>,
    connections: Arc<ConnectionManager>,
    /// Per-conversation critical sections. Conversations never contend with
    /// each other; two sends in one conversation never interleave their
    /// read-modify-write.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// (conversation, dedup_key) -> originally persisted message, so a
    /// retried send is answered instead of appended twice.
    dedup: DashMap<(Uuid, String), Message>,
    max_message_length: usize,
    dedup_capacity: usize,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        connections: Arc<ConnectionManager>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            connections,
            locks: DashMap::new(),
            dedup: DashMap::new(),
            max_message_length: config.max_message_length,
            dedup_capacity: config.dedup_memo_capacity,
        }
    }

    fn conversation_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn remember_dedup(&self, conversation_id: Uuid, key: &str, message: &Message) {
        // Coarse bound: the memo only has to survive the client retry window.
        if self.dedup.len() >= self.dedup_capacity {
            self.dedup.clear();
        }
        self.dedup
            .insert((conversation_id, key.to_string()), message.clone());
    }

    /// Validates, persists with a server-assigned order key, updates unread
    /// counters, and pushes `message:new` to the recipient best-effort.
    ///
    /// The returned message is the definitive answer for the sender; whether
    /// the recipient was online never affects it. Storage failures surface
    /// as-is and are not retried here.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        target: SendTarget,
        content: &str,
        dedup_key: Option<&str>,
    ) -> AppResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("message content cannot be empty".into()));
        }
        if content.chars().count() > self.max_message_length {
            return Err(AppError::Validation(format!(
                "message content exceeds {} characters",
                self.max_message_length
            )));
        }

        let conversation = match target {
            SendTarget::Conversation(id) => self.store.get_conversation(id).await?,
            SendTarget::Recipient(peer_id) => {
                if peer_id == sender_id {
                    return Err(AppError::Validation(
                        "cannot start a conversation with yourself".into(),
                    ));
                }
                self.store
                    .create_or_get_conversation(sender_id, peer_id)
                    .await?
            }
        };
        if !conversation.is_participant(sender_id) {
            return Err(AppError::Forbidden);
        }
        let peer_id = conversation.peer_of(sender_id).ok_or(AppError::Forbidden)?;

        let lock = self.conversation_lock(conversation.id);
        let message = {
            let _guard = lock.lock().await;

            if let Some(key) = dedup_key {
                if let Some(existing) = self.dedup.get(&(conversation.id, key.to_string())) {
                    tracing::debug!(conversation_id=%conversation.id, dedup_key=%key, "duplicate send answered from memo");
                    return Ok(existing.clone());
                }
            }

            let message = self
                .store
                .append_message(conversation.id, sender_id, content)
                .await?;
            self.store
                .update_unread(conversation.id, peer_id, UnreadUpdate::Increment)
                .await?;
            self.store
                .update_unread(conversation.id, sender_id, UnreadUpdate::Reset)
                .await?;

            if let Some(key) = dedup_key {
                self.remember_dedup(conversation.id, key, &message);
            }
            message
        };
        metrics::MESSAGES_SENT_TOTAL.inc();

        let outcome = self.connections.send(
            peer_id,
            ServerEvent::MessageNew {
                message: message.clone(),
            },
        );
        if outcome != SendOutcome::Delivered {
            tracing::debug!(
                conversation_id=%message.conversation_id,
                recipient_id=%peer_id,
                ?outcome,
                "live push not delivered"
            );
        }

        Ok(message)
    }

    /// Resets the caller's unread counter and flags the peer's messages as
    /// read. Idempotent. The peer gets a best-effort read receipt when online.
    pub async fn mark_read(&self, user_id: Uuid, conversation_id: Uuid) -> AppResult<()> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(AppError::Forbidden);
        }

        let lock = self.conversation_lock(conversation_id);
        {
            let _guard = lock.lock().await;
            self.store
                .mark_read_up_to(conversation_id, user_id, Utc::now())
                .await?;
            self.store
                .update_unread(conversation_id, user_id, UnreadUpdate::Reset)
                .await?;
        }

        if let Some(peer_id) = conversation.peer_of(user_id) {
            if self.connections.is_online(peer_id) {
                self.connections.send(
                    peer_id,
                    ServerEvent::ConversationRead {
                        conversation_id,
                        user_id,
                    },
                );
            }
        }
        Ok(())
    }

    /// Newest-first page of messages; `before` is an exclusive order-key
    /// cursor, so concurrent inserts never shift a page boundary.
    pub async fn list_recent(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        self.store
            .fetch_messages(conversation_id, before, limit.clamp(1, 200))
            .await
    }

    /// Pushes a presence transition to the online peers of the user's
    /// conversations. Best-effort: offline peers are skipped, not queued.
    pub async fn broadcast_presence(&self, user_id: Uuid, online: bool) {
        let conversations = match self.store.conversations_for(user_id).await {
            Ok(conversations) => conversations,
            Err(e) => {
                tracing::warn!(%user_id, error=%e, "presence fan-out skipped");
                return;
            }
        };
        for conversation in conversations {
            let Some(peer_id) = conversation.peer_of(user_id) else {
                continue;
            };
            if self.connections.is_online(peer_id) {
                self.connections
                    .send(peer_id, ServerEvent::PresenceUpdate { user_id, online });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceRegistry;
    use crate::store::MemoryStore;

    fn engine() -> (ConversationEngine, Arc<ConnectionManager>) {
        let config = Config::test_defaults();
        let connections = Arc::new(ConnectionManager::new(PresenceRegistry::new(), 8));
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        (
            ConversationEngine::new(store, connections.clone(), &config),
            connections,
        )
    }

    #[tokio::test]
    async fn empty_content_is_rejected_without_side_effects() {
        let (engine, _) = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let err = engine
            .send_message(a, SendTarget::Recipient(b), "   ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn send_updates_unread_and_last_message() {
        let (engine, _) = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let message = engine
            .send_message(a, SendTarget::Recipient(b), "hi", None)
            .await
            .unwrap();
        assert_eq!(message.sequence, 1);

        let conversation = engine
            .store
            .get_conversation(message.conversation_id)
            .await
            .unwrap();
        assert_eq!(conversation.unread_for(b), 1);
        assert_eq!(conversation.unread_for(a), 0);
        assert_eq!(conversation.last_message.unwrap().id, message.id);
    }

    #[tokio::test]
    async fn non_participant_sender_is_rejected() {
        let (engine, _) = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let outsider = Uuid::new_v4();

        let message = engine
            .send_message(a, SendTarget::Recipient(b), "hi", None)
            .await
            .unwrap();

        let err = engine
            .send_message(
                outsider,
                SendTarget::Conversation(message.conversation_id),
                "intrusion",
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let (engine, _) = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let message = engine
            .send_message(a, SendTarget::Recipient(b), "hi", None)
            .await
            .unwrap();
        let conversation_id = message.conversation_id;

        engine.mark_read(b, conversation_id).await.unwrap();
        engine.mark_read(b, conversation_id).await.unwrap();

        let conversation = engine.store.get_conversation(conversation_id).await.unwrap();
        assert_eq!(conversation.unread_for(b), 0);
        let history = engine.list_recent(conversation_id, None, 10).await.unwrap();
        assert!(history.iter().all(|m| m.is_read));
    }

    #[tokio::test]
    async fn dedup_key_answers_retries_with_the_original_message() {
        let (engine, _) = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = engine
            .send_message(a, SendTarget::Recipient(b), "once", Some("retry-1"))
            .await
            .unwrap();
        let second = engine
            .send_message(a, SendTarget::Recipient(b), "once", Some("retry-1"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let history = engine
            .list_recent(first.conversation_id, None, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn live_recipient_gets_message_new_push() {
        let (engine, connections) = engine();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut registration = connections.register(b);

        let sent = engine
            .send_message(a, SendTarget::Recipient(b), "hello", None)
            .await
            .unwrap();

        match registration.receiver.recv().await {
            Some(ServerEvent::MessageNew { message }) => assert_eq!(message.id, sent.id),
            other => panic!("expected message:new push, got {other:?}"),
        }
    }
}

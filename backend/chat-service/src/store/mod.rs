use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Conversation, Message};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadUpdate {
    Increment,
    Reset,
}

/// Durable system of record for conversations and messages. The engine holds
/// the per-conversation critical section; implementations only have to make
/// `append_message` assign order keys atomically.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Resolves the conversation for a participant pair, creating it on first
    /// contact. The pair is unordered: both argument orders resolve to the
    /// same conversation.
    async fn create_or_get_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation>;

    async fn get_conversation(&self, id: Uuid) -> AppResult<Conversation>;

    /// Conversations the user participates in, most recently updated first.
    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>>;

    /// Persists a message with the next order key and bumps the
    /// conversation's `last_message` / `updated_at`.
    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> AppResult<Message>;

    async fn update_unread(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        update: UnreadUpdate,
    ) -> AppResult<()>;

    /// Newest-first page; `before` is an exclusive order-key cursor so
    /// concurrent inserts never shift a page boundary.
    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    /// Oldest-first run of messages with order key strictly greater than
    /// `after`. Used for watermark catch-up.
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    /// Marks messages addressed to `reader_id` (created at or before
    /// `up_to`) as read. Returns how many flipped; already-read messages do
    /// not count, which is what makes mark-read idempotent.
    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: DateTime<Utc>,
    ) -> AppResult<u64>;
}

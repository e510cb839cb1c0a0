use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Message};

use super::{ConversationStore, UnreadUpdate};

/// In-process store. Default when `DATABASE_URL` is unset and the backing
/// store for the test suite. Per-conversation message vectors are kept in
/// append order, which is also order-key order.
#[derive(Default)]
pub struct MemoryStore {
    conversations: DashMap<Uuid, Conversation>,
    messages: DashMap<Uuid, Vec<Message>>,
    pair_index: DashMap<(Uuid, Uuid), Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_or_get_conversation(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        let (pa, pb) = Conversation::normalize_pair(a, b);
        let id = *self.pair_index.entry((pa, pb)).or_insert_with(|| {
            let id = Uuid::new_v4();
            let now = Utc::now();
            self.conversations.insert(
                id,
                Conversation {
                    id,
                    participant_a: pa,
                    participant_b: pb,
                    created_at: now,
                    updated_at: now,
                    last_message: None,
                    unread_a: 0,
                    unread_b: 0,
                },
            );
            self.messages.insert(id, Vec::new());
            id
        });
        self.get_conversation(id).await
    }

    async fn get_conversation(&self, id: Uuid) -> AppResult<Conversation> {
        self.conversations
            .get(&id)
            .map(|c| c.clone())
            .ok_or(AppError::NotFound)
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Conversation>> {
        let mut out: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.is_participant(user_id))
            .map(|c| c.clone())
            .collect();
        out.sort_by(|x, y| y.updated_at.cmp(&x.updated_at));
        Ok(out)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> AppResult<Message> {
        let mut conv = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;

        let mut log = self.messages.entry(conversation_id).or_default();
        let sequence = log.last().map(|m| m.sequence).unwrap_or(0) + 1;
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: content.to_string(),
            sequence,
            created_at: Utc::now(),
            is_read: false,
        };
        log.push(message.clone());

        conv.last_message = Some(message.clone());
        conv.updated_at = message.created_at;
        Ok(message)
    }

    async fn update_unread(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        update: UnreadUpdate,
    ) -> AppResult<()> {
        let mut conv = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let slot = if user_id == conv.participant_a {
            &mut conv.unread_a
        } else if user_id == conv.participant_b {
            &mut conv.unread_b
        } else {
            return Err(AppError::Forbidden);
        };
        match update {
            UnreadUpdate::Increment => *slot += 1,
            UnreadUpdate::Reset => *slot = 0,
        }
        Ok(())
    }

    async fn fetch_messages(
        &self,
        conversation_id: Uuid,
        before: Option<i64>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let log = self
            .messages
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let out = log
            .iter()
            .rev()
            .filter(|m| before.map(|b| m.sequence < b).unwrap_or(true))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(out)
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        after: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let log = self
            .messages
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let out = log
            .iter()
            .filter(|m| m.sequence > after)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(out)
    }

    async fn mark_read_up_to(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: DateTime<Utc>,
    ) -> AppResult<u64> {
        let mut log = self
            .messages
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let mut flipped = 0;
        for m in log.iter_mut() {
            if m.sender_id != reader_id && !m.is_read && m.created_at <= up_to {
                m.is_read = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

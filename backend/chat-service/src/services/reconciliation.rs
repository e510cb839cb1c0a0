use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppResult;
use crate::metrics;
use crate::models::Message;
use crate::store::ConversationStore;

/// Catch-up for one conversation: everything past the client's watermark,
/// oldest first, capped at the configured batch limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationCatchUp {
    pub conversation_id: Uuid,
    pub unread_count: i64,
    pub messages: Vec<Message>,
    /// Set when the gap exceeded the batch cap; the client must fall back to
    /// a full paginated fetch instead of trusting this batch to be complete.
    pub truncated: bool,
    /// Highest order key included; the watermark the client should adopt.
    pub latest_sequence: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatchUpPayload {
    pub conversations: Vec<ConversationCatchUp>,
}

/// Computes the delta a reconnecting client missed. Applied before the
/// connection goes live so no live push overtakes the catch-up that precedes
/// it.
pub struct ReconciliationService {
    store: Arc<dyn ConversationStore>,
    batch_limit: i64,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn ConversationStore>, batch_limit: i64) -> Self {
        Self { store, batch_limit }
    }

    /// One entry per conversation the user participates in. A conversation
    /// missing from `watermarks` is treated as watermark 0, so the batch cap
    /// still bounds a first-time sync.
    pub async fn reconcile(
        &self,
        user_id: Uuid,
        watermarks: &HashMap<Uuid, i64>,
    ) -> AppResult<CatchUpPayload> {
        let conversations = self.store.conversations_for(user_id).await?;
        let mut out = Vec::with_capacity(conversations.len());

        for conversation in conversations {
            let after = watermarks.get(&conversation.id).copied().unwrap_or(0);
            // Fetch one past the cap to learn whether the gap overflows it.
            let mut messages = self
                .store
                .messages_after(conversation.id, after, self.batch_limit + 1)
                .await?;
            let truncated = messages.len() as i64 > self.batch_limit;
            if truncated {
                messages.truncate(self.batch_limit as usize);
                metrics::SYNC_TRUNCATED_TOTAL.inc();
                tracing::info!(
                    conversation_id=%conversation.id,
                    %user_id,
                    watermark=after,
                    "catch-up truncated at batch limit"
                );
            }
            let latest_sequence = messages.last().map(|m| m.sequence).unwrap_or(after);

            out.push(ConversationCatchUp {
                conversation_id: conversation.id,
                unread_count: conversation.unread_for(user_id),
                messages,
                truncated,
                latest_sequence,
            });
        }

        Ok(CatchUpPayload { conversations: out })
    }
}

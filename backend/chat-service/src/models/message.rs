use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    /// Server-assigned order key, strictly increasing within a conversation.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    /// Flipped only by the recipient's mark-read action (directly or through
    /// catch-up reconciliation), never by the sender.
    pub is_read: bool,
}

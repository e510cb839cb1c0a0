use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::Message;
use crate::services::CatchUpPayload;

/// Client -> server frames. Exactly one of `conversation_id` /
/// `recipient_id` must be set on `message:send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "message:send")]
    MessageSend {
        conversation_id: Option<Uuid>,
        recipient_id: Option<Uuid>,
        content: String,
        dedup_key: Option<String>,
    },
    #[serde(rename = "conversation:read")]
    ConversationRead { conversation_id: Uuid },
    #[serde(rename = "sync:request")]
    SyncRequest {
        #[serde(default)]
        watermarks: HashMap<Uuid, i64>,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// Server -> client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: Message },
    #[serde(rename = "message:ack")]
    MessageAck {
        message: Message,
        dedup_key: Option<String>,
    },
    #[serde(rename = "conversation:read")]
    ConversationRead {
        conversation_id: Uuid,
        user_id: Uuid,
    },
    #[serde(rename = "presence:update")]
    PresenceUpdate { user_id: Uuid, online: bool },
    #[serde(rename = "sync:response")]
    SyncResponse { payload: CatchUpPayload },
    #[serde(rename = "connection:superseded")]
    ConnectionSuperseded,
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ImageRef, LatestMessage, Message, PresenceStatus};

/// Events sent FROM the gateway TO clients over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Connection authenticated
    #[serde(rename = "ready")]
    Ready { user_id: Uuid, name: String },

    #[serde(rename = "conversation:joined")]
    ConversationJoined { conversation_id: Uuid },

    #[serde(rename = "conversation:left")]
    ConversationLeft { conversation_id: Uuid },

    /// A message was persisted. Also sent to the sender's own connections.
    #[serde(rename = "message:new", alias = "message:receive")]
    MessageNew {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<ImageRef>,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    #[serde(rename = "message:delivered")]
    MessageDelivered {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// The reader fetched history and the counterpart's messages flipped to seen.
    #[serde(rename = "message:read")]
    MessageRead {
        conversation_id: Uuid,
        reader_id: Uuid,
        seen_at: DateTime<Utc>,
    },

    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid, user_id: Uuid },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid, user_id: Uuid },

    #[serde(rename = "presence:update")]
    PresenceUpdate {
        user_id: Uuid,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },

    /// Nudge for connections that are not viewing the conversation.
    #[serde(rename = "conversation:updated")]
    ConversationUpdated {
        conversation_id: Uuid,
        latest_message: LatestMessage,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn message_new(message: &Message) -> Self {
        Self::MessageNew {
            conversation_id: message.conversation_id,
            message_id: message.id,
            sender_id: message.sender_id,
            text: message.content.text.clone(),
            image: message.content.image.clone(),
            timestamp: message.created_at,
            client_id: message.client_id.clone(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Commands sent FROM clients TO the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "conversation:join")]
    Join { conversation_id: Uuid },

    #[serde(rename = "conversation:leave")]
    Leave { conversation_id: Uuid },

    #[serde(rename = "message:send")]
    SendMessage {
        conversation_id: Uuid,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image: Option<ImageRef>,
        #[serde(default)]
        client_id: Option<String>,
    },

    #[serde(rename = "message:delivered")]
    Delivered {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid },

    /// Switch between online and away while connected.
    #[serde(rename = "presence:update")]
    SetPresence { status: PresenceStatus },
}

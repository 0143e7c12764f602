/// Database row types. These map directly to SQLite rows and are converted
/// into `parley-types` models at the edge of this crate.
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_types::models::{
    Conversation, ImageRef, LatestMessage, Message, MessageContent, MessageKind, PresenceStatus,
    User,
};

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub status: String,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub latest_text: Option<String>,
    pub latest_sender: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: String,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub image_storage_id: Option<String>,
    pub seen: bool,
    pub seen_at: Option<String>,
    pub created_at: String,
    /// Sender-chosen id echoed back so clients can match optimistic entries.
    pub client_id: Option<String>,
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp {raw:?}"))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("bad id {raw:?}"))
}

/// Canonical key for an unordered participant pair.
pub fn pair_key(a: Uuid, b: Uuid) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        let status = PresenceStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("bad presence status {:?}", self.status))?;
        Ok(User {
            id: parse_id(&self.id)?,
            name: self.name,
            email: self.email,
            avatar_url: self.avatar_url,
            bio: self.bio,
            status,
            last_seen: self.last_seen.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl ConversationRow {
    pub fn into_conversation(self) -> Result<Conversation> {
        let latest_message = match (self.latest_text, self.latest_sender) {
            (Some(text), Some(sender)) => Some(LatestMessage {
                text,
                sender_id: parse_id(&sender)?,
            }),
            _ => None,
        };
        Ok(Conversation {
            id: parse_id(&self.id)?,
            participants: [parse_id(&self.user_a)?, parse_id(&self.user_b)?],
            latest_message,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        let kind = match self.kind.as_str() {
            "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            other => return Err(anyhow!("bad message kind {other:?}")),
        };
        let image = match (self.image_url, self.image_storage_id) {
            (Some(url), storage_id) => Some(ImageRef {
                url,
                storage_id: storage_id.unwrap_or_default(),
            }),
            (None, _) => None,
        };
        Ok(Message {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            sender_id: parse_id(&self.sender_id)?,
            kind,
            content: MessageContent {
                text: self.text,
                image,
            },
            seen: self.seen,
            seen_at: self.seen_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            client_id: self.client_id,
        })
    }
}

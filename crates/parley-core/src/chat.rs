use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::{MessageRow, format_ts, pair_key};
use parley_types::api::ConversationSummary;
use parley_types::models::{Conversation, Message, MessageContent, UserProfile};

use crate::error::{ServiceError, ServiceResult, store_failure};
use crate::lookup::{IdentityLookup, LookupError, resolve_profile};
use crate::validation::MAX_MESSAGE_CHARS;
use crate::with_db;

/// Result of reading a conversation's history.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub counterpart: UserProfile,
    /// How many counterpart messages this read flipped to seen.
    pub newly_seen: usize,
    pub read_at: DateTime<Utc>,
}

/// Conversation lookup/creation, message persistence and seen-state.
pub struct ChatService {
    db: Arc<Database>,
    lookup: Arc<dyn IdentityLookup>,
}

impl ChatService {
    pub fn new(db: Arc<Database>, lookup: Arc<dyn IdentityLookup>) -> Self {
        Self { db, lookup }
    }

    /// Returns the single conversation for the unordered pair, creating it on
    /// first contact. The flag is true when this call created it.
    pub async fn create_or_get_conversation(
        &self,
        requester: Uuid,
        other: Uuid,
    ) -> ServiceResult<(Conversation, bool)> {
        if requester == other {
            return Err(ServiceError::validation(
                "cannot start a conversation with yourself",
            ));
        }
        match self.lookup.profile(other).await {
            Ok(_) => {}
            Err(LookupError::NotFound(_)) => return Err(ServiceError::NotFound("user")),
            Err(e) => warn!("Creating conversation without confirming counterpart: {}", e),
        }

        let id = Uuid::new_v4().to_string();
        let key = pair_key(requester, other);
        let now = format_ts(Utc::now());
        let (row, created) = with_db(&self.db, move |db| {
            db.create_or_get_conversation(&id, &requester.to_string(), &other.to_string(), &key, &now)
        })
        .await?;
        let conversation = row.into_conversation().map_err(store_failure)?;
        if created {
            debug!("Conversation {} created for {} and {}", conversation.id, requester, other);
        }
        Ok((conversation, created))
    }

    /// Persists a message and refreshes the conversation summary. The stored
    /// message is returned with `seen = false`. `client_id` is kept with the
    /// message so the sender can match it to an unconfirmed local copy.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: MessageContent,
        client_id: Option<String>,
    ) -> ServiceResult<Message> {
        let content = content.normalized();
        if content.is_empty() {
            return Err(ServiceError::validation(
                "message must contain text or an image",
            ));
        }
        if let Some(text) = &content.text {
            if text.chars().count() > MAX_MESSAGE_CHARS {
                return Err(ServiceError::validation(format!(
                    "message text must be at most {MAX_MESSAGE_CHARS} characters"
                )));
            }
        }

        self.authorize_participant(conversation_id, sender_id).await?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            kind: content.kind(),
            seen: false,
            seen_at: None,
            created_at: Utc::now(),
            content,
            client_id: client_id.filter(|id| !id.trim().is_empty()),
        };
        let row = MessageRow {
            id: message.id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            kind: message.kind.as_str().to_string(),
            text: message.content.text.clone(),
            image_url: message.content.image.as_ref().map(|i| i.url.clone()),
            image_storage_id: message.content.image.as_ref().map(|i| i.storage_id.clone()),
            seen: false,
            seen_at: None,
            created_at: format_ts(message.created_at),
            client_id: message.client_id.clone(),
        };
        let preview = message.content.preview();
        with_db(&self.db, move |db| db.insert_message(&row, &preview)).await?;

        Ok(message)
    }

    /// Marks the counterpart's unseen messages as seen, then returns the
    /// history in append order with the counterpart's profile.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
    ) -> ServiceResult<MessageHistory> {
        let conversation = self.authorize_participant(conversation_id, requester).await?;

        let read_at = Utc::now();
        let now = format_ts(read_at);
        let (rows, newly_seen) = with_db(&self.db, move |db| {
            db.mark_seen_and_list(&conversation_id.to_string(), &requester.to_string(), &now)
        })
        .await?;
        let messages = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(store_failure)?;

        let counterpart = match conversation.counterpart(requester) {
            Some(other) => resolve_profile(self.lookup.as_ref(), other).await,
            None => return Err(ServiceError::Unauthorized),
        };

        Ok(MessageHistory {
            conversation,
            messages,
            counterpart,
            newly_seen,
            read_at,
        })
    }

    /// Every conversation containing `user_id`, newest activity first.
    pub async fn list_conversations(&self, user_id: Uuid) -> ServiceResult<Vec<ConversationSummary>> {
        let rows = with_db(&self.db, move |db| {
            db.list_conversations_for_user(&user_id.to_string())
        })
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for (row, unseen) in rows {
            match row.into_conversation() {
                Ok(conversation) => conversations.push((conversation, unseen)),
                Err(e) => warn!("Skipping unreadable conversation row: {:#}", e),
            }
        }

        let profiles = join_all(conversations.iter().map(|(conversation, _)| {
            let other = conversation.counterpart(user_id).unwrap_or(user_id);
            resolve_profile(self.lookup.as_ref(), other)
        }))
        .await;

        Ok(conversations
            .into_iter()
            .zip(profiles)
            .map(|((conversation, unseen_count), counterpart)| ConversationSummary {
                conversation,
                unseen_count,
                counterpart,
            })
            .collect())
    }

    /// Loads the conversation and checks membership.
    pub async fn authorize_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> ServiceResult<Conversation> {
        let row = with_db(&self.db, move |db| db.get_conversation(&conversation_id.to_string()))
            .await?
            .ok_or(ServiceError::NotFound("conversation"))?;
        let conversation = row.into_conversation().map_err(store_failure)?;
        if !conversation.has_participant(user_id) {
            return Err(ServiceError::Unauthorized);
        }
        Ok(conversation)
    }
}

//! Client-side view of one conversation.
//!
//! Sends show up immediately as pending entries keyed by a client id. The
//! server's copy replaces the pending one when it arrives, whether through
//! the HTTP response or the live `message:new` echo, and a history fetch is
//! always treated as the source of truth.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::models::{Message, MessageContent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// None until the server has stored the message.
    pub message_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub sender_id: Uuid,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
    pub state: SendState,
}

/// A stored message as reported by either the HTTP or the realtime path.
#[derive(Debug, Clone)]
pub struct ServerCopy {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
}

impl From<&Message> for ServerCopy {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.id,
            sender_id: m.sender_id,
            content: m.content.clone(),
            created_at: m.created_at,
            seen: m.seen,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeline {
    pub conversation_id: Uuid,
    me: Uuid,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(conversation_id: Uuid, me: Uuid) -> Self {
        Self {
            conversation_id,
            me,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == SendState::Pending)
            .count()
    }

    /// Adds an optimistic entry and returns its client id.
    pub fn push_pending(&mut self, content: MessageContent) -> String {
        let client_id = Uuid::new_v4().to_string();
        self.entries.push(TimelineEntry {
            message_id: None,
            client_id: Some(client_id.clone()),
            sender_id: self.me,
            content,
            created_at: Utc::now(),
            seen: false,
            state: SendState::Pending,
        });
        client_id
    }

    pub fn fail(&mut self, client_id: &str) {
        if let Some(entry) = self.unconfirmed_mut(client_id) {
            entry.state = SendState::Failed;
        }
    }

    /// Applies a stored message. Idempotent: the same copy arriving over
    /// HTTP and over the socket yields one entry.
    pub fn upsert(&mut self, copy: ServerCopy, client_id: Option<&str>) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.message_id == Some(copy.message_id))
        {
            self.entries[pos].seen |= copy.seen;
            if let Some(cid) = client_id {
                // A stale pending twin can exist if the echo won the race.
                self.entries
                    .retain(|e| e.message_id.is_some() || e.client_id.as_deref() != Some(cid));
            }
            return;
        }

        if let Some(entry) = client_id.and_then(|cid| self.unconfirmed_mut(cid)) {
            entry.message_id = Some(copy.message_id);
            entry.content = copy.content;
            entry.created_at = copy.created_at;
            entry.seen = copy.seen;
            entry.state = SendState::Sent;
            return;
        }

        self.entries.push(TimelineEntry {
            message_id: Some(copy.message_id),
            client_id: client_id.map(str::to_string),
            sender_id: copy.sender_id,
            content: copy.content,
            created_at: copy.created_at,
            seen: copy.seen,
            state: SendState::Sent,
        });
    }

    /// Replaces everything stored with `history`, in server order. Entries
    /// the server has not stored yet (pending or failed) stay at the end,
    /// unless history carries their client id, which means the send landed
    /// even though its confirmation never arrived.
    pub fn reconcile(&mut self, history: &[Message]) {
        let mut next: Vec<TimelineEntry> = history
            .iter()
            .map(|m| {
                let client_id = m.client_id.clone().or_else(|| {
                    self.entries
                        .iter()
                        .find(|e| e.message_id == Some(m.id))
                        .and_then(|e| e.client_id.clone())
                });
                TimelineEntry {
                    message_id: Some(m.id),
                    client_id,
                    sender_id: m.sender_id,
                    content: m.content.clone(),
                    created_at: m.created_at,
                    seen: m.seen,
                    state: SendState::Sent,
                }
            })
            .collect();
        let stored: HashSet<String> = history.iter().filter_map(|m| m.client_id.clone()).collect();
        next.extend(self.entries.drain(..).filter(|e| {
            e.message_id.is_none()
                && e.client_id.as_ref().is_none_or(|cid| !stored.contains(cid))
        }));
        self.entries = next;
    }

    /// The counterpart read the conversation: everything I sent is seen.
    pub fn mark_read(&mut self, reader_id: Uuid) {
        if reader_id == self.me {
            return;
        }
        for entry in &mut self.entries {
            if entry.sender_id == self.me && entry.message_id.is_some() {
                entry.seen = true;
            }
        }
    }

    fn unconfirmed_mut(&mut self, client_id: &str) -> Option<&mut TimelineEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.message_id.is_none() && e.client_id.as_deref() == Some(client_id))
    }
}

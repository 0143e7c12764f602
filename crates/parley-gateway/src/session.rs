//! Per-connection state. Owned by exactly one connection task; nothing else
//! reads or mutates it.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Token verified, no rooms joined.
    Authenticated,
    /// Member of at least one conversation room.
    Joined,
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection is closed")]
    Closed,
    #[error("join the conversation first")]
    NotJoined,
}

#[derive(Debug)]
pub struct ConnectionSession {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    state: SessionState,
    /// conversation id -> counterpart user id
    rooms: HashMap<Uuid, Uuid>,
    typing: HashSet<Uuid>,
}

impl ConnectionSession {
    /// Sessions only exist once the token has been verified at upgrade time.
    pub fn authenticated(conn_id: Uuid, user_id: Uuid, name: String) -> Self {
        Self {
            conn_id,
            user_id,
            name,
            state: SessionState::Authenticated,
            rooms: HashMap::new(),
            typing: HashSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns false if the room was already joined.
    pub fn join(&mut self, conversation_id: Uuid, counterpart: Uuid) -> Result<bool, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::Closed);
        }
        let added = self.rooms.insert(conversation_id, counterpart).is_none();
        self.state = SessionState::Joined;
        Ok(added)
    }

    /// Leaves a room. Returns whether the user was typing there.
    pub fn leave(&mut self, conversation_id: Uuid) -> Result<bool, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::Closed);
        }
        if self.rooms.remove(&conversation_id).is_none() {
            return Err(SessionError::NotJoined);
        }
        if self.rooms.is_empty() {
            self.state = SessionState::Authenticated;
        }
        Ok(self.typing.remove(&conversation_id))
    }

    pub fn counterpart(&self, conversation_id: Uuid) -> Result<Uuid, SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::Closed);
        }
        self.rooms
            .get(&conversation_id)
            .copied()
            .ok_or(SessionError::NotJoined)
    }

    pub fn is_member(&self, conversation_id: Uuid) -> bool {
        self.rooms.contains_key(&conversation_id)
    }

    /// Records a typing transition. Returns false when it repeats the current state.
    pub fn set_typing(&mut self, conversation_id: Uuid, typing: bool) -> Result<bool, SessionError> {
        self.counterpart(conversation_id)?;
        Ok(if typing {
            self.typing.insert(conversation_id)
        } else {
            self.typing.remove(&conversation_id)
        })
    }

    /// Drops all membership. Returns the rooms held and the subset where a
    /// typing indicator was still showing.
    pub fn disconnect(&mut self) -> (Vec<Uuid>, Vec<Uuid>) {
        self.state = SessionState::Disconnected;
        let rooms = self.rooms.drain().map(|(id, _)| id).collect();
        let typing = self.typing.drain().collect();
        (rooms, typing)
    }
}

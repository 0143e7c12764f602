use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::api::SendMessageRequest;
use parley_types::events::{ClientCommand, ServerEvent};
use parley_types::models::{MessageContent, User};

use crate::api::ApiClient;
use crate::error::{ClientError, ClientResult};
use crate::realtime::RealtimeConnection;
use crate::store::TokenStore;
use crate::timeline::{ServerCopy, Timeline};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    SignedOut,
    AwaitingCode { email: String },
    SignedIn { user_id: Uuid, name: String },
}

/// How long a room join may take before history is fetched anyway.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives sign-in, session restore, the realtime connection and the
/// per-conversation timelines for one signed-in user.
pub struct SessionController {
    server_url: String,
    api: ApiClient,
    state: SessionState,
    realtime: Option<RealtimeConnection>,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    /// Events read while waiting for a join, not yet handed out.
    backlog: VecDeque<ServerEvent>,
    timelines: HashMap<Uuid, Timeline>,
}

impl SessionController {
    pub fn new(server_url: &str, store: Arc<dyn TokenStore>) -> ClientResult<Self> {
        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            api: ApiClient::new(server_url, store)?,
            state: SessionState::SignedOut,
            realtime: None,
            events: None,
            backlog: VecDeque::new(),
            timelines: HashMap::new(),
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn is_realtime_connected(&self) -> bool {
        self.realtime.as_ref().is_some_and(RealtimeConnection::is_open)
    }

    pub fn timeline(&self, conversation_id: Uuid) -> Option<&Timeline> {
        self.timelines.get(&conversation_id)
    }

    /// Resumes a persisted session. Returns `None` when there is nothing to
    /// resume or the stored refresh token is no longer accepted.
    pub async fn restore(&mut self) -> ClientResult<Option<User>> {
        if !self.api.has_session().await {
            self.state = SessionState::SignedOut;
            return Ok(None);
        }
        match self.api.me().await {
            Ok(user) => {
                self.signed_in(&user).await;
                Ok(Some(user))
            }
            Err(ClientError::SignedOut) => {
                info!("Stored session expired");
                self.clear_session();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn request_code(&mut self, email: &str) -> ClientResult<()> {
        self.api.request_code(email).await?;
        self.state = SessionState::AwaitingCode {
            email: email.trim().to_lowercase(),
        };
        Ok(())
    }

    /// Completes the code step started by [`request_code`](Self::request_code).
    pub async fn verify(&mut self, code: &str) -> ClientResult<User> {
        let SessionState::AwaitingCode { email } = &self.state else {
            return Err(ClientError::SignedOut);
        };
        let auth = self.api.verify_code(email, code).await?;
        self.signed_in(&auth.user).await;
        Ok(auth.user)
    }

    /// Always ends signed out, whatever the server says.
    pub async fn logout(&mut self) -> ClientResult<()> {
        self.clear_session();
        self.api.logout().await
    }

    /// Closes the realtime connection. The session and timelines are kept;
    /// [`reconnect`](Self::reconnect) brings them back up to date.
    pub fn disconnect(&mut self) {
        self.realtime = None;
        self.events = None;
    }

    /// Opens a fresh realtime connection, rejoins every open conversation and
    /// reconciles each timeline against stored history, picking up anything
    /// sent while the connection was down.
    pub async fn reconnect(&mut self) -> ClientResult<()> {
        self.user_id()?;
        // Goes through refresh-on-401, so the socket gets a live token.
        let user = match self.api.me().await {
            Ok(user) => user,
            Err(ClientError::SignedOut) => {
                self.clear_session();
                return Err(ClientError::SignedOut);
            }
            Err(e) => return Err(e),
        };
        self.state = SessionState::SignedIn {
            user_id: user.id,
            name: user.name,
        };
        self.connect_realtime().await?;
        self.resync().await
    }

    /// Joins the room for live events, then loads history (marking the
    /// counterpart's messages seen). Joining first means nothing sent in
    /// between is missed by both paths.
    pub async fn open_conversation(&mut self, conversation_id: Uuid) -> ClientResult<&Timeline> {
        let me = self.user_id()?;
        self.sync_conversation(conversation_id).await?;
        Ok(self
            .timelines
            .entry(conversation_id)
            .or_insert_with(|| Timeline::new(conversation_id, me)))
    }

    /// Optimistic send. The entry is visible at once and is confirmed or
    /// marked failed when the server answers. Returns the client id.
    pub async fn send_text(&mut self, conversation_id: Uuid, text: &str) -> ClientResult<String> {
        let me = self.user_id()?;
        let content = MessageContent::text(text);
        let client_id = self
            .timelines
            .entry(conversation_id)
            .or_insert_with(|| Timeline::new(conversation_id, me))
            .push_pending(content.clone());

        let req = SendMessageRequest {
            text: content.text,
            image: content.image,
            client_id: Some(client_id.clone()),
        };
        let result = self.api.send_message(conversation_id, &req).await;

        let Some(timeline) = self.timelines.get_mut(&conversation_id) else {
            return result.map(|_| client_id);
        };
        match result {
            Ok(message) => {
                timeline.upsert(ServerCopy::from(&message), Some(&client_id));
                Ok(client_id)
            }
            Err(e) => {
                timeline.fail(&client_id);
                Err(e)
            }
        }
    }

    pub fn set_typing(&self, conversation_id: Uuid, typing: bool) -> ClientResult<()> {
        let realtime = self
            .realtime
            .as_ref()
            .ok_or_else(|| ClientError::Realtime("not connected".into()))?;
        let cmd = if typing {
            ClientCommand::TypingStart { conversation_id }
        } else {
            ClientCommand::TypingStop { conversation_id }
        };
        realtime.send(cmd)
    }

    /// Waits for the next gateway event and folds it into the timelines.
    /// `None` means the realtime connection is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.apply_event(&event);
            return Some(event);
        }
        let event = self.events.as_mut()?.recv().await;
        match event {
            Some(event) => {
                self.apply_event(&event);
                Some(event)
            }
            None => {
                warn!("Realtime connection lost");
                self.realtime = None;
                self.events = None;
                None
            }
        }
    }

    pub fn apply_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageNew {
                conversation_id,
                message_id,
                sender_id,
                text,
                image,
                timestamp,
                client_id,
            } => {
                let Some(timeline) = self.timelines.get_mut(conversation_id) else {
                    return;
                };
                let copy = ServerCopy {
                    message_id: *message_id,
                    sender_id: *sender_id,
                    content: MessageContent {
                        text: text.clone(),
                        image: image.clone(),
                    },
                    created_at: *timestamp,
                    seen: false,
                };
                timeline.upsert(copy, client_id.as_deref());
            }
            ServerEvent::MessageRead {
                conversation_id,
                reader_id,
                ..
            } => {
                if let Some(timeline) = self.timelines.get_mut(conversation_id) {
                    timeline.mark_read(*reader_id);
                }
            }
            _ => {}
        }
    }

    fn user_id(&self) -> ClientResult<Uuid> {
        match &self.state {
            SessionState::SignedIn { user_id, .. } => Ok(*user_id),
            _ => Err(ClientError::SignedOut),
        }
    }

    fn clear_session(&mut self) {
        self.disconnect();
        self.backlog.clear();
        self.timelines.clear();
        self.state = SessionState::SignedOut;
    }

    async fn signed_in(&mut self, user: &User) {
        self.state = SessionState::SignedIn {
            user_id: user.id,
            name: user.name.clone(),
        };
        info!("Signed in as {} ({})", user.name, user.id);

        // Realtime is an overlay; a failed connect leaves the session usable.
        if let Err(e) = self.connect_realtime().await {
            warn!("Realtime connection failed: {}", e);
            return;
        }
        if let Err(e) = self.resync().await {
            warn!("Could not resync open conversations: {}", e);
        }
    }

    async fn connect_realtime(&mut self) -> ClientResult<()> {
        self.disconnect();
        let token = self.api.access_token().await.ok_or(ClientError::SignedOut)?;
        let (realtime, events) = RealtimeConnection::connect(&self.server_url, &token).await?;
        self.realtime = Some(realtime);
        self.events = Some(events);
        Ok(())
    }

    async fn resync(&mut self) -> ClientResult<()> {
        let open: Vec<Uuid> = self.timelines.keys().copied().collect();
        for conversation_id in open {
            self.sync_conversation(conversation_id).await?;
        }
        Ok(())
    }

    async fn sync_conversation(&mut self, conversation_id: Uuid) -> ClientResult<()> {
        let me = self.user_id()?;
        self.join_live(conversation_id).await;
        let history = self.api.list_messages(conversation_id).await?;
        self.timelines
            .entry(conversation_id)
            .or_insert_with(|| Timeline::new(conversation_id, me))
            .reconcile(&history.messages);
        Ok(())
    }

    /// Sends a join and waits for the gateway to confirm it. Everything read
    /// meanwhile is queued for [`next_event`](Self::next_event).
    async fn join_live(&mut self, conversation_id: Uuid) {
        let Some(realtime) = &self.realtime else {
            return;
        };
        if let Err(e) = realtime.send(ClientCommand::Join { conversation_id }) {
            warn!("Could not join {} live: {}", conversation_id, e);
            return;
        }
        let Some(events) = self.events.as_mut() else {
            return;
        };

        let backlog = &mut self.backlog;
        let confirmed = tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                let done = match &event {
                    ServerEvent::ConversationJoined { conversation_id: id } => *id == conversation_id,
                    ServerEvent::Error { .. } => true,
                    _ => false,
                };
                backlog.push_back(event);
                if done {
                    return true;
                }
            }
            false
        })
        .await;

        match confirmed {
            Ok(true) => {}
            Ok(false) => {
                warn!("Realtime connection lost while joining {}", conversation_id);
                self.disconnect();
            }
            Err(_) => warn!("No join confirmation for {} yet", conversation_id),
        }
    }
}

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_core::ServiceError;
use parley_types::events::{ClientCommand, ServerEvent};
use parley_types::models::{MessageContent, PresenceStatus};

use crate::GatewayState;
use crate::session::{ConnectionSession, SessionError};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type WsSender = SplitSink<WebSocket, Message>;

/// Drive one authenticated connection until the transport closes. The token
/// was verified before the upgrade, so the session starts `Authenticated`.
pub async fn handle_connection(socket: WebSocket, state: GatewayState, user_id: Uuid, name: String) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut targeted_rx) = state.dispatcher.register(user_id).await;
    let mut broadcast_rx = state.dispatcher.subscribe();
    let mut session = ConnectionSession::authenticated(conn_id, user_id, name);

    info!("{} ({}) connected to gateway [conn {}]", session.name, user_id, conn_id);

    let ready = ServerEvent::Ready {
        user_id,
        name: session.name.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        state.dispatcher.unregister(conn_id).await;
        return;
    }

    // Let the client see who is already here before our own arrival is announced.
    for (uid, status) in state.presence.snapshot() {
        if uid == user_id {
            continue;
        }
        let event = ServerEvent::PresenceUpdate {
            user_id: uid,
            status,
            last_seen: None,
        };
        if send_event(&mut sender, &event).await.is_err() {
            state.dispatcher.unregister(conn_id).await;
            return;
        }
    }
    state.presence.connected(user_id).await;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut pong_received = true;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(cmd) => {
                                if let Some(reply) = handle_command(&state, &mut session, cmd).await {
                                    if send_event(&mut sender, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(
                                    "{} ({}) bad command: {} -- raw: {}",
                                    session.name,
                                    user_id,
                                    e,
                                    text.chars().take(200).collect::<String>()
                                );
                                let reply = ServerEvent::error("bad_command", "unrecognised command");
                                if send_event(&mut sender, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Pong(_) => pong_received = true,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            targeted = targeted_rx.recv() => {
                let Some(event) = targeted else { break };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            result = broadcast_rx.recv() => {
                let event = match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Broadcast receiver lagged by {} messages", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if std::mem::replace(&mut pong_received, false) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Tear down: rooms go with the connection, open typing indicators are cleared.
    let (_rooms, typing) = session.disconnect();
    for conversation_id in typing {
        state
            .dispatcher
            .publish_to_room(
                conversation_id,
                ServerEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
                Some(conn_id),
            )
            .await;
    }
    state.dispatcher.unregister(conn_id).await;
    state.presence.disconnected(user_id);
    info!("{} ({}) disconnected from gateway [conn {}]", session.name, user_id, conn_id);
}

async fn send_event(sender: &mut WsSender, event: &ServerEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

fn service_error(err: ServiceError) -> ServerEvent {
    ServerEvent::error(err.code(), err.to_string())
}

fn session_error(err: SessionError) -> ServerEvent {
    let code = match err {
        SessionError::Closed => "closed",
        SessionError::NotJoined => "not_joined",
    };
    ServerEvent::error(code, err.to_string())
}

/// Applies one client command. Returns a reply for this connection only;
/// room and user fan-out go through the dispatcher.
async fn handle_command(
    state: &GatewayState,
    session: &mut ConnectionSession,
    cmd: ClientCommand,
) -> Option<ServerEvent> {
    let user_id = session.user_id;
    let conn_id = session.conn_id;

    match cmd {
        ClientCommand::Join { conversation_id } => {
            let conversation = match state.chat.authorize_participant(conversation_id, user_id).await {
                Ok(conversation) => conversation,
                Err(e) => return Some(service_error(e)),
            };
            let counterpart = conversation.counterpart(user_id)?;
            match session.join(conversation_id, counterpart) {
                Ok(_) => {
                    state.dispatcher.join_room(conversation_id, conn_id).await;
                    debug!("{} ({}) joined {}", session.name, user_id, conversation_id);
                    Some(ServerEvent::ConversationJoined { conversation_id })
                }
                Err(e) => Some(session_error(e)),
            }
        }

        ClientCommand::Leave { conversation_id } => match session.leave(conversation_id) {
            Ok(was_typing) => {
                state.dispatcher.leave_room(conversation_id, conn_id).await;
                if was_typing {
                    state
                        .dispatcher
                        .publish_to_room(
                            conversation_id,
                            ServerEvent::TypingStop {
                                conversation_id,
                                user_id,
                            },
                            None,
                        )
                        .await;
                }
                Some(ServerEvent::ConversationLeft { conversation_id })
            }
            Err(e) => Some(session_error(e)),
        },

        ClientCommand::SendMessage {
            conversation_id,
            text,
            image,
            client_id,
        } => {
            if let Err(e) = session.counterpart(conversation_id) {
                return Some(session_error(e));
            }
            // Persist first; fan-out only happens for stored messages.
            let message = match state
                .chat
                .send_message(conversation_id, user_id, MessageContent { text, image }, client_id)
                .await
            {
                Ok(message) => message,
                Err(e) => return Some(service_error(e)),
            };
            let conversation = match state.chat.authorize_participant(conversation_id, user_id).await {
                Ok(conversation) => conversation,
                Err(e) => return Some(service_error(e)),
            };
            if session.set_typing(conversation_id, false).unwrap_or(false) {
                state
                    .dispatcher
                    .publish_to_room(
                        conversation_id,
                        ServerEvent::TypingStop {
                            conversation_id,
                            user_id,
                        },
                        Some(conn_id),
                    )
                    .await;
            }
            state
                .dispatcher
                .announce_message(&conversation, &message)
                .await;
            None
        }

        ClientCommand::Delivered {
            conversation_id,
            message_id,
        } => {
            if let Err(e) = session.counterpart(conversation_id) {
                return Some(session_error(e));
            }
            state
                .dispatcher
                .publish_to_room(
                    conversation_id,
                    ServerEvent::MessageDelivered {
                        conversation_id,
                        message_id,
                        user_id,
                        timestamp: Utc::now(),
                    },
                    Some(conn_id),
                )
                .await;
            None
        }

        ClientCommand::TypingStart { conversation_id } => {
            relay_typing(state, session, conversation_id, true).await
        }

        ClientCommand::TypingStop { conversation_id } => {
            relay_typing(state, session, conversation_id, false).await
        }

        ClientCommand::SetPresence { status } => {
            if status == PresenceStatus::Offline {
                return Some(ServerEvent::error(
                    "validation_error",
                    "offline is set by disconnecting",
                ));
            }
            state.presence.set_status(user_id, status).await;
            None
        }
    }
}

async fn relay_typing(
    state: &GatewayState,
    session: &mut ConnectionSession,
    conversation_id: Uuid,
    typing: bool,
) -> Option<ServerEvent> {
    if let Err(e) = session.set_typing(conversation_id, typing) {
        return Some(session_error(e));
    }
    let user_id = session.user_id;
    trace!("{} typing={} in {}", user_id, typing, conversation_id);
    let event = if typing {
        ServerEvent::TypingStart {
            conversation_id,
            user_id,
        }
    } else {
        ServerEvent::TypingStop {
            conversation_id,
            user_id,
        }
    };
    state
        .dispatcher
        .publish_to_room(conversation_id, event, Some(session.conn_id))
        .await;
    None
}

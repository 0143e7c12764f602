use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::trace;
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::{Conversation, LatestMessage, Message};

struct ConnectionHandle {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Routes events to live connections. Holds only routing tables; the
/// per-connection session state lives in the connection task.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Presence updates go to every connection.
    broadcast_tx: broadcast::Sender<ServerEvent>,

    /// conn_id -> targeted sender
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,

    /// conversation_id -> conn_ids joined to it
    rooms: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to events addressed to every connection.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection's targeted channel. Returns (conn_id, receiver).
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnectionHandle { user_id, tx });
        (conn_id, rx)
    }

    /// Drop a connection and every room membership it held.
    pub async fn unregister(&self, conn_id: Uuid) {
        self.inner.connections.write().await.remove(&conn_id);
        let mut rooms = self.inner.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    pub async fn join_room(&self, conversation_id: Uuid, conn_id: Uuid) {
        self.inner
            .rooms
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(conn_id);
    }

    pub async fn leave_room(&self, conversation_id: Uuid, conn_id: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&conversation_id);
            }
        }
    }

    pub async fn room_size(&self, conversation_id: Uuid) -> usize {
        self.inner
            .rooms
            .read()
            .await
            .get(&conversation_id)
            .map_or(0, HashSet::len)
    }

    /// Send to every member of a room, optionally skipping one connection.
    pub async fn publish_to_room(
        &self,
        conversation_id: Uuid,
        event: ServerEvent,
        except: Option<Uuid>,
    ) {
        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(&conversation_id) else {
            return;
        };
        let connections = self.inner.connections.read().await;
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(handle) = connections.get(conn_id) {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    /// Fan out a persisted message: `message:new` to the room (sender's own
    /// connections included) and `conversation:updated` to counterpart
    /// connections that are not viewing the conversation.
    pub async fn announce_message(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) {
        let event = ServerEvent::message_new(message);
        self.publish_to_room(conversation.id, event, None).await;

        let Some(recipient) = conversation.counterpart(message.sender_id) else {
            return;
        };
        let nudge = ServerEvent::ConversationUpdated {
            conversation_id: conversation.id,
            latest_message: LatestMessage {
                text: message.content.preview(),
                sender_id: message.sender_id,
            },
        };

        let rooms = self.inner.rooms.read().await;
        let viewing = rooms.get(&conversation.id);
        let connections = self.inner.connections.read().await;
        for (conn_id, handle) in connections.iter() {
            if handle.user_id != recipient || viewing.is_some_and(|m| m.contains(conn_id)) {
                continue;
            }
            let _ = handle.tx.send(nudge.clone());
        }
        trace!("Announced message {} in {}", message.id, conversation.id);
    }

    /// Live read receipt after a history fetch flipped messages to seen.
    pub async fn announce_read(&self, conversation_id: Uuid, reader_id: Uuid, seen_at: DateTime<Utc>) {
        self.publish_to_room(
            conversation_id,
            ServerEvent::MessageRead {
                conversation_id,
                reader_id,
                seen_at,
            },
            None,
        )
        .await;
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::{MessageContent, MessageKind};

    fn conversation(a: Uuid, b: Uuid) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            participants: [a, b],
            latest_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(conversation_id: Uuid, sender_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            kind: MessageKind::Text,
            content: MessageContent::text("hi"),
            seen: false,
            seen_at: None,
            created_at: Utc::now(),
            client_id: Some("tmp-1".into()),
        }
    }

    #[tokio::test]
    async fn room_publish_skips_excluded_and_non_members() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();
        let (a, mut rx_a) = dispatcher.register(Uuid::new_v4()).await;
        let (b, mut rx_b) = dispatcher.register(Uuid::new_v4()).await;
        let (_c, mut rx_c) = dispatcher.register(Uuid::new_v4()).await;
        dispatcher.join_room(room, a).await;
        dispatcher.join_room(room, b).await;

        let event = ServerEvent::TypingStart {
            conversation_id: room,
            user_id: Uuid::new_v4(),
        };
        dispatcher.publish_to_room(room, event.clone(), Some(a)).await;

        assert_eq!(rx_b.try_recv().unwrap(), event);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_clears_room_membership() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();
        let (a, _rx) = dispatcher.register(Uuid::new_v4()).await;
        dispatcher.join_room(room, a).await;
        assert_eq!(dispatcher.room_size(room).await, 1);

        dispatcher.unregister(a).await;
        assert_eq!(dispatcher.room_size(room).await, 0);
        assert_eq!(dispatcher.connection_count().await, 0);
    }

    #[tokio::test]
    async fn message_nudges_counterpart_outside_the_room() {
        let dispatcher = Dispatcher::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(alice, bob);

        let (alice_conn, mut alice_rx) = dispatcher.register(alice).await;
        let (bob_viewing, mut bob_viewing_rx) = dispatcher.register(bob).await;
        let (_bob_inbox, mut bob_inbox_rx) = dispatcher.register(bob).await;
        dispatcher.join_room(conv.id, alice_conn).await;
        dispatcher.join_room(conv.id, bob_viewing).await;

        let msg = message(conv.id, alice);
        dispatcher.announce_message(&conv, &msg).await;

        match alice_rx.try_recv().unwrap() {
            ServerEvent::MessageNew { client_id, .. } => assert_eq!(client_id.as_deref(), Some("tmp-1")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(bob_viewing_rx.try_recv().unwrap(), ServerEvent::MessageNew { .. }));
        assert!(bob_viewing_rx.try_recv().is_err());
        assert!(matches!(
            bob_inbox_rx.try_recv().unwrap(),
            ServerEvent::ConversationUpdated { .. }
        ));
    }
}

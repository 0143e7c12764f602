use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use parley_cache::MemoryCredentialStore;
use parley_core::{ChatService, DbIdentityLookup, IdentityService, TokenConfig, TokenService};
use parley_db::Database;
use parley_db::models::format_ts;
use parley_gateway::{Dispatcher, GatewayState, PresenceTracker, ws_upgrade};
use parley_queue::MemoryWorkQueue;
use parley_types::events::{ClientCommand, ServerEvent};
use parley_types::models::{PresenceStatus, User};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: String,
    db: Arc<Database>,
    chat: Arc<ChatService>,
    tokens: Arc<TokenService>,
}

async fn spawn_gateway() -> TestServer {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cache = MemoryCredentialStore::new();
    let tokens = Arc::new(TokenService::new(
        TokenConfig::new("gateway-test-secret"),
        Arc::new(cache.clone()),
    ));
    let identity = Arc::new(IdentityService::new(
        db.clone(),
        Arc::new(cache),
        Arc::new(MemoryWorkQueue::new()),
        tokens.clone(),
    ));
    let chat = Arc::new(ChatService::new(db.clone(), Arc::new(DbIdentityLookup::new(db.clone()))));
    let dispatcher = Dispatcher::new();
    let presence = PresenceTracker::new(dispatcher.clone(), identity.clone(), Duration::from_millis(50));

    let state = GatewayState {
        dispatcher,
        presence,
        chat: chat.clone(),
        identity,
    };
    let app = Router::new().route("/gateway", get(ws_upgrade)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr: addr.to_string(),
        db,
        chat,
        tokens,
    }
}

impl TestServer {
    async fn user(&self, email: &str, name: &str) -> (User, String) {
        let (row, _) = self
            .db
            .find_or_create_user(&Uuid::new_v4().to_string(), email, name, &format_ts(Utc::now()))
            .unwrap();
        let user = row.into_user().unwrap();
        let pair = self.tokens.issue_pair(&user).await.unwrap();
        (user, pair.access_token)
    }

    async fn connect(&self, token: &str) -> Ws {
        let url = format!("ws://{}/gateway?token={}", self.addr, token);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }
}

async fn send(ws: &mut Ws, cmd: &ClientCommand) {
    let text = serde_json::to_string(cmd).unwrap();
    ws.send(WsMessage::text(text)).await.unwrap();
}

/// Next event that is not a presence update.
async fn next_event(ws: &mut Ws) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("socket open").expect("frame");
            let WsMessage::Text(text) = msg else { continue };
            let event: ServerEvent = serde_json::from_str(&text).unwrap();
            if !matches!(event, ServerEvent::PresenceUpdate { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

async fn next_presence(ws: &mut Ws, user_id: Uuid) -> PresenceStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("socket open").expect("frame");
            let WsMessage::Text(text) = msg else { continue };
            if let ServerEvent::PresenceUpdate { user_id: uid, status, .. } =
                serde_json::from_str(&text).unwrap()
            {
                if uid == user_id {
                    return status;
                }
            }
        }
    })
    .await
    .expect("presence within timeout")
}

async fn join(ws: &mut Ws, conversation_id: Uuid) {
    send(ws, &ClientCommand::Join { conversation_id }).await;
    assert_eq!(
        next_event(ws).await,
        ServerEvent::ConversationJoined { conversation_id }
    );
}

#[tokio::test]
async fn handshake_without_valid_token_is_rejected() {
    let server = spawn_gateway().await;

    let err = connect_async(format!("ws://{}/gateway", server.addr))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("unexpected {other:?}"),
    }

    let err = connect_async(format!("ws://{}/gateway?token=garbage", server.addr))
        .await
        .unwrap_err();
    assert!(matches!(err, tokio_tungstenite::tungstenite::Error::Http(resp) if resp.status() == 401));
}

#[tokio::test]
async fn ready_carries_identity_from_token() {
    let server = spawn_gateway().await;
    let (alice, token) = server.user("alice@x.com", "Alice").await;

    let mut ws = server.connect(&token).await;
    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::Ready {
            user_id: alice.id,
            name: "Alice".into()
        }
    );
}

#[tokio::test]
async fn two_users_chat_in_a_room() {
    let server = spawn_gateway().await;
    let (alice, alice_token) = server.user("alice@x.com", "Alice").await;
    let (bob, bob_token) = server.user("bob@x.com", "Bob").await;
    let (conv, _) = server
        .chat
        .create_or_get_conversation(alice.id, bob.id)
        .await
        .unwrap();

    let mut a = server.connect(&alice_token).await;
    let mut b = server.connect(&bob_token).await;
    assert!(matches!(next_event(&mut a).await, ServerEvent::Ready { .. }));
    assert!(matches!(next_event(&mut b).await, ServerEvent::Ready { .. }));

    for ws in [&mut a, &mut b] {
        send(ws, &ClientCommand::Join { conversation_id: conv.id }).await;
        assert_eq!(
            next_event(ws).await,
            ServerEvent::ConversationJoined { conversation_id: conv.id }
        );
    }

    send(&mut a, &ClientCommand::TypingStart { conversation_id: conv.id }).await;
    assert_eq!(
        next_event(&mut b).await,
        ServerEvent::TypingStart {
            conversation_id: conv.id,
            user_id: alice.id
        }
    );

    send(
        &mut a,
        &ClientCommand::SendMessage {
            conversation_id: conv.id,
            text: Some("  hello bob ".into()),
            image: None,
            client_id: Some("tmp-1".into()),
        },
    )
    .await;

    // Sending clears the typing indicator before the message lands.
    assert_eq!(
        next_event(&mut b).await,
        ServerEvent::TypingStop {
            conversation_id: conv.id,
            user_id: alice.id
        }
    );
    let message_id = match next_event(&mut b).await {
        ServerEvent::MessageNew {
            message_id,
            sender_id,
            text,
            ..
        } => {
            assert_eq!(sender_id, alice.id);
            assert_eq!(text.as_deref(), Some("hello bob"));
            message_id
        }
        other => panic!("unexpected {other:?}"),
    };
    match next_event(&mut a).await {
        ServerEvent::MessageNew {
            message_id: echoed,
            client_id,
            ..
        } => {
            assert_eq!(echoed, message_id);
            assert_eq!(client_id.as_deref(), Some("tmp-1"));
        }
        other => panic!("unexpected {other:?}"),
    }

    send(
        &mut b,
        &ClientCommand::Delivered {
            conversation_id: conv.id,
            message_id,
        },
    )
    .await;
    match next_event(&mut a).await {
        ServerEvent::MessageDelivered {
            message_id: acked,
            user_id,
            ..
        } => {
            assert_eq!(acked, message_id);
            assert_eq!(user_id, bob.id);
        }
        other => panic!("unexpected {other:?}"),
    }

    let history = server.chat.list_messages(conv.id, bob.id).await.unwrap();
    assert_eq!(history.messages.len(), 1);
    assert_eq!(history.newly_seen, 1);
}

#[tokio::test]
async fn outsiders_and_unjoined_sends_get_errors() {
    let server = spawn_gateway().await;
    let (alice, _) = server.user("alice@x.com", "Alice").await;
    let (bob, _) = server.user("bob@x.com", "Bob").await;
    let (_carol, carol_token) = server.user("carol@x.com", "Carol").await;
    let (conv, _) = server
        .chat
        .create_or_get_conversation(alice.id, bob.id)
        .await
        .unwrap();

    let mut c = server.connect(&carol_token).await;
    assert!(matches!(next_event(&mut c).await, ServerEvent::Ready { .. }));

    send(&mut c, &ClientCommand::Join { conversation_id: conv.id }).await;
    match next_event(&mut c).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, "unauthorized"),
        other => panic!("unexpected {other:?}"),
    }

    send(
        &mut c,
        &ClientCommand::SendMessage {
            conversation_id: conv.id,
            text: Some("let me in".into()),
            image: None,
            client_id: None,
        },
    )
    .await;
    match next_event(&mut c).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, "not_joined"),
        other => panic!("unexpected {other:?}"),
    }

    c.send(WsMessage::text("{not json")).await.unwrap();
    match next_event(&mut c).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, "bad_command"),
        other => panic!("unexpected {other:?}"),
    }

    let history = server.chat.list_messages(conv.id, alice.id).await.unwrap();
    assert!(history.messages.is_empty());
}

#[tokio::test]
async fn closing_the_last_connection_announces_offline_after_grace() {
    let server = spawn_gateway().await;
    let (alice, alice_token) = server.user("alice@x.com", "Alice").await;
    let (_bob, bob_token) = server.user("bob@x.com", "Bob").await;

    let mut b = server.connect(&bob_token).await;
    assert!(matches!(next_event(&mut b).await, ServerEvent::Ready { .. }));

    let mut a = server.connect(&alice_token).await;
    assert_eq!(next_presence(&mut b, alice.id).await, PresenceStatus::Online);

    a.close(None).await.unwrap();
    assert_eq!(next_presence(&mut b, alice.id).await, PresenceStatus::Offline);

    let stored = server.db.get_user_by_id(&alice.id.to_string()).unwrap().unwrap();
    assert_eq!(stored.status, "offline");
    assert!(stored.last_seen.is_some());
}

#[tokio::test]
async fn leaving_while_typing_stops_indicator_and_room_events() {
    let server = spawn_gateway().await;
    let (alice, alice_token) = server.user("alice@x.com", "Alice").await;
    let (bob, bob_token) = server.user("bob@x.com", "Bob").await;
    let (conv, _) = server
        .chat
        .create_or_get_conversation(alice.id, bob.id)
        .await
        .unwrap();

    let mut a = server.connect(&alice_token).await;
    let mut b = server.connect(&bob_token).await;
    assert!(matches!(next_event(&mut a).await, ServerEvent::Ready { .. }));
    assert!(matches!(next_event(&mut b).await, ServerEvent::Ready { .. }));
    join(&mut a, conv.id).await;
    join(&mut b, conv.id).await;

    send(&mut a, &ClientCommand::TypingStart { conversation_id: conv.id }).await;
    assert!(matches!(next_event(&mut b).await, ServerEvent::TypingStart { .. }));

    send(&mut a, &ClientCommand::Leave { conversation_id: conv.id }).await;
    assert_eq!(
        next_event(&mut a).await,
        ServerEvent::ConversationLeft { conversation_id: conv.id }
    );
    assert_eq!(
        next_event(&mut b).await,
        ServerEvent::TypingStop {
            conversation_id: conv.id,
            user_id: alice.id
        }
    );

    // Bob's typing no longer reaches Alice; his message arrives only as an
    // inbox nudge because she is not viewing the room.
    send(&mut b, &ClientCommand::TypingStart { conversation_id: conv.id }).await;
    send(
        &mut b,
        &ClientCommand::SendMessage {
            conversation_id: conv.id,
            text: Some("you there?".into()),
            image: None,
            client_id: None,
        },
    )
    .await;
    assert!(matches!(next_event(&mut b).await, ServerEvent::MessageNew { .. }));
    match next_event(&mut a).await {
        ServerEvent::ConversationUpdated {
            conversation_id,
            latest_message,
        } => {
            assert_eq!(conversation_id, conv.id);
            assert_eq!(latest_message.sender_id, bob.id);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn dropping_the_connection_while_typing_stops_indicator() {
    let server = spawn_gateway().await;
    let (alice, alice_token) = server.user("alice@x.com", "Alice").await;
    let (bob, bob_token) = server.user("bob@x.com", "Bob").await;
    let (conv, _) = server
        .chat
        .create_or_get_conversation(alice.id, bob.id)
        .await
        .unwrap();

    let mut a = server.connect(&alice_token).await;
    let mut b = server.connect(&bob_token).await;
    assert!(matches!(next_event(&mut a).await, ServerEvent::Ready { .. }));
    assert!(matches!(next_event(&mut b).await, ServerEvent::Ready { .. }));
    join(&mut a, conv.id).await;
    join(&mut b, conv.id).await;

    send(&mut a, &ClientCommand::TypingStart { conversation_id: conv.id }).await;
    assert!(matches!(next_event(&mut b).await, ServerEvent::TypingStart { .. }));

    a.close(None).await.unwrap();
    assert_eq!(
        next_event(&mut b).await,
        ServerEvent::TypingStop {
            conversation_id: conv.id,
            user_id: alice.id
        }
    );
}

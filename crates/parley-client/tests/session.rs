use std::sync::Arc;
use std::time::Duration;

use parley_api::AppStateInner;
use parley_cache::MemoryCredentialStore;
use parley_client::{
    ClientError, MemoryTokenStore, SendState, SessionController, SessionState, StoredTokens,
    TokenStore,
};
use parley_core::{ChatService, DbIdentityLookup, IdentityService, TokenConfig, TokenService};
use parley_db::Database;
use parley_gateway::{Dispatcher, GatewayState, PresenceTracker};
use parley_queue::{MemoryWorkQueue, WorkQueue};
use parley_types::events::ServerEvent;
use parley_types::jobs::{MailJob, OTP_QUEUE};

struct TestServer {
    url: String,
    queue: MemoryWorkQueue,
}

async fn spawn_server() -> TestServer {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cache = MemoryCredentialStore::new();
    let queue = MemoryWorkQueue::new();
    let tokens = Arc::new(TokenService::new(
        TokenConfig::new("client-test-secret"),
        Arc::new(cache.clone()),
    ));
    let identity = Arc::new(IdentityService::new(
        db.clone(),
        Arc::new(cache.clone()),
        Arc::new(queue.clone()),
        tokens,
    ));
    let chat = Arc::new(ChatService::new(db.clone(), Arc::new(DbIdentityLookup::new(db.clone()))));
    let dispatcher = Dispatcher::new();
    let presence = PresenceTracker::new(dispatcher.clone(), identity.clone(), Duration::from_millis(50));
    let state = Arc::new(AppStateInner {
        identity: identity.clone(),
        chat: chat.clone(),
        gateway: GatewayState {
            dispatcher,
            presence,
            chat,
            identity,
        },
        db,
        cache: Arc::new(cache),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = parley_api::router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("http://{addr}"),
        queue,
    }
}

impl TestServer {
    async fn mailed_code(&self) -> String {
        let delivery = self
            .queue
            .consume(OTP_QUEUE, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("a mail job");
        self.queue.ack(&delivery).await.unwrap();
        let job: MailJob = serde_json::from_str(&delivery.payload).unwrap();
        job.body
            .split(|c: char| !c.is_ascii_digit())
            .find(|w| w.len() == 6)
            .unwrap()
            .to_string()
    }

    async fn signed_in(&self, email: &str, store: &MemoryTokenStore) -> SessionController {
        let mut client = SessionController::new(&self.url, Arc::new(store.clone())).unwrap();
        client.request_code(email).await.unwrap();
        let code = self.mailed_code().await;
        client.verify(&code).await.unwrap();
        client
    }
}

async fn next_matching(
    client: &mut SessionController,
    pred: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = client.next_event().await.expect("realtime open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

#[tokio::test]
async fn sign_in_persists_and_restore_resumes() {
    let server = spawn_server().await;
    let store = MemoryTokenStore::new();

    let mut fresh = SessionController::new(&server.url, Arc::new(store.clone())).unwrap();
    assert!(fresh.restore().await.unwrap().is_none());
    assert_eq!(fresh.state(), &SessionState::SignedOut);

    let client = server.signed_in("alice@x.com", &store).await;
    assert!(matches!(client.state(), SessionState::SignedIn { .. }));
    assert!(client.is_realtime_connected());
    assert!(store.load().unwrap().is_some());

    let mut resumed = SessionController::new(&server.url, Arc::new(store.clone())).unwrap();
    let user = resumed.restore().await.unwrap().expect("session resumed");
    assert_eq!(user.email, "alice@x.com");
    assert!(resumed.is_realtime_connected());
}

#[tokio::test]
async fn expired_access_token_is_refreshed_and_rotated() {
    let server = spawn_server().await;
    let store = MemoryTokenStore::new();
    drop(server.signed_in("alice@x.com", &store).await);

    let original = store.load().unwrap().unwrap();
    store
        .save(&StoredTokens {
            access_token: "expired".into(),
            refresh_token: original.refresh_token.clone(),
        })
        .unwrap();

    let mut client = SessionController::new(&server.url, Arc::new(store.clone())).unwrap();
    let user = client.restore().await.unwrap();
    assert!(user.is_some());

    let rotated = store.load().unwrap().unwrap();
    assert_ne!(rotated.refresh_token, original.refresh_token);
    assert_ne!(rotated.access_token, "expired");
}

#[tokio::test]
async fn rejected_refresh_signs_out_and_clears_storage() {
    let server = spawn_server().await;
    let store = MemoryTokenStore::new();
    store
        .save(&StoredTokens {
            access_token: "bogus".into(),
            refresh_token: "also-bogus".into(),
        })
        .unwrap();

    let mut client = SessionController::new(&server.url, Arc::new(store.clone())).unwrap();
    assert!(client.restore().await.unwrap().is_none());
    assert_eq!(client.state(), &SessionState::SignedOut);
    assert!(store.load().unwrap().is_none());
}

#[tokio::test]
async fn logout_clears_local_state_even_when_server_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = MemoryTokenStore::new();
    store
        .save(&StoredTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
        })
        .unwrap();

    let mut client = SessionController::new(&format!("http://{addr}"), Arc::new(store.clone())).unwrap();
    client.logout().await.unwrap();
    assert!(store.load().unwrap().is_none());
    assert!(matches!(client.api().me().await, Err(ClientError::SignedOut)));
}

#[tokio::test]
async fn wrong_code_keeps_awaiting_state() {
    let server = spawn_server().await;
    let mut client = SessionController::new(&server.url, Arc::new(MemoryTokenStore::new())).unwrap();
    client.request_code("alice@x.com").await.unwrap();
    let code = server.mailed_code().await;
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let err = client.verify(wrong).await.unwrap_err();
    assert_eq!(err.code(), Some("invalid_or_expired_code"));
    assert!(matches!(client.state(), SessionState::AwaitingCode { .. }));
    client.verify(&code).await.unwrap();
}

#[tokio::test]
async fn optimistic_send_reconciles_with_echo_and_read_receipt() {
    let server = spawn_server().await;
    let mut alice = server.signed_in("alice@x.com", &MemoryTokenStore::new()).await;
    let mut bob = server.signed_in("bob@x.com", &MemoryTokenStore::new()).await;

    let bob_id = bob.api().me().await.unwrap().id;
    let conv = alice.api().create_conversation(bob_id).await.unwrap().conversation_id;

    alice.open_conversation(conv).await.unwrap();
    next_matching(&mut alice, |e| matches!(e, ServerEvent::ConversationJoined { .. })).await;

    let client_id = alice.send_text(conv, "hello bob").await.unwrap();
    next_matching(&mut alice, |e| matches!(e, ServerEvent::MessageNew { .. })).await;

    let timeline = alice.timeline(conv).unwrap();
    assert_eq!(timeline.entries().len(), 1);
    let entry = &timeline.entries()[0];
    assert_eq!(entry.client_id.as_deref(), Some(client_id.as_str()));
    assert_eq!(entry.state, SendState::Sent);
    assert!(!entry.seen);

    let bob_view = bob.open_conversation(conv).await.unwrap();
    assert_eq!(bob_view.entries().len(), 1);
    assert_eq!(bob_view.entries()[0].content.text.as_deref(), Some("hello bob"));

    next_matching(&mut alice, |e| matches!(e, ServerEvent::MessageRead { .. })).await;
    assert!(alice.timeline(conv).unwrap().entries()[0].seen);
}

#[tokio::test]
async fn failed_send_is_marked_failed() {
    let server = spawn_server().await;
    let mut alice = server.signed_in("alice@x.com", &MemoryTokenStore::new()).await;
    let stranger = uuid::Uuid::new_v4();

    let err = alice.send_text(stranger, "anyone there?").await.unwrap_err();
    assert_eq!(err.code(), Some("not_found"));
    let timeline = alice.timeline(stranger).unwrap();
    assert_eq!(timeline.entries()[0].state, SendState::Failed);
}

#[tokio::test]
async fn reconnect_rejoins_rooms_and_catches_up_on_missed_messages() {
    let server = spawn_server().await;
    let mut alice = server.signed_in("alice@x.com", &MemoryTokenStore::new()).await;
    let mut bob = server.signed_in("bob@x.com", &MemoryTokenStore::new()).await;

    let bob_id = bob.api().me().await.unwrap().id;
    let conv = alice.api().create_conversation(bob_id).await.unwrap().conversation_id;
    alice.open_conversation(conv).await.unwrap();

    alice.disconnect();
    assert!(!alice.is_realtime_connected());
    bob.send_text(conv, "while you were away").await.unwrap();

    alice.reconnect().await.unwrap();
    assert!(alice.is_realtime_connected());
    let timeline = alice.timeline(conv).unwrap();
    assert_eq!(timeline.entries().len(), 1);
    assert_eq!(
        timeline.entries()[0].content.text.as_deref(),
        Some("while you were away")
    );

    // Live delivery resumes in the rejoined room.
    bob.send_text(conv, "welcome back").await.unwrap();
    next_matching(&mut alice, |e| {
        matches!(e, ServerEvent::MessageNew { text: Some(t), .. } if t == "welcome back")
    })
    .await;
    assert_eq!(alice.timeline(conv).unwrap().entries().len(), 2);
}

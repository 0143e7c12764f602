pub mod auth;
pub mod chats;
pub mod error;
pub mod health;
pub mod middleware;
pub mod users;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use parley_cache::CredentialStore;
use parley_core::{ChatService, IdentityService};
use parley_db::Database;
use parley_gateway::{GatewayState, ws_upgrade};

use crate::middleware::require_auth;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub identity: Arc<IdentityService>,
    pub chat: Arc<ChatService>,
    pub gateway: GatewayState,
    pub db: Arc<Database>,
    pub cache: Arc<dyn CredentialStore>,
}

/// Assembles every route. Cross-cutting layers (CORS, tracing) are added by
/// the binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/verify", post(auth::verify))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/users/{user_id}/profile", get(users::public_profile))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/chats", post(chats::create_conversation).get(chats::list_conversations))
        .route(
            "/chats/{conversation_id}/messages",
            post(chats::send_message).get(chats::list_messages),
        )
        .route("/users", get(users::list_users))
        .route("/users/me", get(users::me).patch(users::update_me))
        .route("/users/search", get(users::search_users))
        .route("/users/presence/bulk", post(users::bulk_presence))
        .route("/users/{user_id}", get(users::get_user))
        .route("/users/{user_id}/presence", get(users::presence))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state.gateway.clone());

    let health_route = Router::new()
        .route("/health", get(health::health))
        .with_state(state);

    Router::new()
        .nest("/api/v1", public_routes.merge(protected_routes))
        .merge(ws_route)
        .merge(health_route)
}

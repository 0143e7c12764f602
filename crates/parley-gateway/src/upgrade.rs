use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::GatewayState;
use crate::connection;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the access
/// token may also arrive as `?token=`.
fn bearer_token(headers: &HeaderMap, query: &TokenQuery) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.token.clone())
}

/// Authenticates before upgrading; an unauthenticated handshake gets a
/// plain 401 and never becomes a socket.
pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = bearer_token(&headers, &query) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let claims = match state.identity.tokens().verify_access(&token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("Rejected gateway handshake: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state, claims.sub, claims.name))
}

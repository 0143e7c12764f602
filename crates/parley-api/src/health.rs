use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: bool,
    pub cache: bool,
    pub connections: usize,
}

/// Liveness plus dependency reachability. 503 when either backend is down.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db = state.db.clone();
    let store = match tokio::task::spawn_blocking(move || db.ping()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Health check: store unreachable: {:#}", e);
            false
        }
        Err(e) => {
            warn!("Health check: spawn_blocking join error: {}", e);
            false
        }
    };
    let cache = match state.cache.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check: cache unreachable: {}", e);
            false
        }
    };

    let healthy = store && cache;
    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        store,
        cache,
        connections: state.gateway.dispatcher.connection_count().await,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

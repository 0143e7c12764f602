mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::AppStateInner;
use parley_cache::{CredentialStore, RedisCredentialStore};
use parley_core::{
    ChatService, DbIdentityLookup, HttpIdentityLookup, IdentityLookup, IdentityService,
    TokenConfig, TokenService,
};
use parley_db::Database;
use parley_gateway::{Dispatcher, GatewayState, PresenceTracker};
use parley_queue::{RedisWorkQueue, WorkQueue};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    if !config.has_usable_secret() {
        eprintln!("FATAL: PARLEY_JWT_SECRET is unset or still a placeholder.");
        eprintln!("       Set it in your .env file and restart.");
        std::process::exit(1);
    }

    // Stores
    let db = Arc::new(Database::open(&config.db_path)?);
    let cache: Arc<dyn CredentialStore> = Arc::new(RedisCredentialStore::connect(&config.redis_url).await?);
    let queue: Arc<dyn WorkQueue> = Arc::new(RedisWorkQueue::connect(&config.redis_url).await?);
    info!("Connected to {} and {}", config.db_path.display(), config.redis_url);

    // Services
    let tokens = Arc::new(TokenService::new(
        TokenConfig {
            secret: config.jwt_secret.clone(),
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
        },
        cache.clone(),
    ));
    let identity = Arc::new(IdentityService::new(db.clone(), cache.clone(), queue, tokens));
    let lookup: Arc<dyn IdentityLookup> = match &config.user_service_url {
        Some(url) => {
            info!("Resolving profiles via {}", url);
            Arc::new(HttpIdentityLookup::new(url.as_str())?)
        }
        None => Arc::new(DbIdentityLookup::new(db.clone())),
    };
    let chat = Arc::new(ChatService::new(db.clone(), lookup));

    // Realtime
    let dispatcher = Dispatcher::new();
    let presence = PresenceTracker::new(dispatcher.clone(), identity.clone(), config.presence_grace);
    let gateway = GatewayState {
        dispatcher,
        presence,
        chat: chat.clone(),
        identity: identity.clone(),
    };

    let state = Arc::new(AppStateInner {
        identity,
        chat,
        gateway,
        db,
        cache,
    });

    let app = parley_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Parley server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received Ctrl+C, shutting down...");
    }
}

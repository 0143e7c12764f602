use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use parley_mailer::{HttpMailTransport, LogTransport, MailTransport, MailWorker, MailerConfig, RetryPolicy};
use parley_queue::RedisWorkQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_mailer=debug".into()),
        )
        .init();

    let config = MailerConfig::from_env()?;
    let queue = Arc::new(RedisWorkQueue::connect(&config.redis_url).await?);

    let transport: Arc<dyn MailTransport> = match &config.relay_url {
        Some(url) => {
            info!("Delivering mail via {}", url);
            Arc::new(HttpMailTransport::new(url.as_str(), config.api_key.clone(), config.from.as_str())?)
        }
        None => {
            info!("PARLEY_MAIL_RELAY_URL unset, mail will be logged only");
            Arc::new(LogTransport)
        }
    };

    let worker = MailWorker::new(queue, transport).with_policy(RetryPolicy {
        poll_timeout: config.poll_timeout,
        max_attempts: config.max_attempts,
        ..RetryPolicy::default()
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;
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
                    warn!("Failed to install SIGTERM handler: {}", e);
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

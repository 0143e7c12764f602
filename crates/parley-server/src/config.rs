use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Secrets shipped in sample env files. The server refuses to start with them.
pub const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "changeme",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub redis_url: String,
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub presence_grace: Duration,
    /// When set, counterpart profiles are fetched from this identity service
    /// instead of the local user table.
    pub user_service_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let port = get("PARLEY_PORT", "5000")
            .parse()
            .context("PARLEY_PORT must be a port number")?;
        let access_secs: u64 = get("PARLEY_ACCESS_TOKEN_TTL_SECS", "900")
            .parse()
            .context("PARLEY_ACCESS_TOKEN_TTL_SECS must be a number of seconds")?;
        let refresh_secs: u64 = get("PARLEY_REFRESH_TOKEN_TTL_SECS", "604800")
            .parse()
            .context("PARLEY_REFRESH_TOKEN_TTL_SECS must be a number of seconds")?;
        let grace_ms: u64 = get("PARLEY_PRESENCE_GRACE_MS", "3000")
            .parse()
            .context("PARLEY_PRESENCE_GRACE_MS must be a number of milliseconds")?;

        Ok(Self {
            host: get("PARLEY_HOST", "0.0.0.0"),
            port,
            db_path: get("PARLEY_DB_PATH", "parley.db").into(),
            redis_url: get("PARLEY_REDIS_URL", "redis://127.0.0.1:6379"),
            jwt_secret: get("PARLEY_JWT_SECRET", ""),
            access_token_ttl: Duration::from_secs(access_secs),
            refresh_token_ttl: Duration::from_secs(refresh_secs),
            presence_grace: Duration::from_millis(grace_ms),
            user_service_url: var("PARLEY_USER_SERVICE_URL").filter(|u| !u.trim().is_empty()),
        })
    }

    pub fn has_usable_secret(&self) -> bool {
        !self.jwt_secret.is_empty() && !PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }
}

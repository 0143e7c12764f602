use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub redis_url: String,
    /// Mail relay endpoint. Unset means log-only delivery.
    pub relay_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
    pub poll_timeout: Duration,
    pub max_attempts: u32,
}

impl MailerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let poll_secs: u64 = non_empty("PARLEY_MAIL_POLL_SECS")
            .unwrap_or_else(|| "5".into())
            .parse()
            .context("PARLEY_MAIL_POLL_SECS must be a number of seconds")?;
        let max_attempts: u32 = non_empty("PARLEY_MAIL_MAX_ATTEMPTS")
            .unwrap_or_else(|| "5".into())
            .parse()
            .context("PARLEY_MAIL_MAX_ATTEMPTS must be a positive integer")?;

        Ok(Self {
            redis_url: non_empty("PARLEY_REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            relay_url: non_empty("PARLEY_MAIL_RELAY_URL"),
            api_key: non_empty("PARLEY_MAIL_API_KEY"),
            from: non_empty("PARLEY_MAIL_FROM")
                .unwrap_or_else(|| "Parley <no-reply@parley.local>".into()),
            poll_timeout: Duration::from_secs(poll_secs.max(1)),
            max_attempts: max_attempts.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_relay_means_log_only() {
        let cfg = MailerConfig::from_lookup(|key| {
            (key == "PARLEY_MAIL_RELAY_URL").then(|| "  ".to_string())
        })
        .unwrap();
        assert!(cfg.relay_url.is_none());
        assert_eq!(cfg.from, "Parley <no-reply@parley.local>");
        assert_eq!(cfg.poll_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_attempts, 5);
    }

    #[test]
    fn rejects_non_numeric_attempt_cap() {
        let err = MailerConfig::from_lookup(|key| {
            (key == "PARLEY_MAIL_MAX_ATTEMPTS").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("PARLEY_MAIL_MAX_ATTEMPTS"));
    }
}

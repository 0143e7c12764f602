//! Credential store: short-lived keyed values with expiry.
//!
//! Holds OTP codes, issuance rate-limit markers and live refresh-token ids.
//! Expiry is the only eviction path besides explicit consumption.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use parley_types::BoxFuture;
use thiserror::Error;

pub use memory::MemoryCredentialStore;
pub use redis_store::RedisCredentialStore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store operation failed: {0}")]
    Operation(String),
}

pub trait CredentialStore: Send + Sync {
    /// Writes `value`, replacing any live entry and resetting its expiry.
    fn set_ex(&self, key: &str, value: &str, ttl: Duration)
    -> BoxFuture<'_, Result<(), CacheError>>;

    /// Writes `value` only if no live entry exists. Returns whether it was written.
    fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CacheError>>;

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>>;

    /// Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CacheError>>;

    /// Atomic compare-and-delete: removes the entry only if it currently
    /// holds `expected`. Exactly one of several racing callers sees `true`.
    fn take_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, Result<bool, CacheError>>;

    fn ping(&self) -> BoxFuture<'_, Result<(), CacheError>>;
}

pub mod keys {
    pub fn otp(email: &str) -> String {
        format!("otp:{email}")
    }

    pub fn otp_rate_limit(email: &str) -> String {
        format!("otp:ratelimit:{email}")
    }

    pub fn refresh_token(jti: &str) -> String {
        format!("refresh:{jti}")
    }
}

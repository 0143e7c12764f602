use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_types::BoxFuture;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{CacheError, CredentialStore};

/// In-process store used by tests and single-node development runs.
/// Expiry is measured on the tokio clock so paused-time tests can advance it.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().await.values().filter(|e| e.is_live(now)).count()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let expires_at = Instant::now() + ttl;
            self.entries.lock().await.insert(key, Entry { value, expires_at });
            Ok(())
        })
    }

    fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            if entries.get(&key).is_some_and(|e| e.is_live(now)) {
                return Ok(false);
            }
            entries.insert(
                key,
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
            Ok(true)
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            match entries.get(&key) {
                Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
                Some(_) => {
                    entries.remove(&key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let removed = self.entries.lock().await.remove(&key);
            Ok(removed.is_some_and(|e| e.is_live(now)))
        })
    }

    fn take_if_equals(&self, key: &str, expected: &str) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = key.to_string();
        let expected = expected.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            let matches = entries
                .get(&key)
                .is_some_and(|e| e.is_live(now) && e.value == expected);
            if matches {
                entries.remove(&key);
            }
            Ok(matches)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), CacheError>> {
        Box::pin(async { Ok(()) })
    }
}

//! Where the token pair lives between runs.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use parley_types::api::TokenPairResponse;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl From<&TokenPairResponse> for StoredTokens {
    fn from(pair: &TokenPairResponse) -> Self {
        Self {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
        }
    }
}

pub trait TokenStore: Send + Sync {
    fn load(&self) -> ClientResult<Option<StoredTokens>>;
    fn save(&self, tokens: &StoredTokens) -> ClientResult<()>;
    fn clear(&self) -> ClientResult<()>;
}

/// JSON file on disk. A missing file means signed out.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> ClientResult<Option<StoredTokens>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ClientError::Storage(e.to_string())),
        };
        match serde_json::from_str(&raw) {
            Ok(tokens) => Ok(Some(tokens)),
            Err(e) => {
                tracing::warn!("Discarding unreadable token file {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    fn save(&self, tokens: &StoredTokens) -> ClientResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| ClientError::Storage(e.to_string()))?;
        }
        let raw = serde_json::to_string(tokens).map_err(|e| ClientError::Storage(e.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|e| ClientError::Storage(e.to_string()))
    }

    fn clear(&self) -> ClientResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::Storage(e.to_string())),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    inner: Arc<Mutex<Option<StoredTokens>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<StoredTokens>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> ClientResult<Option<StoredTokens>> {
        Ok(self.lock().clone())
    }

    fn save(&self, tokens: &StoredTokens) -> ClientResult<()> {
        *self.lock() = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        *self.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> StoredTokens {
        StoredTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
        }
    }

    #[test]
    fn file_store_survives_reopen_and_clear_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("parley-client-{}", uuid::Uuid::new_v4()));
        let path = dir.join("session.json");

        let store = FileTokenStore::new(&path);
        assert_eq!(store.load().unwrap(), None);
        store.save(&tokens()).unwrap();

        let reopened = FileTokenStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(tokens()));

        reopened.clear().unwrap();
        reopened.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_reads_as_signed_out() {
        let path = std::env::temp_dir().join(format!("parley-client-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(FileTokenStore::new(&path).load().unwrap(), None);
        let _ = std::fs::remove_file(path);
    }
}

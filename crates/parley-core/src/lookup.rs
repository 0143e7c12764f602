//! Identity lookup used to enrich chat results with counterpart profiles.
//! Callers resolve through [`resolve_profile`], which never fails.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use parley_db::Database;
use parley_types::BoxFuture;
use parley_types::models::UserProfile;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("user {0} not found")]
    NotFound(Uuid),
    #[error("identity lookup unavailable: {0}")]
    Unavailable(String),
}

pub trait IdentityLookup: Send + Sync {
    fn profile(&self, user_id: Uuid) -> BoxFuture<'_, Result<UserProfile, LookupError>>;
}

/// Profile for `user_id`, or the "Unknown User" placeholder when the lookup
/// fails for any reason.
pub async fn resolve_profile(lookup: &dyn IdentityLookup, user_id: Uuid) -> UserProfile {
    match lookup.profile(user_id).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!("Substituting placeholder profile: {}", e);
            UserProfile::placeholder(user_id)
        }
    }
}

/// Reads profiles straight from the local user table.
pub struct DbIdentityLookup {
    db: Arc<Database>,
}

impl DbIdentityLookup {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl IdentityLookup for DbIdentityLookup {
    fn profile(&self, user_id: Uuid) -> BoxFuture<'_, Result<UserProfile, LookupError>> {
        Box::pin(async move {
            let db = self.db.clone();
            let row = tokio::task::spawn_blocking(move || db.get_user_by_id(&user_id.to_string()))
                .await
                .map_err(|e| LookupError::Unavailable(e.to_string()))?
                .map_err(|e| LookupError::Unavailable(e.to_string()))?
                .ok_or(LookupError::NotFound(user_id))?;
            let user = row
                .into_user()
                .map_err(|e| LookupError::Unavailable(format!("corrupt user row: {e}")))?;
            Ok(user.profile())
        })
    }
}

/// Calls the identity service's public profile endpoint.
#[derive(Clone)]
pub struct HttpIdentityLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityLookup {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .map_err(|e| LookupError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl IdentityLookup for HttpIdentityLookup {
    fn profile(&self, user_id: Uuid) -> BoxFuture<'_, Result<UserProfile, LookupError>> {
        let url = format!("{}/api/v1/users/{}/profile", self.base_url, user_id);
        Box::pin(async move {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| LookupError::Unavailable(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(LookupError::NotFound(user_id));
            }
            if !resp.status().is_success() {
                return Err(LookupError::Unavailable(format!(
                    "profile lookup returned {}",
                    resp.status()
                )));
            }

            resp.json::<UserProfile>()
                .await
                .map_err(|e| LookupError::Unavailable(e.to_string()))
        })
    }
}

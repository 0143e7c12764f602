use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use parley_cache::{CredentialStore, keys};
use parley_db::Database;
use parley_db::models::format_ts;
use parley_queue::{WorkQueue, publish_json};
use parley_types::api::{
    AuthResponse, PresenceResponse, ProfileUpdatedResponse, TokenPairResponse,
    UpdateProfileRequest, UserPage,
};
use parley_types::jobs::{MailJob, OTP_QUEUE};
use parley_types::models::{PresenceStatus, User, UserProfile};

use crate::error::{ServiceError, ServiceResult, store_failure};
use crate::tokens::TokenService;
use crate::validation::{
    check_bio, check_name, is_six_digit_code, normalize_email, placeholder_name,
};
use crate::with_db;

pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_BULK_PRESENCE: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct OtpPolicy {
    pub code_ttl: Duration,
    pub rate_limit_window: Duration,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(300),
            rate_limit_window: Duration::from_secs(60),
        }
    }
}

/// OTP issuance and verification, profiles and presence records.
pub struct IdentityService {
    db: Arc<Database>,
    cache: Arc<dyn CredentialStore>,
    queue: Arc<dyn WorkQueue>,
    tokens: Arc<TokenService>,
    policy: OtpPolicy,
}

impl IdentityService {
    pub fn new(
        db: Arc<Database>,
        cache: Arc<dyn CredentialStore>,
        queue: Arc<dyn WorkQueue>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            db,
            cache,
            queue,
            tokens,
            policy: OtpPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: OtpPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    // -- OTP --

    /// Issues a fresh code and queues its delivery. Returns once the mail job
    /// is enqueued; delivery happens in the mail worker.
    pub async fn request_code(&self, raw_email: &str) -> ServiceResult<()> {
        let email = normalize_email(raw_email)?;

        // Claiming the marker first means two racing requests cannot both issue.
        let claimed = self
            .cache
            .set_nx_ex(
                &keys::otp_rate_limit(&email),
                "1",
                self.policy.rate_limit_window,
            )
            .await?;
        if !claimed {
            return Err(ServiceError::RateLimited);
        }

        let code = generate_code();
        if let Err(e) = self
            .cache
            .set_ex(&keys::otp(&email), &code, self.policy.code_ttl)
            .await
        {
            // Release the window so the caller can retry once the store is back.
            let _ = self.cache.delete(&keys::otp_rate_limit(&email)).await;
            return Err(e.into());
        }

        let minutes = (self.policy.code_ttl.as_secs() / 60).max(1);
        let job = MailJob::otp(&email, &code, minutes);
        publish_json(self.queue.as_ref(), OTP_QUEUE, &job).await?;

        info!("OTP issued for {}", email);
        Ok(())
    }

    /// Consumes the code and signs the caller in, creating the user on first
    /// sight of the address.
    pub async fn verify_code(&self, raw_email: &str, code: &str) -> ServiceResult<AuthResponse> {
        let email = normalize_email(raw_email)?;
        let code = code.trim();
        if !is_six_digit_code(code) {
            return Err(ServiceError::InvalidOrExpiredCode);
        }

        let taken = self.cache.take_if_equals(&keys::otp(&email), code).await?;
        if !taken {
            return Err(ServiceError::InvalidOrExpiredCode);
        }

        let id = Uuid::new_v4().to_string();
        let name = placeholder_name(&email);
        let now = format_ts(Utc::now());
        let lookup_email = email.clone();
        let (row, created) = with_db(&self.db, move |db| {
            db.find_or_create_user(&id, &lookup_email, &name, &now)
        })
        .await?;
        let user = row.into_user().map_err(store_failure)?;

        let tokens = self.tokens.issue_pair(&user).await?;
        if created {
            info!("New user {} registered via OTP", user.id);
        }
        Ok(AuthResponse {
            user,
            is_new_user: created,
            tokens,
        })
    }

    // -- Session --

    pub async fn refresh(&self, refresh_token: &str) -> ServiceResult<TokenPairResponse> {
        let claims = self.tokens.consume_refresh(refresh_token).await?;
        let user = match self.find_user(claims.sub).await? {
            Some(user) => user,
            None => {
                warn!("Refresh for unknown user {}", claims.sub);
                return Err(ServiceError::Unauthorized);
            }
        };
        self.tokens.issue_pair(&user).await
    }

    pub async fn logout(&self, refresh_token: &str) -> ServiceResult<()> {
        self.tokens.revoke(refresh_token).await
    }

    // -- Profiles --

    pub async fn get_user(&self, user_id: Uuid) -> ServiceResult<User> {
        self.find_user(user_id).await?.ok_or(ServiceError::NotFound("user"))
    }

    pub async fn public_profile(&self, user_id: Uuid) -> ServiceResult<UserProfile> {
        Ok(self.get_user(user_id).await?.profile())
    }

    /// Applies a partial update. A name change re-mints the token pair since
    /// the name travels in the access-token claims.
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        req: UpdateProfileRequest,
    ) -> ServiceResult<ProfileUpdatedResponse> {
        let name = req.name.as_deref().map(check_name).transpose()?;
        let bio = req.bio.as_deref().map(check_bio).transpose()?;
        let avatar_url = match req.avatar_url.map(|u| u.trim().to_string()) {
            Some(url) if !(url.starts_with("https://") || url.starts_with("http://")) => {
                return Err(ServiceError::validation("avatar_url must be an http(s) URL"));
            }
            other => other,
        };
        if name.is_none() && bio.is_none() && avatar_url.is_none() {
            return Err(ServiceError::validation("nothing to update"));
        }

        let current = self.get_user(user_id).await?;
        let renamed = name.as_deref().is_some_and(|n| n != current.name);

        let row = with_db(&self.db, move |db| {
            db.update_profile(
                &user_id.to_string(),
                name.as_deref(),
                bio.as_deref(),
                avatar_url.as_deref(),
            )
        })
        .await?
        .ok_or(ServiceError::NotFound("user"))?;
        let user = row.into_user().map_err(store_failure)?;

        let tokens = if renamed {
            Some(self.tokens.issue_pair(&user).await?)
        } else {
            None
        };
        Ok(ProfileUpdatedResponse { user, tokens })
    }

    pub async fn list_users(&self, page: u32, limit: u32) -> ServiceResult<UserPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let offset = u64::from(page - 1) * u64::from(limit);
        let (rows, total) = with_db(&self.db, move |db| db.list_users(limit, offset)).await?;
        let users = rows
            .into_iter()
            .map(|r| r.into_user())
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(store_failure)?;
        Ok(UserPage {
            users,
            page,
            limit,
            total,
        })
    }

    pub async fn search_users(
        &self,
        requester: Uuid,
        query: &str,
        limit: u32,
    ) -> ServiceResult<Vec<User>> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(ServiceError::validation("search query is required"));
        }
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let rows = with_db(&self.db, move |db| {
            db.search_users(&query, &requester.to_string(), limit)
        })
        .await?;
        rows.into_iter()
            .map(|r| r.into_user())
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(store_failure)
    }

    // -- Presence --

    pub async fn presence(&self, user_id: Uuid) -> ServiceResult<PresenceResponse> {
        let user = self.get_user(user_id).await?;
        Ok(PresenceResponse {
            user_id: user.id,
            status: user.status,
            last_seen: user.last_seen,
        })
    }

    /// Unknown ids are skipped.
    pub async fn bulk_presence(&self, user_ids: Vec<Uuid>) -> ServiceResult<Vec<PresenceResponse>> {
        if user_ids.len() > MAX_BULK_PRESENCE {
            return Err(ServiceError::validation(format!(
                "at most {MAX_BULK_PRESENCE} user ids per request"
            )));
        }
        let ids: Vec<String> = user_ids.iter().map(Uuid::to_string).collect();
        let rows = with_db(&self.db, move |db| db.get_users_by_ids(&ids)).await?;
        rows.into_iter()
            .map(|r| {
                r.into_user().map(|u| PresenceResponse {
                    user_id: u.id,
                    status: u.status,
                    last_seen: u.last_seen,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(store_failure)
    }

    /// Persists a presence transition. Going offline stamps `last_seen`,
    /// which is returned.
    pub async fn set_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
    ) -> ServiceResult<Option<DateTime<Utc>>> {
        let last_seen = (status == PresenceStatus::Offline).then(Utc::now);
        let stamp = last_seen.map(format_ts);
        let found = with_db(&self.db, move |db| {
            db.set_presence(&user_id.to_string(), status.as_str(), stamp.as_deref())
        })
        .await?;
        if !found {
            return Err(ServiceError::NotFound("user"));
        }
        Ok(last_seen)
    }

    async fn find_user(&self, user_id: Uuid) -> ServiceResult<Option<User>> {
        let row = with_db(&self.db, move |db| db.get_user_by_id(&user_id.to_string())).await?;
        row.map(|r| r.into_user()).transpose().map_err(store_failure)
    }
}

fn generate_code() -> String {
    rand::rng().random_range(100_000..1_000_000u32).to_string()
}

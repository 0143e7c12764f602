//! Session token lifecycle: minting, verification, single-use refresh
//! rotation and revocation.
//!
//! Every refresh token carries a `jti`. The credential store holds
//! `refresh:<jti>` = user id for the refresh lifetime; exchanging the token
//! compare-and-deletes that entry, so a rotated-out token cannot be replayed.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{debug, error, warn};
use uuid::Uuid;

use parley_cache::{CredentialStore, keys};
use parley_types::api::{Claims, TokenPairResponse, TokenType};
use parley_types::models::User;

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    config: TokenConfig,
    store: Arc<dyn CredentialStore>,
}

impl TokenService {
    pub fn new(config: TokenConfig, store: Arc<dyn CredentialStore>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
            store,
        }
    }

    /// Mints an access/refresh pair and registers the refresh `jti` as live.
    pub async fn issue_pair(&self, user: &User) -> ServiceResult<TokenPairResponse> {
        let access_token = self.sign(user, TokenType::Access, Uuid::new_v4())?;
        let refresh_jti = Uuid::new_v4();
        let refresh_token = self.sign(user, TokenType::Refresh, refresh_jti)?;

        self.store
            .set_ex(
                &keys::refresh_token(&refresh_jti.to_string()),
                &user.id.to_string(),
                self.config.refresh_ttl,
            )
            .await?;

        Ok(TokenPairResponse {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl.as_secs(),
        })
    }

    /// Signature + expiry + type check. Any failure is `Unauthorized`.
    pub fn verify_access(&self, token: &str) -> ServiceResult<Claims> {
        self.decode_typed(token, TokenType::Access)
    }

    /// Validates a refresh token and consumes its `jti`. A second presentation
    /// of the same token fails.
    pub async fn consume_refresh(&self, token: &str) -> ServiceResult<Claims> {
        let claims = self.decode_typed(token, TokenType::Refresh)?;
        let consumed = self
            .store
            .take_if_equals(
                &keys::refresh_token(&claims.jti.to_string()),
                &claims.sub.to_string(),
            )
            .await?;
        if !consumed {
            warn!(
                "Refresh token reuse for user {} (jti {}); token was already rotated or revoked",
                claims.sub, claims.jti
            );
            return Err(ServiceError::Unauthorized);
        }
        Ok(claims)
    }

    /// Best-effort server-side invalidation. Unparseable tokens are ignored.
    pub async fn revoke(&self, token: &str) -> ServiceResult<()> {
        let claims = match self.decode_typed(token, TokenType::Refresh) {
            Ok(claims) => claims,
            Err(_) => {
                debug!("Ignoring logout with an invalid refresh token");
                return Ok(());
            }
        };
        self.store
            .delete(&keys::refresh_token(&claims.jti.to_string()))
            .await?;
        Ok(())
    }

    fn sign(&self, user: &User, token_type: TokenType, jti: Uuid) -> ServiceResult<String> {
        let now = chrono::Utc::now().timestamp();
        let ttl = match token_type {
            TokenType::Access => self.config.access_ttl,
            TokenType::Refresh => self.config.refresh_ttl,
        };
        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            jti,
            token_type,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            error!("Failed to sign token: {}", e);
            ServiceError::Unauthorized
        })
    }

    fn decode_typed(&self, token: &str, expected: TokenType) -> ServiceResult<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!("Rejected token: {}", e);
            ServiceError::Unauthorized
        })?;
        if data.claims.token_type != expected {
            return Err(ServiceError::Unauthorized);
        }
        Ok(data.claims)
    }
}

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::api::{
    AuthResponse, ConversationSummary, CreateConversationRequest, CreateConversationResponse,
    ErrorBody, MessageHistoryResponse, ProfileUpdatedResponse, RefreshTokenRequest,
    RequestCodeRequest, SendMessageRequest, TokenPairResponse, UpdateProfileRequest,
    VerifyCodeRequest,
};
use parley_types::models::{Message, User};

use crate::error::{ClientError, ClientResult};
use crate::store::{StoredTokens, TokenStore};

/// HTTP client for the `/api/v1` surface. Authenticated calls that come back
/// 401 trigger one refresh-and-retry; a rejected refresh signs the client out.
pub struct ApiClient {
    http: reqwest::Client,
    api_base: String,
    store: Arc<dyn TokenStore>,
    /// Current pair. Held across a refresh so concurrent 401s refresh once.
    tokens: Mutex<Option<StoredTokens>>,
}

impl ApiClient {
    /// `server_url` is the origin, e.g. `http://localhost:5000`.
    pub fn new(server_url: &str, store: Arc<dyn TokenStore>) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let tokens = store.load()?;
        Ok(Self {
            http,
            api_base: format!("{}/api/v1", server_url.trim_end_matches('/')),
            store,
            tokens: Mutex::new(tokens),
        })
    }

    pub async fn has_session(&self) -> bool {
        self.tokens.lock().await.is_some()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.tokens.lock().await.as_ref().map(|t| t.access_token.clone())
    }

    // -- Sign-in --

    pub async fn request_code(&self, email: &str) -> ClientResult<()> {
        let resp = self
            .http
            .post(self.url("/auth/login"))
            .json(&RequestCodeRequest {
                email: email.to_string(),
            })
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    pub async fn verify_code(&self, email: &str, code: &str) -> ClientResult<AuthResponse> {
        let resp = self
            .http
            .post(self.url("/auth/verify"))
            .json(&VerifyCodeRequest {
                email: email.to_string(),
                code: code.to_string(),
            })
            .send()
            .await?;
        let auth: AuthResponse = check(resp).await?.json().await?;
        self.replace_tokens(Some(StoredTokens::from(&auth.tokens))).await?;
        Ok(auth)
    }

    /// Local credentials are dropped first; the server call is best effort.
    pub async fn logout(&self) -> ClientResult<()> {
        let previous = self.tokens.lock().await.take();
        self.store.clear()?;

        let Some(tokens) = previous else {
            return Ok(());
        };
        let result = self
            .http
            .post(self.url("/auth/logout"))
            .json(&RefreshTokenRequest {
                refresh_token: tokens.refresh_token,
            })
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!("Server logout returned {}", resp.status()),
            Err(e) => warn!("Server logout failed: {}", e),
        }
        Ok(())
    }

    // -- Profile --

    pub async fn me(&self) -> ClientResult<User> {
        self.authed(Method::GET, "/users/me", None::<&()>).await
    }

    /// A rename re-mints the pair; the new one is persisted.
    pub async fn update_profile(&self, req: &UpdateProfileRequest) -> ClientResult<ProfileUpdatedResponse> {
        let updated: ProfileUpdatedResponse = self.authed(Method::PATCH, "/users/me", Some(req)).await?;
        if let Some(pair) = &updated.tokens {
            self.replace_tokens(Some(StoredTokens::from(pair))).await?;
        }
        Ok(updated)
    }

    // -- Chat --

    pub async fn create_conversation(&self, other_user_id: Uuid) -> ClientResult<CreateConversationResponse> {
        let req = CreateConversationRequest { other_user_id };
        self.authed(Method::POST, "/chats", Some(&req)).await
    }

    pub async fn list_conversations(&self) -> ClientResult<Vec<ConversationSummary>> {
        self.authed(Method::GET, "/chats", None::<&()>).await
    }

    pub async fn send_message(&self, conversation_id: Uuid, req: &SendMessageRequest) -> ClientResult<Message> {
        let path = format!("/chats/{conversation_id}/messages");
        self.authed(Method::POST, &path, Some(req)).await
    }

    pub async fn list_messages(&self, conversation_id: Uuid) -> ClientResult<MessageHistoryResponse> {
        let path = format!("/chats/{conversation_id}/messages");
        self.authed(Method::GET, &path, None::<&()>).await
    }

    // -- Plumbing --

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn authed<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> ClientResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let access = self.access_token().await.ok_or(ClientError::SignedOut)?;
        let resp = self.send(method.clone(), path, &access, body).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(check(resp).await?.json().await?);
        }

        debug!("{} {} returned 401, refreshing", method, path);
        let fresh = self.refresh_after(&access).await?;
        let resp = self.send(method, path, &fresh, body).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.replace_tokens(None).await?;
            return Err(ClientError::SignedOut);
        }
        Ok(check(resp).await?.json().await?)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        access: &str,
        body: Option<&B>,
    ) -> ClientResult<Response> {
        let mut request = self.http.request(method, self.url(path)).bearer_auth(access);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Rotates the pair unless another caller already did since `stale` was
    /// read. Returns the access token to retry with.
    async fn refresh_after(&self, stale: &str) -> ClientResult<String> {
        let mut tokens = self.tokens.lock().await;
        let current = tokens.clone().ok_or(ClientError::SignedOut)?;
        if current.access_token != stale {
            return Ok(current.access_token);
        }

        let resp = self
            .http
            .post(self.url("/auth/refresh"))
            .json(&RefreshTokenRequest {
                refresh_token: current.refresh_token,
            })
            .send()
            .await?;

        if resp.status().is_client_error() {
            warn!("Refresh token rejected ({}), signing out", resp.status());
            *tokens = None;
            self.store.clear()?;
            return Err(ClientError::SignedOut);
        }
        let pair: TokenPairResponse = check(resp).await?.json().await?;
        let fresh = StoredTokens::from(&pair);
        self.store.save(&fresh)?;
        let access = fresh.access_token.clone();
        *tokens = Some(fresh);
        Ok(access)
    }

    async fn replace_tokens(&self, next: Option<StoredTokens>) -> ClientResult<()> {
        let mut tokens = self.tokens.lock().await;
        match &next {
            Some(t) => self.store.save(t)?,
            None => self.store.clear()?,
        }
        *tokens = next;
        Ok(())
    }
}

/// Passes successful responses through and turns the rest into `Api` errors.
async fn check(resp: Response) -> ClientResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let raw = resp.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&raw) {
        Ok(body) => (body.code, body.error),
        Err(_) => ("unknown".to_string(), raw),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

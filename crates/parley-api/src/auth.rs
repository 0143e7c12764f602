use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use parley_types::api::{
    AuthResponse, RefreshTokenRequest, RequestCodeRequest, RequestCodeResponse, TokenPairResponse,
    VerifyCodeRequest,
};

use crate::AppState;
use crate::error::ApiError;

/// Issues a one-time code and queues it for mailing.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<RequestCodeRequest>,
) -> Result<Json<RequestCodeResponse>, ApiError> {
    state.identity.request_code(&req.email).await?;
    Ok(Json(RequestCodeResponse {
        message: "OTP sent to your mail".to_string(),
    }))
}

pub async fn verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyCodeRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let auth = state.identity.verify_code(&req.email, &req.code).await?;
    Ok(Json(auth))
}

/// Rotates the pair. The presented refresh token is spent either way.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshTokenRequest>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    let pair = state.identity.refresh(&req.refresh_token).await?;
    Ok(Json(pair))
}

pub async fn logout(
    State(state): State<AppState>,
    Json(req): Json<RefreshTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.identity.logout(&req.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

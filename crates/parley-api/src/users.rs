use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use uuid::Uuid;

use parley_types::api::{
    BulkPresenceRequest, Claims, PresenceResponse, ProfileUpdatedResponse, UpdateProfileRequest,
    UserPage,
};
use parley_types::models::{User, UserProfile};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

/// Unauthenticated. Other services call this to enrich conversation views.
pub async fn public_profile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserProfile>, ApiError> {
    Ok(Json(state.identity.public_profile(user_id).await?))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.identity.get_user(claims.sub).await?))
}

/// A rename comes back with a fresh token pair; the old access token still
/// carries the previous name until it expires.
pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<ProfileUpdatedResponse>, ApiError> {
    Ok(Json(state.identity.update_profile(claims.sub, req).await?))
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<UserPage>, ApiError> {
    Ok(Json(state.identity.list_users(query.page, query.limit).await?))
}

pub async fn search_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let users = state
        .identity
        .search_users(claims.sub, &query.q, query.limit)
        .await?;
    Ok(Json(users))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.identity.get_user(user_id).await?))
}

pub async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<PresenceResponse>, ApiError> {
    Ok(Json(state.identity.presence(user_id).await?))
}

pub async fn bulk_presence(
    State(state): State<AppState>,
    Json(req): Json<BulkPresenceRequest>,
) -> Result<Json<Vec<PresenceResponse>>, ApiError> {
    Ok(Json(state.identity.bulk_presence(req.user_ids).await?))
}

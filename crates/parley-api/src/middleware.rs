use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use parley_core::ServiceError;

use crate::AppState;
use crate::error::ApiError;

/// Extract and validate the access token from the Authorization header.
/// Verified claims are inserted as a request extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ServiceError::Unauthorized)?;

    let claims = state.identity.tokens().verify_access(token)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

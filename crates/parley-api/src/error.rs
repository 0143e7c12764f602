use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use parley_core::ServiceError;
use parley_types::api::ErrorBody;

/// HTTP face of `ServiceError`. Internal detail has already been logged by
/// the service layer, so bodies only carry the public message and code.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ServiceError::Validation(_) | ServiceError::InvalidOrExpiredCode => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = match &self.0 {
            ServiceError::DependencyUnavailable(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error,
            code: self.0.code().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

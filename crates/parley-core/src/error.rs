use std::fmt;

use parley_cache::CacheError;
use parley_queue::QueueError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Store,
    Cache,
    Queue,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Store => "store",
            Self::Cache => "cache",
            Self::Queue => "queue",
        })
    }
}

/// Failure kinds surfaced by the identity and chat services. Infrastructure
/// detail is logged where it happens and never carried in these values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("please sign in")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("too many requests, please wait before requesting another code")]
    RateLimited,
    #[error("invalid or expired code")]
    InvalidOrExpiredCode,
    #[error("{0} unavailable")]
    DependencyUnavailable(Dependency),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::RateLimited => "rate_limited",
            Self::InvalidOrExpiredCode => "invalid_or_expired_code",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
        }
    }
}

pub(crate) fn store_failure(err: anyhow::Error) -> ServiceError {
    error!("store failure: {:#}", err);
    ServiceError::DependencyUnavailable(Dependency::Store)
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        error!("credential store failure: {}", err);
        Self::DependencyUnavailable(Dependency::Cache)
    }
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        error!("work queue failure: {}", err);
        Self::DependencyUnavailable(Dependency::Queue)
    }
}

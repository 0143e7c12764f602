pub mod chat;
pub mod error;
pub mod identity;
pub mod lookup;
pub mod tokens;
pub mod validation;

use std::sync::Arc;

use parley_db::Database;

pub use chat::{ChatService, MessageHistory};
pub use error::{Dependency, ServiceError, ServiceResult};
pub use identity::IdentityService;
pub use lookup::{DbIdentityLookup, HttpIdentityLookup, IdentityLookup, LookupError};
pub use tokens::{TokenConfig, TokenService};

/// Runs a blocking store call off the async runtime. Store failures are
/// logged here and surface as `DependencyUnavailable(Store)`.
pub(crate) async fn with_db<F, T>(db: &Arc<Database>, f: F) -> ServiceResult<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            tracing::error!("spawn_blocking join error: {}", e);
            ServiceError::DependencyUnavailable(Dependency::Store)
        })?
        .map_err(error::store_failure)
}

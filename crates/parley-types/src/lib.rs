pub mod api;
pub mod events;
pub mod jobs;
pub mod models;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the object-safe store, queue and lookup traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

//! Client session controller for the Parley API and realtime gateway.

pub mod api;
pub mod controller;
pub mod error;
pub mod realtime;
pub mod store;
pub mod timeline;

pub use api::ApiClient;
pub use controller::{SessionController, SessionState};
pub use error::{ClientError, ClientResult};
pub use realtime::RealtimeConnection;
pub use store::{FileTokenStore, MemoryTokenStore, StoredTokens, TokenStore};
pub use timeline::{SendState, Timeline, TimelineEntry};

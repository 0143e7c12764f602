pub mod connection;
pub mod dispatcher;
pub mod presence;
pub mod session;
pub mod upgrade;

use std::sync::Arc;

use parley_core::{ChatService, IdentityService};

pub use dispatcher::Dispatcher;
pub use presence::{PresenceRecorder, PresenceTracker};
pub use upgrade::ws_upgrade;

/// Everything a live connection needs. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Dispatcher,
    pub presence: PresenceTracker,
    pub chat: Arc<ChatService>,
    pub identity: Arc<IdentityService>,
}

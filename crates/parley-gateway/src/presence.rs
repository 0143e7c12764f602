//! Per-user presence with connection reference counting.
//!
//! `online` is announced when a user's first connection arrives. `offline`
//! is announced only after the last connection has been gone for the grace
//! period, so a reconnect or an extra tab never produces an offline/online
//! flap. Each disconnect arms a timer tagged with a generation number; any
//! later connect bumps the generation and the stale timer does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use parley_core::{IdentityService, ServiceResult};
use parley_types::BoxFuture;
use parley_types::events::ServerEvent;
use parley_types::models::PresenceStatus;

use crate::dispatcher::Dispatcher;

/// Where presence transitions are persisted.
pub trait PresenceRecorder: Send + Sync {
    /// Going offline returns the recorded last-seen time.
    fn record(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
    ) -> BoxFuture<'_, ServiceResult<Option<DateTime<Utc>>>>;
}

impl PresenceRecorder for IdentityService {
    fn record(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
    ) -> BoxFuture<'_, ServiceResult<Option<DateTime<Utc>>>> {
        Box::pin(self.set_presence(user_id, status))
    }
}

struct UserPresence {
    connections: usize,
    generation: u64,
    announced: PresenceStatus,
}

#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    users: Mutex<HashMap<Uuid, UserPresence>>,
    grace: Duration,
    recorder: Arc<dyn PresenceRecorder>,
    dispatcher: Dispatcher,
}

impl PresenceTracker {
    pub fn new(dispatcher: Dispatcher, recorder: Arc<dyn PresenceRecorder>, grace: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                users: Mutex::new(HashMap::new()),
                grace,
                recorder,
                dispatcher,
            }),
        }
    }

    /// Users currently announced as online or away.
    pub fn snapshot(&self) -> Vec<(Uuid, PresenceStatus)> {
        let users = self.lock();
        users
            .iter()
            .filter(|(_, p)| p.announced != PresenceStatus::Offline)
            .map(|(id, p)| (*id, p.announced))
            .collect()
    }

    pub async fn connected(&self, user_id: Uuid) {
        let announce = {
            let mut users = self.lock();
            let entry = users.entry(user_id).or_insert(UserPresence {
                connections: 0,
                generation: 0,
                announced: PresenceStatus::Offline,
            });
            entry.connections += 1;
            entry.generation += 1;
            if entry.announced == PresenceStatus::Offline {
                entry.announced = PresenceStatus::Online;
                true
            } else {
                false
            }
        };

        if announce {
            self.persist_and_announce(user_id, PresenceStatus::Online).await;
        } else {
            debug!("User {} gained a connection, presence unchanged", user_id);
        }
    }

    /// Drops one connection. The offline transition, if any, happens later
    /// on a spawned timer.
    pub fn disconnected(&self, user_id: Uuid) {
        let generation = {
            let mut users = self.lock();
            let Some(entry) = users.get_mut(&user_id) else {
                return;
            };
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections > 0 {
                return;
            }
            entry.generation += 1;
            entry.generation
        };

        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.inner.grace).await;
            tracker.expire(user_id, generation).await;
        });
    }

    /// Client-driven switch between online and away while connected.
    pub async fn set_status(&self, user_id: Uuid, status: PresenceStatus) -> bool {
        if status == PresenceStatus::Offline {
            return false;
        }
        let changed = {
            let mut users = self.lock();
            match users.get_mut(&user_id) {
                Some(entry) if entry.connections > 0 && entry.announced != status => {
                    entry.announced = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist_and_announce(user_id, status).await;
        }
        changed
    }

    async fn expire(&self, user_id: Uuid, generation: u64) {
        let still_gone = {
            let mut users = self.lock();
            match users.get(&user_id) {
                Some(entry) if entry.connections == 0 && entry.generation == generation => {
                    users.remove(&user_id);
                    true
                }
                _ => false,
            }
        };
        if still_gone {
            self.persist_and_announce(user_id, PresenceStatus::Offline).await;
        }
    }

    async fn persist_and_announce(&self, user_id: Uuid, status: PresenceStatus) {
        let last_seen = match self.inner.recorder.record(user_id, status).await {
            Ok(last_seen) => last_seen,
            Err(e) => {
                // Still announce; live state should not wait on the store.
                error!("Failed to persist presence for {}: {}", user_id, e);
                (status == PresenceStatus::Offline).then(Utc::now)
            }
        };
        debug!("User {} is now {}", user_id, status.as_str());
        self.inner.dispatcher.broadcast(ServerEvent::PresenceUpdate {
            user_id,
            status,
            last_seen,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, UserPresence>> {
        self.inner
            .users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! Shared application state passed to all API handlers and entities.

use std::sync::Arc;
use std::time::Instant;

use pa_domain::config::Config;
use pa_entity::{EntityClient, EntityRuntime};
use pa_providers::ProviderRegistry;
use pa_scheduler::SchedulerCore;
use pa_storage::Storage;

use crate::runtime::channel::ChannelEntity;
use crate::runtime::session::SessionEntity;

/// Default token capacity for sessions minted by channel creation.
pub const SESSION_TOKEN_CAPACITY: u64 = 200_000;

/// Process-wide runtime handle, created once at startup and passed
/// explicitly (no ambient lookup).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Storage,
    pub providers: Arc<ProviderRegistry>,
    pub entities: Arc<EntityRuntime>,
    pub scheduler: Arc<SchedulerCore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, storage: Storage, providers: Arc<ProviderRegistry>) -> Self {
        let entities = Arc::new(EntityRuntime::new(storage.journal.clone()));
        Self {
            config,
            storage,
            providers,
            entities,
            scheduler: Arc::new(SchedulerCore::new()),
            started_at: Instant::now(),
        }
    }

    /// Client for the channel entity of `channel_id` (spawned on first use).
    pub fn channel_client(&self, channel_id: &str) -> EntityClient {
        let state = self.clone();
        let id = channel_id.to_string();
        self.entities
            .client("channel", channel_id, move || {
                Arc::new(ChannelEntity::new(state, id))
            })
    }

    /// Client for the session entity of `session_id` (spawned on first use).
    pub fn session_client(&self, session_id: &str) -> EntityClient {
        let state = self.clone();
        self.entities
            .client("session", session_id, move || {
                Arc::new(SessionEntity::new(state))
            })
    }
}

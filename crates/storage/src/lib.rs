//! Storage ports over a single SQLite database file.
//!
//! Each port is a narrow capability set; every mutating read-check sequence
//! runs inside one transaction. The storage layer owns all persisted
//! records — callers read through on every call and never cache.

pub mod agents;
pub mod channels;
pub mod cursor;
pub mod db;
pub mod governance;
pub mod journal;
pub mod memory;
pub mod migrations;
pub mod schedules;
pub mod sessions;

use std::path::Path;

use pa_domain::Result;

pub use agents::AgentStore;
pub use channels::ChannelStore;
pub use db::Db;
pub use governance::GovernanceStore;
pub use journal::{JournalEntry, JournalStatus, JournalStore};
pub use memory::MemoryStore;
pub use schedules::ScheduleStore;
pub use sessions::SessionTurnStore;

/// All storage ports over one database handle.
#[derive(Clone, Debug)]
pub struct Storage {
    pub agents: AgentStore,
    pub sessions: SessionTurnStore,
    pub governance: GovernanceStore,
    pub schedules: ScheduleStore,
    pub channels: ChannelStore,
    pub memory: MemoryStore,
    pub journal: JournalStore,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_db(Db::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_db(Db::open_in_memory()?))
    }

    fn from_db(db: Db) -> Self {
        Self {
            agents: AgentStore::new(db.clone()),
            sessions: SessionTurnStore::new(db.clone()),
            governance: GovernanceStore::new(db.clone()),
            schedules: ScheduleStore::new(db.clone()),
            channels: ChannelStore::new(db.clone()),
            memory: MemoryStore::new(db.clone()),
            journal: JournalStore::new(db),
        }
    }
}

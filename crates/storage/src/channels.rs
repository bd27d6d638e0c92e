//! Channel port: the caller-facing binding records.

use rusqlite::{params, OptionalExtension};

use pa_domain::channel::ChannelRecord;
use pa_domain::Result;

use crate::db::{db_err, enum_from_text, enum_to_text, ts_from_text, ts_to_text, Db};

#[derive(Clone, Debug)]
pub struct ChannelStore {
    db: Db,
}

impl ChannelStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Upsert a channel record.
    pub fn create(&self, record: &ChannelRecord) -> Result<()> {
        let channel_type = enum_to_text(&record.channel_type)?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO channels (channel_id, channel_type, agent_id,
                                       active_session_id, active_conversation_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(channel_id) DO UPDATE SET
                     channel_type = ?2,
                     agent_id = ?3,
                     active_session_id = ?4,
                     active_conversation_id = ?5",
                params![
                    record.channel_id,
                    channel_type,
                    record.agent_id,
                    record.active_session_id,
                    record.active_conversation_id,
                    ts_to_text(record.created_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get(&self, channel_id: &str) -> Result<Option<ChannelRecord>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT channel_id, channel_type, agent_id, active_session_id,
                        active_conversation_id, created_at
                 FROM channels WHERE channel_id = ?1",
                [channel_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .map(|(id, ty, agent, session, conv, created)| {
                Ok(ChannelRecord {
                    channel_id: id,
                    channel_type: enum_from_text(&ty)?,
                    agent_id: agent,
                    active_session_id: session,
                    active_conversation_id: conv,
                    created_at: ts_from_text(&created)?,
                })
            })
            .transpose()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;
    use chrono::{TimeZone, Utc};
    use pa_domain::channel::ChannelType;

    #[test]
    fn create_and_get_roundtrip() {
        let storage = Storage::open_in_memory().unwrap();
        let record = ChannelRecord {
            channel_id: "channel:c1".into(),
            channel_type: ChannelType::Http,
            agent_id: "agent:a1".into(),
            active_session_id: "session:channel:c1".into(),
            active_conversation_id: "conv:channel:c1".into(),
            created_at: Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap(),
        };
        storage.channels.create(&record).unwrap();
        assert_eq!(storage.channels.get("channel:c1").unwrap().unwrap(), record);
        assert!(storage.channels.get("channel:ghost").unwrap().is_none());

        // Upsert keeps the record stable.
        storage.channels.create(&record).unwrap();
        assert_eq!(storage.channels.get("channel:c1").unwrap().unwrap(), record);
    }
}

//! Memory port: substring search with keyset pagination, encode, forget.

use chrono::{DateTime, Utc};
use rusqlite::params;

use pa_domain::id::mint_memory_id;
use pa_domain::memory::{
    MemoryDraft, MemoryItem, MemorySearchPage, MemorySearchQuery, MemorySortOrder,
};
use pa_domain::Result;

use crate::cursor::Cursor;
use crate::db::{db_err, enum_from_text, enum_to_text, ts_from_text, ts_to_text, Db};

#[derive(Clone, Debug)]
pub struct MemoryStore {
    db: Db,
}

impl MemoryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Case-insensitive substring search over an agent's memory, paginated
    /// by `(created_at, rowid)` keyset. `total_count` covers all pages.
    pub fn search(&self, agent_id: &str, query: &MemorySearchQuery) -> Result<MemorySearchPage> {
        let cursor = query.cursor.as_deref().and_then(Cursor::decode);
        let limit = query.limit.clamp(1, 200);
        let needle = query.query.to_lowercase();

        self.db.with(|conn| {
            let total_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memory_items
                     WHERE agent_id = ?1
                       AND (?2 = '' OR instr(lower(content), ?2) > 0)",
                    params![agent_id, needle],
                    |row| row.get(0),
                )
                .map_err(db_err)?;

            let (comparison, order) = match query.sort {
                MemorySortOrder::CreatedAsc => (
                    "(created_at > ?3 OR (created_at = ?3 AND rowid > ?4))",
                    "ORDER BY created_at ASC, rowid ASC",
                ),
                MemorySortOrder::CreatedDesc => (
                    "(created_at < ?3 OR (created_at = ?3 AND rowid < ?4))",
                    "ORDER BY created_at DESC, rowid DESC",
                ),
            };

            let (cursor_ts, cursor_rowid) = match cursor {
                Some(c) => (
                    c.created_at().map(ts_to_text).unwrap_or_default(),
                    c.rowid,
                ),
                // ?5 = 0 disables the keyset comparison for the first page.
                None => (String::new(), 0),
            };
            let has_cursor = cursor.is_some() as i64;

            let sql = format!(
                "SELECT rowid, memory_item_id, agent_id, tier, scope, source, content,
                        metadata_json, generated_by_turn_id, session_id, sensitivity,
                        created_at, updated_at
                 FROM memory_items
                 WHERE agent_id = ?1
                   AND (?2 = '' OR instr(lower(content), ?2) > 0)
                   AND (?5 = 0 OR {comparison})
                 {order}
                 LIMIT ?6"
            );

            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![
                        agent_id,
                        needle,
                        cursor_ts,
                        cursor_rowid,
                        has_cursor,
                        (limit + 1) as i64,
                    ],
                    row_to_raw,
                )
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            let mut items = Vec::with_capacity(rows.len().min(limit));
            let mut last_key = None;
            for raw in rows.iter().take(limit) {
                let item = finish_item(raw)?;
                last_key = Some(Cursor::new(item.created_at, raw.rowid));
                items.push(item);
            }

            let next_cursor = if rows.len() > limit {
                last_key.map(|c| c.encode())
            } else {
                None
            };

            Ok(MemorySearchPage {
                items,
                cursor: next_cursor,
                total_count: total_count.max(0) as u64,
            })
        })
    }

    /// Persist new memory items; returns the minted ids in input order.
    pub fn encode(
        &self,
        agent_id: &str,
        drafts: &[MemoryDraft],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.db.with_tx(|tx| {
            let mut ids = Vec::with_capacity(drafts.len());
            for draft in drafts {
                let id = mint_memory_id();
                tx.execute(
                    "INSERT INTO memory_items
                         (memory_item_id, agent_id, tier, scope, source, content,
                          metadata_json, generated_by_turn_id, session_id, sensitivity,
                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                    params![
                        id,
                        agent_id,
                        enum_to_text(&draft.tier)?,
                        enum_to_text(&draft.scope)?,
                        enum_to_text(&draft.source)?,
                        draft.content,
                        draft.metadata_json,
                        draft.generated_by_turn_id,
                        draft.session_id,
                        enum_to_text(&draft.sensitivity)?,
                        ts_to_text(now),
                    ],
                )
                .map_err(db_err)?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    /// Delete items created before `cutoff`; returns the deleted count.
    pub fn forget(&self, agent_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        self.db.with(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM memory_items WHERE agent_id = ?1 AND created_at < ?2",
                    params![agent_id, ts_to_text(cutoff)],
                )
                .map_err(db_err)?;
            Ok(deleted as u64)
        })
    }
}

struct RawMemoryRow {
    rowid: i64,
    memory_item_id: String,
    agent_id: String,
    tier: String,
    scope: String,
    source: String,
    content: String,
    metadata_json: Option<String>,
    generated_by_turn_id: Option<String>,
    session_id: Option<String>,
    sensitivity: String,
    created_at: String,
    updated_at: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMemoryRow> {
    Ok(RawMemoryRow {
        rowid: row.get(0)?,
        memory_item_id: row.get(1)?,
        agent_id: row.get(2)?,
        tier: row.get(3)?,
        scope: row.get(4)?,
        source: row.get(5)?,
        content: row.get(6)?,
        metadata_json: row.get(7)?,
        generated_by_turn_id: row.get(8)?,
        session_id: row.get(9)?,
        sensitivity: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn finish_item(raw: &RawMemoryRow) -> Result<MemoryItem> {
    Ok(MemoryItem {
        memory_item_id: raw.memory_item_id.clone(),
        agent_id: raw.agent_id.clone(),
        tier: enum_from_text(&raw.tier)?,
        scope: enum_from_text(&raw.scope)?,
        source: enum_from_text(&raw.source)?,
        content: raw.content.clone(),
        metadata_json: raw.metadata_json.clone(),
        generated_by_turn_id: raw.generated_by_turn_id.clone(),
        session_id: raw.session_id.clone(),
        sensitivity: enum_from_text(&raw.sensitivity)?,
        created_at: ts_from_text(&raw.created_at)?,
        updated_at: ts_from_text(&raw.updated_at)?,
    })
}

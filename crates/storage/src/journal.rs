//! Workflow journal: append-only activity outcomes keyed by
//! `(execution_id, activity_name, idempotency_key)`.
//!
//! The first write for a key is the commit point; later writes are ignored
//! and replay returns the stored outcome verbatim.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use pa_domain::Result;

use crate::db::{db_err, ts_from_text, ts_to_text, Db};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalStatus {
    Complete,
    Failed,
}

impl JournalStatus {
    fn as_str(&self) -> &'static str {
        match self {
            JournalStatus::Complete => "complete",
            JournalStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub status: JournalStatus,
    pub serialized_result: Option<String>,
    pub serialized_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct JournalStore {
    db: Db,
}

impl JournalStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn lookup(
        &self,
        execution_id: &str,
        activity_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<JournalEntry>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT status, serialized_result, serialized_error, timestamp
                 FROM workflow_journal
                 WHERE execution_id = ?1 AND activity_name = ?2 AND idempotency_key = ?3",
                params![execution_id, activity_name, idempotency_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .map(|(status, result, error, ts)| {
                Ok(JournalEntry {
                    status: match status.as_str() {
                        "complete" => JournalStatus::Complete,
                        _ => JournalStatus::Failed,
                    },
                    serialized_result: result,
                    serialized_error: error,
                    timestamp: ts_from_text(&ts)?,
                })
            })
            .transpose()
        })
    }

    pub fn record_complete(
        &self,
        execution_id: &str,
        activity_name: &str,
        idempotency_key: &str,
        serialized_result: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.insert(
            execution_id,
            activity_name,
            idempotency_key,
            JournalStatus::Complete,
            Some(serialized_result),
            None,
            now,
        )
    }

    pub fn record_failure(
        &self,
        execution_id: &str,
        activity_name: &str,
        idempotency_key: &str,
        serialized_error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.insert(
            execution_id,
            activity_name,
            idempotency_key,
            JournalStatus::Failed,
            None,
            Some(serialized_error),
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        execution_id: &str,
        activity_name: &str,
        idempotency_key: &str,
        status: JournalStatus,
        serialized_result: Option<&str>,
        serialized_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with(|conn| {
            // Once written, entries are immutable.
            conn.execute(
                "INSERT OR IGNORE INTO workflow_journal
                     (execution_id, activity_name, idempotency_key, status,
                      serialized_result, serialized_error, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    execution_id,
                    activity_name,
                    idempotency_key,
                    status.as_str(),
                    serialized_result,
                    serialized_error,
                    ts_to_text(now),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

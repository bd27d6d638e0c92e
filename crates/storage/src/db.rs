//! Shared connection handle and conversion helpers.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;

use pa_domain::{Error, Result};

use crate::migrations;

/// Cloneable handle over one SQLite connection. SQLite serializes writers
/// anyway, so a single mutex-guarded connection keeps transaction scoping
/// simple.
#[derive(Clone, Debug)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::persistence(format!("opening {}: {e}", path.display())))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with(|conn| migrations::apply(conn))?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with(|conn| migrations::apply(conn))?;
        Ok(db)
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(value)
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::persistence(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Column conversions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// ISO-8601 UTC with millisecond precision; fixed width so TEXT columns
/// sort chronologically.
pub(crate) fn ts_to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_from_text(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::persistence(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn opt_ts_to_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_to_text)
}

pub(crate) fn opt_ts_from_text(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| ts_from_text(&v)).transpose()
}

/// Serialize a unit enum to its snake_case wire name for a TEXT column.
pub(crate) fn enum_to_text<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| Error::persistence("enum did not serialize to a string"))
}

pub(crate) fn enum_from_text<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| Error::persistence(format!("bad enum value {s:?}: {e}")))
}

pub(crate) fn json_to_text<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::persistence(e.to_string()))
}

pub(crate) fn json_from_text<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| Error::persistence(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pa_domain::agent::PermissionMode;

    #[test]
    fn timestamp_text_is_sortable_and_lossless() {
        let a = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap()
            + chrono::Duration::milliseconds(123);
        let b = a + chrono::Duration::milliseconds(1);
        let (ta, tb) = (ts_to_text(a), ts_to_text(b));
        assert!(ta < tb);
        assert_eq!(ts_from_text(&ta).unwrap(), a);
    }

    #[test]
    fn enum_text_roundtrip() {
        let text = enum_to_text(&PermissionMode::Restrictive).unwrap();
        assert_eq!(text, "restrictive");
        let back: PermissionMode = enum_from_text(&text).unwrap();
        assert_eq!(back, PermissionMode::Restrictive);
    }

    #[test]
    fn open_in_memory_applies_migrations() {
        let db = Db::open_in_memory().unwrap();
        let version: i64 = db
            .with(|conn| {
                conn.query_row("PRAGMA user_version", [], |row| row.get(0))
                    .map_err(db_err)
            })
            .unwrap();
        assert_eq!(version, migrations::LATEST_VERSION as i64);
    }
}

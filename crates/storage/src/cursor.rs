//! Opaque pagination cursor over `(created_at, rowid)`.
//!
//! Encoded as URL-safe base64 of `"{millis}:{rowid}"`. Malformed input
//! decodes to `None` and is treated as "no cursor".

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub created_at_millis: i64,
    pub rowid: i64,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, rowid: i64) -> Self {
        Self {
            created_at_millis: created_at.timestamp_millis(),
            rowid,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.created_at_millis)
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.created_at_millis, self.rowid))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        let (millis, rowid) = text.split_once(':')?;
        Some(Self {
            created_at_millis: millis.parse().ok()?,
            rowid: rowid.parse().ok()?,
        })
    }
}

//! Channel records — the external caller's binding to an
//! (agent, session, conversation) triple.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelType {
    #[serde(rename = "CLI")]
    Cli,
    #[serde(rename = "HTTP")]
    Http,
}

/// Exactly one channel owns one active session at a time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub agent_id: String,
    pub active_session_id: String,
    pub active_conversation_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_wire_names() {
        assert_eq!(serde_json::to_string(&ChannelType::Cli).unwrap(), "\"CLI\"");
        assert_eq!(
            serde_json::to_string(&ChannelType::Http).unwrap(),
            "\"HTTP\""
        );
        let back: ChannelType = serde_json::from_str("\"CLI\"").unwrap();
        assert_eq!(back, ChannelType::Cli);
    }
}

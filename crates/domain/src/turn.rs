//! Turn records and message content blocks.
//!
//! Turns are append-only: once written, a `TurnRecord` never mutates. One
//! user message plus its assistant response is two records sharing a
//! `turn_id` root (`turn:{uuid}` / `turn:{uuid}:assistant`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::System => "system",
            ParticipantRole::User => "user",
            ParticipantRole::Assistant => "assistant",
            ParticipantRole::Tool => "tool",
        }
    }
}

/// A typed piece of message content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: Value,
        is_error: bool,
    },
    Image {
        media_type: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        alt_text: Option<String>,
    },
}

/// The message payload carried inside a turn record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TurnMessage {
    pub message_id: String,
    pub role: ParticipantRole,
    pub content: String,
    pub content_blocks: Vec<ContentBlock>,
}

impl TurnMessage {
    /// A single-text-block message, the shape minted by the channel facade.
    pub fn text(message_id: impl Into<String>, role: ParticipantRole, content: &str) -> Self {
        Self {
            message_id: message_id.into(),
            role,
            content: content.to_string(),
            content_blocks: vec![ContentBlock::Text {
                text: content.to_string(),
            }],
        }
    }
}

/// One persisted conversation turn. `(session_id, turn_index)` is unique and
/// dense per session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TurnRecord {
    pub turn_id: String,
    pub session_id: String,
    pub conversation_id: String,
    pub turn_index: i64,
    pub participant_role: ParticipantRole,
    pub participant_agent_id: String,
    pub message: TurnMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_usage_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session context-window state: a fixed token capacity and a running count.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    pub conversation_id: String,
    pub token_capacity: u64,
    pub tokens_used: u64,
}

/// Coarse token estimate used for budget and context-window accounting.
pub fn estimate_tokens(content: &str) -> u64 {
    (content.chars().count() as u64).div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_tagged_serde() {
        let block = ContentBlock::ToolUse {
            tool_call_id: "call_1".into(),
            tool_name: "time.now".into(),
            input: serde_json::json!({}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn image_block_omits_absent_alt_text() {
        let block = ContentBlock::Image {
            media_type: "image/png".into(),
            source: "data:...".into(),
            alt_text: None,
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(!json.contains("alt_text"));
    }

    #[test]
    fn text_message_has_one_block() {
        let msg = TurnMessage::text("message:m1", ParticipantRole::User, "hello");
        assert_eq!(msg.content_blocks.len(), 1);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn token_estimate_floor() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}

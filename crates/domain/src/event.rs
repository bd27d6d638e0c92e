//! Canonical turn event union streamed to clients as SSE frames.
//!
//! Events carry a monotonic `sequence` starting at 1 within a turn. On
//! failure a single `turn.failed` with `sequence = i64::MAX` replaces the
//! tail of the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sequence value of a terminal `turn.failed` event.
pub const FAILED_SEQUENCE: i64 = i64::MAX;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "turn.started")]
    Started { sequence: i64, turn_id: String },

    /// Incremental assistant text.
    #[serde(rename = "assistant.delta")]
    AssistantDelta { sequence: i64, text: String },

    #[serde(rename = "tool.call")]
    ToolCall {
        sequence: i64,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },

    #[serde(rename = "tool.result")]
    ToolResult {
        sequence: i64,
        tool_call_id: String,
        tool_name: String,
        output: Value,
        is_error: bool,
    },

    #[serde(rename = "turn.completed")]
    Completed {
        sequence: i64,
        turn_id: String,
        accepted: bool,
        audit_reason_code: String,
    },

    #[serde(rename = "turn.failed")]
    Failed {
        sequence: i64,
        error_code: String,
        message: String,
    },
}

impl TurnEvent {
    pub fn sequence(&self) -> i64 {
        match self {
            TurnEvent::Started { sequence, .. }
            | TurnEvent::AssistantDelta { sequence, .. }
            | TurnEvent::ToolCall { sequence, .. }
            | TurnEvent::ToolResult { sequence, .. }
            | TurnEvent::Completed { sequence, .. }
            | TurnEvent::Failed { sequence, .. } => *sequence,
        }
    }

    /// The SSE `event:` field value.
    pub fn event_type(&self) -> &'static str {
        match self {
            TurnEvent::Started { .. } => "turn.started",
            TurnEvent::AssistantDelta { .. } => "assistant.delta",
            TurnEvent::ToolCall { .. } => "tool.call",
            TurnEvent::ToolResult { .. } => "tool.result",
            TurnEvent::Completed { .. } => "turn.completed",
            TurnEvent::Failed { .. } => "turn.failed",
        }
    }

    /// Terminal failure event for an error crossing the stream boundary.
    pub fn failed(err: &crate::Error) -> Self {
        TurnEvent::Failed {
            sequence: FAILED_SEQUENCE,
            error_code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_serde_tag() {
        let ev = TurnEvent::Started {
            sequence: 1,
            turn_id: "turn:t1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], ev.event_type());
        assert_eq!(json["sequence"], 1);
    }

    #[test]
    fn failed_carries_code_and_max_sequence() {
        let err = crate::Error::ChannelNotFound {
            channel_id: "channel:x".into(),
        };
        let ev = TurnEvent::failed(&err);
        assert_eq!(ev.sequence(), FAILED_SEQUENCE);
        match ev {
            TurnEvent::Failed { error_code, .. } => {
                assert_eq!(error_code, "ChannelNotFound");
            }
            _ => unreachable!(),
        }
    }
}

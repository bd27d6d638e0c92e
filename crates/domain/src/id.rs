//! Identifier minting and derivation.
//!
//! All identifiers are opaque strings carrying a type-branded prefix
//! (`agent:`, `session:`, `conv:`, `turn:`, ...). Records relate to each
//! other only through these strings, never through object references.

use uuid::Uuid;

pub const AGENT_PREFIX: &str = "agent:";
pub const SESSION_PREFIX: &str = "session:";
pub const CONVERSATION_PREFIX: &str = "conv:";
pub const TURN_PREFIX: &str = "turn:";
pub const CHANNEL_PREFIX: &str = "channel:";
pub const SCHEDULE_PREFIX: &str = "schedule:";
pub const EXECUTION_PREFIX: &str = "execution:";
pub const MESSAGE_PREFIX: &str = "message:";
pub const AUDIT_PREFIX: &str = "audit:";
pub const MEMORY_PREFIX: &str = "mem:";

/// Prepend `prefix` unless the value already carries it.
pub fn branded(prefix: &str, raw: &str) -> String {
    if raw.starts_with(prefix) {
        raw.to_string()
    } else {
        format!("{prefix}{raw}")
    }
}

pub fn mint_turn_id() -> String {
    format!("{TURN_PREFIX}{}", Uuid::new_v4())
}

pub fn mint_message_id() -> String {
    format!("{MESSAGE_PREFIX}{}", Uuid::new_v4())
}

pub fn mint_audit_id() -> String {
    format!("{AUDIT_PREFIX}{}", Uuid::new_v4())
}

pub fn mint_execution_id() -> String {
    format!("{EXECUTION_PREFIX}{}", Uuid::new_v4())
}

pub fn mint_memory_id() -> String {
    format!("{MEMORY_PREFIX}{}", Uuid::new_v4())
}

pub fn mint_schedule_id() -> String {
    format!("{SCHEDULE_PREFIX}{}", Uuid::new_v4())
}

/// The session owned by a channel: `session:{channelId}`.
pub fn session_for_channel(channel_id: &str) -> String {
    format!("{SESSION_PREFIX}{channel_id}")
}

/// The conversation owned by a channel: `conv:{channelId}`.
pub fn conversation_for_channel(channel_id: &str) -> String {
    format!("{CONVERSATION_PREFIX}{channel_id}")
}

/// The assistant half of a turn shares the user turn's root:
/// `{userTurnId}:assistant`.
pub fn assistant_turn_id(user_turn_id: &str) -> String {
    format!("{user_turn_id}:assistant")
}

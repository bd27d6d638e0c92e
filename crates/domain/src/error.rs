//! Shared error type used across all personal-agent crates.
//!
//! Every variant is a tagged kind with a stable code (the variant name,
//! exposed via [`Error::code`]). Errors cross the workflow journal and the
//! SSE boundary, so the enum is `Serialize`/`Deserialize` and `Clone`.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum Error {
    #[error("token budget exceeded for {agent_id}: requested {requested}, remaining {remaining}")]
    TokenBudgetExceeded {
        agent_id: String,
        requested: u64,
        remaining: u64,
    },

    #[error("context window exceeded: capacity {capacity}, attempted {attempted}")]
    ContextWindowExceeded { capacity: u64, attempted: u64 },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("tool quota exceeded: {remaining} invocations remaining")]
    ToolQuotaExceeded { remaining: u64 },

    #[error("sandbox violation: operation {operation} not permitted for {agent_id}")]
    SandboxViolation { agent_id: String, operation: String },

    #[error("channel not found: {channel_id}")]
    ChannelNotFound { channel_id: String },

    #[error("turn policy denied: {reason}")]
    TurnPolicyDenied { reason: String },

    #[error("turn model failure for {turn_id}: {reason}")]
    TurnModelFailure { turn_id: String, reason: String },

    #[error("mailbox full for entity {entity}")]
    MailboxFull { entity: String },

    #[error("entity {entity} is already processing message {primary_key}")]
    AlreadyProcessingMessage { entity: String, primary_key: String },

    #[error("persistence: {message}")]
    PersistenceError { message: String },

    #[error("agent profile not found: {agent_id}")]
    AgentProfileNotFound { agent_id: String },

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {message}")]
    Config { message: String },

    #[error("internal: {message}")]
    InternalServerError { message: String },
}

impl Error {
    /// Stable code for the boundary: the variant tag name.
    pub fn code(&self) -> &'static str {
        match self {
            Error::TokenBudgetExceeded { .. } => "TokenBudgetExceeded",
            Error::ContextWindowExceeded { .. } => "ContextWindowExceeded",
            Error::SessionNotFound { .. } => "SessionNotFound",
            Error::ToolQuotaExceeded { .. } => "ToolQuotaExceeded",
            Error::SandboxViolation { .. } => "SandboxViolation",
            Error::ChannelNotFound { .. } => "ChannelNotFound",
            Error::TurnPolicyDenied { .. } => "TurnPolicyDenied",
            Error::TurnModelFailure { .. } => "TurnModelFailure",
            Error::MailboxFull { .. } => "MailboxFull",
            Error::AlreadyProcessingMessage { .. } => "AlreadyProcessingMessage",
            Error::PersistenceError { .. } => "PersistenceError",
            Error::AgentProfileNotFound { .. } => "AgentProfileNotFound",
            Error::Provider { .. } => "Provider",
            Error::Config { .. } => "Config",
            Error::InternalServerError { .. } => "InternalServerError",
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Error::PersistenceError {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

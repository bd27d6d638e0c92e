//! Governance decisions and their durable audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    RequireApproval,
}

/// The action a policy evaluation is asked about.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    ReadMemory,
    InvokeTool,
}

/// Input to `evaluate_policy`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyInput {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub action: PolicyAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// A durable record of one governance decision. Idempotent on its id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub audit_entry_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub decision: PolicyDecision,
    /// Opaque reason code, e.g. `turn_processing_accepted`.
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        agent_id: impl Into<String>,
        session_id: Option<String>,
        decision: PolicyDecision,
        reason: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            audit_entry_id: crate::id::mint_audit_id(),
            agent_id: agent_id.into(),
            session_id,
            decision,
            reason: reason.into(),
            created_at,
        }
    }
}

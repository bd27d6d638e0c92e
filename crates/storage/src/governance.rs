//! Governance port: policy evaluation, tool quotas, sandboxing, and the
//! audit trail.

use chrono::{DateTime, Utc};
use rusqlite::params;

use pa_domain::agent::PermissionMode;
use pa_domain::audit::{AuditEntry, PolicyAction, PolicyDecision, PolicyInput};
use pa_domain::{Error, Result};

use crate::db::{db_err, enum_from_text, enum_to_text, ts_from_text, ts_to_text, Db};

/// Tools the runtime ships with; `Standard` agents may invoke these without
/// approval.
pub const BUILTIN_TOOLS: &[&str] = &["time.now", "math.calculate", "echo.text"];

/// Operations a `Restrictive` agent may still perform under the sandbox.
pub const SANDBOX_ALLOWLIST: &[&str] = &["clock", "calculator", "echo"];

/// Per-tool invocations allowed per agent per UTC day.
pub const TOOL_DAILY_QUOTA: u64 = 200;

#[derive(Clone, Debug)]
pub struct GovernanceStore {
    db: Db,
}

impl GovernanceStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Decide an action for an agent from its permission mode.
    ///
    /// Agents without persisted state are treated as `Standard` (the
    /// bootstrap default) so policy stays decidable before first contact.
    pub fn evaluate_policy(&self, input: &PolicyInput) -> Result<PolicyDecision> {
        let mode = self.permission_mode(&input.agent_id)?;

        let decision = match (mode, input.action) {
            (PermissionMode::Permissive, _) => PolicyDecision::Allow,
            (PermissionMode::Standard, PolicyAction::ReadMemory) => PolicyDecision::Allow,
            (PermissionMode::Standard, PolicyAction::InvokeTool) => {
                let known = input
                    .tool_name
                    .as_deref()
                    .map(|t| BUILTIN_TOOLS.contains(&t))
                    .unwrap_or(false);
                if known {
                    PolicyDecision::Allow
                } else {
                    PolicyDecision::RequireApproval
                }
            }
            (PermissionMode::Restrictive, PolicyAction::ReadMemory) => {
                PolicyDecision::RequireApproval
            }
            (PermissionMode::Restrictive, _) => PolicyDecision::Deny,
        };

        Ok(decision)
    }

    /// Enforce the per-tool daily quota. Returns the remaining allowance
    /// after this call succeeds.
    pub fn check_tool_quota(
        &self,
        agent_id: &str,
        tool_name: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or(now);
        let reason = format!("tool_invoked:{tool_name}");

        let used: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM audit_entries
                 WHERE agent_id = ?1 AND reason = ?2 AND created_at >= ?3",
                params![agent_id, reason, ts_to_text(day_start)],
                |row| row.get(0),
            )
            .map_err(db_err)
        })?;

        let used = used.max(0) as u64;
        if used >= TOOL_DAILY_QUOTA {
            return Err(Error::ToolQuotaExceeded { remaining: 0 });
        }
        Ok(TOOL_DAILY_QUOTA - used)
    }

    /// Durably record a governance decision. Idempotent on the entry id.
    pub fn write_audit(&self, entry: &AuditEntry) -> Result<()> {
        let decision = enum_to_text(&entry.decision)?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO audit_entries
                     (audit_entry_id, agent_id, session_id, decision, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.audit_entry_id,
                    entry.agent_id,
                    entry.session_id,
                    decision,
                    entry.reason,
                    ts_to_text(entry.created_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Recent audit entries for an agent, newest first.
    pub fn list_audits(&self, agent_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT audit_entry_id, agent_id, session_id, decision, reason, created_at
                     FROM audit_entries WHERE agent_id = ?1
                     ORDER BY created_at DESC, audit_entry_id DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![agent_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            rows.into_iter()
                .map(|(id, agent, session, decision, reason, created)| {
                    Ok(AuditEntry {
                        audit_entry_id: id,
                        agent_id: agent,
                        session_id: session,
                        decision: enum_from_text(&decision)?,
                        reason,
                        created_at: ts_from_text(&created)?,
                    })
                })
                .collect()
        })
    }

    /// Count audit rows matching an exact reason for an agent.
    pub fn count_audits_with_reason(&self, agent_id: &str, reason: &str) -> Result<u64> {
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM audit_entries WHERE agent_id = ?1 AND reason = ?2",
                params![agent_id, reason],
                |row| row.get(0),
            )
            .map_err(db_err)
        })?;
        Ok(count.max(0) as u64)
    }

    /// Run `operation` under the agent's sandbox. `Restrictive` agents may
    /// only perform allowlisted operations; anything else raises
    /// `SandboxViolation` without running the effect.
    pub fn enforce_sandbox<T>(
        &self,
        agent_id: &str,
        operation: &str,
        effect: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let mode = self.permission_mode(agent_id)?;
        if mode == PermissionMode::Restrictive && !SANDBOX_ALLOWLIST.contains(&operation) {
            return Err(Error::SandboxViolation {
                agent_id: agent_id.to_string(),
                operation: operation.to_string(),
            });
        }
        effect()
    }

    fn permission_mode(&self, agent_id: &str) -> Result<PermissionMode> {
        let mode: Option<String> = self.db.with(|conn| {
            use rusqlite::OptionalExtension;
            conn.query_row(
                "SELECT permission_mode FROM agents WHERE agent_id = ?1",
                [agent_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
        })?;
        match mode {
            Some(text) => enum_from_text(&text),
            None => Ok(PermissionMode::Standard),
        }
    }
}

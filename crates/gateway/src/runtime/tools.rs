//! Governed tool dispatch.
//!
//! Every invocation runs the full wrap: policy check, quota check,
//! sandboxed effect, audit. Failures never propagate as errors — they
//! become typed tool results (`is_error = true`) so the model can react.

use chrono::Utc;
use serde_json::Value;

use pa_domain::audit::{AuditEntry, PolicyAction, PolicyDecision, PolicyInput};
use pa_domain::tool::ToolCall;
use pa_domain::{Error, Result};
use pa_tools::BuiltinTool;

use crate::runtime::workflow::TurnRequest;
use crate::state::AppState;

/// Dispatch one tool call under governance. Returns `(output, is_error)`.
pub async fn dispatch_tool(state: &AppState, req: &TurnRequest, call: &ToolCall) -> (Value, bool) {
    match dispatch_inner(state, req, call) {
        Ok(output) => (output, false),
        Err(err) => {
            tracing::debug!(
                tool = %call.tool_name,
                code = err.code(),
                "tool invocation failed"
            );
            (
                serde_json::json!({
                    "error": err.code(),
                    "message": err.to_string(),
                }),
                true,
            )
        }
    }
}

fn dispatch_inner(state: &AppState, req: &TurnRequest, call: &ToolCall) -> Result<Value> {
    let tool_name = call.tool_name.as_str();
    let now = Utc::now();

    // ── 1. Policy ────────────────────────────────────────────────────
    let decision = state.storage.governance.evaluate_policy(&PolicyInput {
        agent_id: req.agent_id.clone(),
        session_id: Some(req.session_id.clone()),
        action: PolicyAction::InvokeTool,
        tool_name: Some(tool_name.to_string()),
    })?;
    match decision {
        PolicyDecision::Allow => {}
        PolicyDecision::Deny => {
            write_tool_audit(
                state,
                req,
                call,
                PolicyDecision::Deny,
                &format!("tool_policy_denied:{tool_name}"),
            )?;
            return Err(Error::TurnPolicyDenied {
                reason: format!("tool_policy_denied:{tool_name}"),
            });
        }
        PolicyDecision::RequireApproval => {
            write_tool_audit(
                state,
                req,
                call,
                PolicyDecision::RequireApproval,
                &format!("tool_requires_approval:{tool_name}"),
            )?;
            return Err(Error::TurnPolicyDenied {
                reason: format!("tool_requires_approval:{tool_name}"),
            });
        }
    }

    // ── 2. Quota ─────────────────────────────────────────────────────
    if let Err(err) = state
        .storage
        .governance
        .check_tool_quota(&req.agent_id, tool_name, now)
    {
        write_tool_audit(
            state,
            req,
            call,
            PolicyDecision::Deny,
            &format!("tool_quota_exceeded:{tool_name}"),
        )?;
        return Err(err);
    }

    // ── 3. Effect (sandboxed) ────────────────────────────────────────
    let tool = BuiltinTool::from_name(tool_name).ok_or_else(|| Error::InternalServerError {
        message: format!("unknown tool {tool_name}"),
    });
    let outcome = tool.and_then(|tool| {
        state
            .storage
            .governance
            .enforce_sandbox(&req.agent_id, tool.sandbox_operation(), || {
                tool.execute(&call.arguments, now)
            })
    });

    // ── 4. Audit ─────────────────────────────────────────────────────
    match outcome {
        Ok(output) => {
            write_tool_audit(
                state,
                req,
                call,
                PolicyDecision::Allow,
                &format!("tool_invoked:{tool_name}"),
            )?;
            Ok(output)
        }
        Err(err) => {
            write_tool_audit(
                state,
                req,
                call,
                PolicyDecision::Deny,
                &format!("tool_execution_failed:{tool_name}:{}", err.code()),
            )?;
            Err(err)
        }
    }
}

/// Tool audits key on `(turn, call, reason)` so workflow replays and
/// retries never duplicate rows.
fn write_tool_audit(
    state: &AppState,
    req: &TurnRequest,
    call: &ToolCall,
    decision: PolicyDecision,
    reason: &str,
) -> Result<()> {
    state.storage.governance.write_audit(&AuditEntry {
        audit_entry_id: format!("audit:{}:{}:{reason}", req.turn_id, call.call_id),
        agent_id: req.agent_id.clone(),
        session_id: Some(req.session_id.clone()),
        decision,
        reason: reason.to_string(),
        created_at: req.created_at,
    })
}

//! The turn-processing workflow.
//!
//! Each step is a journalled activity keyed by
//! `(workflow:{sessionId}, activityName, turnId)`. Before an activity's
//! effect runs, the journal is consulted; a recorded outcome replays
//! without side effects, which makes every step exactly-once across
//! restarts and makes the whole workflow idempotent per `turn_id`.

use std::future::Future;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use pa_domain::agent::AgentState;
use pa_domain::audit::{AuditEntry, PolicyAction, PolicyDecision, PolicyInput};
use pa_domain::event::TurnEvent;
use pa_domain::id;
use pa_domain::stream::{ModelOutput, ModelPart, StreamEvent, Usage};
use pa_domain::tool::{ChatMessage, ToolCall};
use pa_domain::turn::{
    estimate_tokens, ContentBlock, ParticipantRole, TurnMessage, TurnRecord,
};
use pa_domain::{Error, Result};
use pa_providers::ChatRequest;
use pa_storage::{JournalStatus, JournalStore};

use crate::runtime::tools::dispatch_tool;
use crate::state::AppState;

/// Maximum model/tool round-trips before the turn is force-stopped.
const MAX_TOOL_LOOPS: usize = 8;

pub const REASON_ACCEPTED: &str = "turn_processing_accepted";
pub const REASON_POLICY_DENIED: &str = "turn_processing_policy_denied";
pub const REASON_REQUIRES_APPROVAL: &str = "turn_processing_requires_approval";
pub const REASON_BUDGET_EXCEEDED: &str = "turn_processing_token_budget_exceeded";
pub const REASON_MODEL_ERROR: &str = "turn_processing_model_error";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input / result shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRequest {
    pub turn_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub conversation_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessTurnResult {
    pub turn_id: String,
    pub accepted: bool,
    pub audit_reason_code: String,
    pub assistant_content: String,
    pub assistant_content_blocks: Vec<ContentBlock>,
    pub model_finish_reason: Option<String>,
    pub model_usage_json: Option<String>,
}

/// Journal execution id for a session's turn workflow.
pub fn workflow_execution_id(session_id: &str) -> String {
    format!("workflow:{session_id}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Activity fold
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replay-or-run one activity. The journal write is the commit point:
/// a crash before it re-runs the effect, a crash after it replays the
/// recorded outcome.
async fn run_activity<T, F, Fut>(
    journal: &JournalStore,
    execution_id: &str,
    name: &str,
    idempotency_key: &str,
    effect: F,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Some(entry) = journal.lookup(execution_id, name, idempotency_key)? {
        tracing::debug!(execution_id, activity = name, idempotency_key, "activity replayed");
        return match entry.status {
            JournalStatus::Complete => {
                let raw = entry.serialized_result.unwrap_or_else(|| "null".into());
                serde_json::from_str(&raw)
                    .map_err(|e| Error::persistence(format!("activity replay {name}: {e}")))
            }
            JournalStatus::Failed => {
                let raw = entry.serialized_error.unwrap_or_default();
                Err(
                    serde_json::from_str::<Error>(&raw).unwrap_or(Error::InternalServerError {
                        message: format!("journalled failure in {name}"),
                    }),
                )
            }
        };
    }

    match effect().await {
        Ok(value) => {
            let serialized =
                serde_json::to_string(&value).map_err(|e| Error::persistence(e.to_string()))?;
            journal.record_complete(
                execution_id,
                name,
                idempotency_key,
                &serialized,
                Utc::now(),
            )?;
            Ok(value)
        }
        Err(err) => {
            let serialized =
                serde_json::to_string(&err).map_err(|e| Error::persistence(e.to_string()))?;
            journal.record_failure(
                execution_id,
                name,
                idempotency_key,
                &serialized,
                Utc::now(),
            )?;
            Err(err)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// process_turn — the workflow body
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn: policy, budget, persist user turn, model, persist
/// assistant turn, audit. Running twice with the same `turn_id` yields an
/// identical result and no duplicate rows.
pub async fn process_turn(state: &AppState, req: &TurnRequest) -> Result<ProcessTurnResult> {
    let journal = &state.storage.journal;
    let execution_id = workflow_execution_id(&req.session_id);
    let input_tokens = estimate_tokens(&req.content);

    // ── 1. EvaluatePolicy ────────────────────────────────────────────
    let decision: PolicyDecision = run_activity(
        journal,
        &execution_id,
        "EvaluatePolicy",
        &req.turn_id,
        || async {
            state.storage.governance.evaluate_policy(&PolicyInput {
                agent_id: req.agent_id.clone(),
                session_id: Some(req.session_id.clone()),
                action: PolicyAction::ReadMemory,
                tool_name: None,
            })
        },
    )
    .await?;

    match decision {
        PolicyDecision::Allow => {}
        PolicyDecision::Deny => {
            write_turn_audit(state, req, PolicyDecision::Deny, REASON_POLICY_DENIED)?;
            return Err(Error::TurnPolicyDenied {
                reason: REASON_POLICY_DENIED.into(),
            });
        }
        PolicyDecision::RequireApproval => {
            write_turn_audit(
                state,
                req,
                PolicyDecision::RequireApproval,
                REASON_REQUIRES_APPROVAL,
            )?;
            return Err(Error::TurnPolicyDenied {
                reason: REASON_REQUIRES_APPROVAL.into(),
            });
        }
    }

    // ── 2. CheckTokenBudget ──────────────────────────────────────────
    let budget: Result<AgentState> = run_activity(
        journal,
        &execution_id,
        "CheckTokenBudget",
        &req.turn_id,
        || async {
            state
                .storage
                .agents
                .consume_token_budget(&req.agent_id, input_tokens, req.created_at)
        },
    )
    .await;
    if let Err(err) = budget {
        write_turn_audit(state, req, PolicyDecision::Deny, REASON_BUDGET_EXCEEDED)?;
        return Err(err);
    }

    // ── 3. PersistUserTurn ───────────────────────────────────────────
    // Errors (SessionNotFound, ContextWindowExceeded) surface as-is.
    run_activity::<TurnRecord, _, _>(
        journal,
        &execution_id,
        "PersistUserTurn",
        &req.turn_id,
        || async {
            state
                .storage
                .sessions
                .update_context_window(&req.session_id, input_tokens as i64)?;
            state.storage.sessions.append_turn(&TurnRecord {
                turn_id: req.turn_id.clone(),
                session_id: req.session_id.clone(),
                conversation_id: req.conversation_id.clone(),
                turn_index: 0,
                participant_role: ParticipantRole::User,
                participant_agent_id: req.agent_id.clone(),
                message: TurnMessage::text(
                    id::branded(id::MESSAGE_PREFIX, &req.turn_id),
                    ParticipantRole::User,
                    &req.content,
                ),
                model_finish_reason: None,
                model_usage_json: None,
                created_at: req.created_at,
            })
        },
    )
    .await?;

    // ── 4. InvokeModel ───────────────────────────────────────────────
    let model_output: ModelOutput = match run_activity(
        journal,
        &execution_id,
        "InvokeModel",
        &req.turn_id,
        || invoke_model(state, req),
    )
    .await
    {
        Ok(output) => output,
        Err(err) => {
            write_turn_audit(state, req, PolicyDecision::Deny, REASON_MODEL_ERROR)?;
            return Err(match err {
                failure @ Error::TurnModelFailure { .. } => failure,
                other => Error::TurnModelFailure {
                    turn_id: req.turn_id.clone(),
                    reason: other.to_string(),
                },
            });
        }
    };

    // ── 5. Convert parts to content blocks ───────────────────────────
    let assistant_blocks = parts_to_blocks(&model_output.parts);
    let model_usage_json = model_output
        .usage
        .as_ref()
        .and_then(|u| serde_json::to_string(u).ok());

    // ── 6. PersistAssistantTurn ──────────────────────────────────────
    let assistant_turn_id = id::assistant_turn_id(&req.turn_id);
    run_activity::<TurnRecord, _, _>(
        journal,
        &execution_id,
        "PersistAssistantTurn",
        &req.turn_id,
        || async {
            state.storage.sessions.append_turn(&TurnRecord {
                turn_id: assistant_turn_id.clone(),
                session_id: req.session_id.clone(),
                conversation_id: req.conversation_id.clone(),
                turn_index: 0,
                participant_role: ParticipantRole::Assistant,
                participant_agent_id: req.agent_id.clone(),
                message: TurnMessage {
                    message_id: id::branded(id::MESSAGE_PREFIX, &assistant_turn_id),
                    role: ParticipantRole::Assistant,
                    content: model_output.text.clone(),
                    content_blocks: assistant_blocks.clone(),
                },
                model_finish_reason: model_output.finish_reason.clone(),
                model_usage_json: model_usage_json.clone(),
                created_at: req.created_at,
            })
        },
    )
    .await?;

    // ── 7. WriteAudit (accept) ───────────────────────────────────────
    run_activity::<String, _, _>(
        journal,
        &execution_id,
        "WriteAuditAccept",
        &req.turn_id,
        || async {
            write_turn_audit(state, req, PolicyDecision::Allow, REASON_ACCEPTED)?;
            Ok(REASON_ACCEPTED.to_string())
        },
    )
    .await?;

    // ── 8. Result ────────────────────────────────────────────────────
    Ok(ProcessTurnResult {
        turn_id: req.turn_id.clone(),
        accepted: true,
        audit_reason_code: REASON_ACCEPTED.into(),
        assistant_content: model_output.text,
        assistant_content_blocks: assistant_blocks,
        model_finish_reason: model_output.finish_reason,
        model_usage_json,
    })
}

/// Audit writes tied to a turn use a deterministic id so workflow replays
/// never duplicate rows.
fn write_turn_audit(
    state: &AppState,
    req: &TurnRequest,
    decision: PolicyDecision,
    reason: &str,
) -> Result<()> {
    state.storage.governance.write_audit(&AuditEntry {
        audit_entry_id: format!("audit:{}:{reason}", req.turn_id),
        agent_id: req.agent_id.clone(),
        session_id: Some(req.session_id.clone()),
        decision,
        reason: reason.to_string(),
        created_at: req.created_at,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model invocation (tool loop)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Call the model with the session history and the governed toolkit,
/// dispatching tool calls until the model stops asking for them.
async fn invoke_model(state: &AppState, req: &TurnRequest) -> Result<ModelOutput> {
    let resolved = state.providers.resolve(&req.agent_id)?;
    let generation = &resolved.profile.generation;

    // Read-through: the chat history is rebuilt from persisted turns on
    // every call, with the persona's system prompt injected up front.
    let history = state.storage.sessions.list_turns(&req.session_id)?;
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(&resolved.profile.persona.system_prompt));
    for turn in &history {
        append_history_messages(&mut messages, turn);
    }

    let tool_defs = pa_tools::definitions();
    let mut parts: Vec<ModelPart> = Vec::new();
    let mut text_acc = String::new();
    let mut total_usage: Option<Usage> = None;
    let mut finish_reason: Option<String> = None;

    for loop_idx in 0..MAX_TOOL_LOOPS {
        tracing::debug!(turn_id = %req.turn_id, loop_idx, "model loop iteration");
        let chat_req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: Some(generation.temperature),
            max_tokens: Some(generation.max_output_tokens),
            top_p: generation.top_p,
            seed: generation.seed,
            model: Some(resolved.model_id.clone()),
        };

        let mut stream = resolved.provider.chat_stream(chat_req).await?;

        let mut text_buf = String::new();
        let mut pending_calls: Vec<ToolCall> = Vec::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Token { text } => text_buf.push_str(&text),
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => pending_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                }),
                StreamEvent::Done {
                    usage,
                    finish_reason: reason,
                } => {
                    if let Some(usage) = usage {
                        total_usage
                            .get_or_insert_with(Usage::default)
                            .accumulate(&usage);
                    }
                    if reason.is_some() {
                        finish_reason = reason;
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(Error::TurnModelFailure {
                        turn_id: req.turn_id.clone(),
                        reason: message,
                    })
                }
            }
        }

        if !text_buf.is_empty() {
            parts.push(ModelPart::Text {
                text: text_buf.clone(),
            });
            if !text_acc.is_empty() {
                text_acc.push('\n');
            }
            text_acc.push_str(&text_buf);
        }

        if pending_calls.is_empty() {
            break;
        }

        // ── Tool dispatch ────────────────────────────────────────────
        messages.push(ChatMessage::assistant_tool_calls(
            &text_buf,
            pending_calls.clone(),
        ));
        for call in &pending_calls {
            parts.push(ModelPart::ToolCall {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });

            let (output, is_error) = dispatch_tool(state, req, call).await;
            parts.push(ModelPart::ToolResult {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                output: output.clone(),
                is_error,
            });
            let rendered = match &output {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            messages.push(ChatMessage::tool_result(&call.call_id, &rendered));
        }

        if loop_idx == MAX_TOOL_LOOPS - 1 {
            return Err(Error::TurnModelFailure {
                turn_id: req.turn_id.clone(),
                reason: format!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"),
            });
        }
    }

    Ok(ModelOutput {
        text: text_acc,
        parts,
        finish_reason,
        usage: total_usage,
    })
}

/// Map one persisted turn to provider chat messages.
fn append_history_messages(messages: &mut Vec<ChatMessage>, turn: &TurnRecord) {
    match turn.participant_role {
        ParticipantRole::System => messages.push(ChatMessage::system(&turn.message.content)),
        ParticipantRole::User => messages.push(ChatMessage::user(&turn.message.content)),
        ParticipantRole::Assistant | ParticipantRole::Tool => {
            let mut tool_calls = Vec::new();
            let mut tool_results = Vec::new();
            for block in &turn.message.content_blocks {
                match block {
                    ContentBlock::ToolUse {
                        tool_call_id,
                        tool_name,
                        input,
                    } => tool_calls.push(ToolCall {
                        call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: input.clone(),
                    }),
                    ContentBlock::ToolResult {
                        tool_call_id,
                        output,
                        ..
                    } => tool_results.push((tool_call_id.clone(), output.to_string())),
                    ContentBlock::Text { .. } | ContentBlock::Image { .. } => {}
                }
            }
            if turn.participant_role == ParticipantRole::Assistant {
                if tool_calls.is_empty() {
                    messages.push(ChatMessage::assistant(&turn.message.content));
                } else {
                    messages.push(ChatMessage::assistant_tool_calls(
                        &turn.message.content,
                        tool_calls,
                    ));
                }
            }
            for (call_id, rendered) in tool_results {
                messages.push(ChatMessage::tool_result(&call_id, &rendered));
            }
        }
    }
}

/// Step 5: model parts become domain content blocks. Unknown part kinds
/// and non-image files are dropped.
pub fn parts_to_blocks(parts: &[ModelPart]) -> Vec<ContentBlock> {
    let mut blocks = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            ModelPart::Text { text } => blocks.push(ContentBlock::Text { text: text.clone() }),
            ModelPart::ToolCall {
                call_id,
                tool_name,
                input,
            } => blocks.push(ContentBlock::ToolUse {
                tool_call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                input: input.clone(),
            }),
            ModelPart::ToolResult {
                call_id,
                tool_name,
                output,
                is_error,
            } => blocks.push(ContentBlock::ToolResult {
                tool_call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                output: output.clone(),
                is_error: *is_error,
            }),
            ModelPart::File { media_type, data } => {
                if media_type.starts_with("image/") {
                    blocks.push(ContentBlock::Image {
                        media_type: media_type.clone(),
                        source: data.clone(),
                        alt_text: None,
                    });
                }
            }
        }
    }
    blocks
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming projection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert a completed result into the canonical event sequence:
/// `turn.started`, one event per content block (images dropped), then
/// `turn.completed`. `sequence` starts at 1 and is strictly increasing.
pub fn project_events(result: &ProcessTurnResult) -> Vec<TurnEvent> {
    let mut events = Vec::with_capacity(result.assistant_content_blocks.len() + 2);
    let mut sequence = 1;

    events.push(TurnEvent::Started {
        sequence,
        turn_id: result.turn_id.clone(),
    });

    for block in &result.assistant_content_blocks {
        let event = match block {
            ContentBlock::Text { text } => TurnEvent::AssistantDelta {
                sequence: sequence + 1,
                text: text.clone(),
            },
            ContentBlock::ToolUse {
                tool_call_id,
                tool_name,
                input,
            } => TurnEvent::ToolCall {
                sequence: sequence + 1,
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                input: input.clone(),
            },
            ContentBlock::ToolResult {
                tool_call_id,
                tool_name,
                output,
                is_error,
            } => TurnEvent::ToolResult {
                sequence: sequence + 1,
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                output: output.clone(),
                is_error: *is_error,
            },
            // Images are dropped from the stream.
            ContentBlock::Image { .. } => continue,
        };
        sequence += 1;
        events.push(event);
    }

    events.push(TurnEvent::Completed {
        sequence: sequence + 1,
        turn_id: result.turn_id.clone(),
        accepted: result.accepted,
        audit_reason_code: result.audit_reason_code.clone(),
    });

    events
}

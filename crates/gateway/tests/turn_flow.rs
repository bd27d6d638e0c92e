//! End-to-end turn processing: the happy path, idempotent re-runs,
//! budget denial, and governed tool calls.

mod common;

use chrono::Utc;

use pa_domain::agent::AgentState;
use pa_domain::event::{TurnEvent, FAILED_SEQUENCE};
use pa_domain::turn::{estimate_tokens, ContentBlock, ParticipantRole};
use pa_domain::Error;
use pa_gateway::runtime::{process_turn, project_events, TurnRequest};
use pa_providers::mock::ScriptedResponse;

use common::{start_session, state_with_script, state_with_text};

fn request(turn_id: &str, agent_id: &str, session_id: &str, content: &str) -> TurnRequest {
    TurnRequest {
        turn_id: turn_id.into(),
        agent_id: agent_id.into(),
        session_id: session_id.into(),
        conversation_id: format!("conv:{session_id}"),
        content: content.into(),
        created_at: Utc::now(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: happy turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_turn_persists_both_halves_and_audits() {
    let state = state_with_text("Hello! How can I help?");
    let mut agent = AgentState::bootstrap("agent:a1");
    agent.token_budget = 200;
    state.storage.agents.upsert(&agent).unwrap();
    start_session(&state, "session:s1", 500);

    let req = request("turn:t1", "agent:a1", "session:s1", "hello");
    let result = process_turn(&state, &req).await.unwrap();

    assert!(result.accepted);
    assert_eq!(result.audit_reason_code, "turn_processing_accepted");
    assert_eq!(result.assistant_content, "Hello! How can I help?");

    // Events: started(1) -> delta(2) -> completed(3).
    let events = project_events(&result);
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(kinds, vec!["turn.started", "assistant.delta", "turn.completed"]);
    let sequences: Vec<i64> = events.iter().map(|e| e.sequence()).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    // Budget charged with the input estimate.
    let agent = state.storage.agents.get("agent:a1").unwrap().unwrap();
    assert_eq!(agent.tokens_consumed, estimate_tokens("hello"));

    // Two turns: user then assistant, dense indices.
    let turns = state.storage.sessions.list_turns("session:s1").unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].participant_role, ParticipantRole::User);
    assert_eq!(turns[0].turn_index, 0);
    assert_eq!(turns[1].participant_role, ParticipantRole::Assistant);
    assert_eq!(turns[1].turn_index, 1);
    assert_eq!(turns[1].turn_id, "turn:t1:assistant");
    assert!(turns[1].model_usage_json.is_some());

    // Exactly one accept audit.
    assert_eq!(
        state
            .storage
            .governance
            .count_audits_with_reason("agent:a1", "turn_processing_accepted")
            .unwrap(),
        1
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: idempotent turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn rerunning_a_turn_replays_without_duplicate_effects() {
    let state = state_with_script(vec![
        ScriptedResponse::Text("first answer".into()),
        // If the workflow wrongly re-ran the model, this would surface.
        ScriptedResponse::Text("second answer".into()),
    ]);
    state
        .storage
        .agents
        .upsert(&AgentState::bootstrap("agent:a1"))
        .unwrap();
    start_session(&state, "session:s1", 500);

    let req = request("turn:t1", "agent:a1", "session:s1", "hello");
    let first = process_turn(&state, &req).await.unwrap();
    let consumed_after_first = state
        .storage
        .agents
        .get("agent:a1")
        .unwrap()
        .unwrap()
        .tokens_consumed;

    let second = process_turn(&state, &req).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.assistant_content, "first answer");

    // No duplicate rows, no double billing.
    assert_eq!(state.storage.sessions.list_turns("session:s1").unwrap().len(), 2);
    let agent = state.storage.agents.get("agent:a1").unwrap().unwrap();
    assert_eq!(agent.tokens_consumed, consumed_after_first);
    assert_eq!(
        state
            .storage
            .governance
            .count_audits_with_reason("agent:a1", "turn_processing_accepted")
            .unwrap(),
        1
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: budget exceeded
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn budget_exceeded_denies_before_any_persistence() {
    let state = state_with_text("never used");
    let mut agent = AgentState::bootstrap("agent:a2");
    agent.token_budget = 10;
    agent.tokens_consumed = 5;
    state.storage.agents.upsert(&agent).unwrap();
    start_session(&state, "session:s2", 500);

    // 400 chars ≈ 100 tokens, far over the 5 remaining.
    let req = request("turn:t2", "agent:a2", "session:s2", &"x".repeat(400));
    let err = process_turn(&state, &req).await.unwrap_err();
    assert_eq!(
        err,
        Error::TokenBudgetExceeded {
            agent_id: "agent:a2".into(),
            requested: 100,
            remaining: 5,
        }
    );

    // No user turn appended; context window untouched.
    assert!(state.storage.sessions.list_turns("session:s2").unwrap().is_empty());
    let session = state
        .storage
        .sessions
        .get_session("session:s2")
        .unwrap()
        .unwrap();
    assert_eq!(session.tokens_used, 0);

    // One denial audit.
    assert_eq!(
        state
            .storage
            .governance
            .count_audits_with_reason("agent:a2", "turn_processing_token_budget_exceeded")
            .unwrap(),
        1
    );

    // Replaying the failure changes nothing.
    let err2 = process_turn(&state, &req).await.unwrap_err();
    assert_eq!(err, err2);
    assert_eq!(
        state
            .storage
            .governance
            .count_audits_with_reason("agent:a2", "turn_processing_token_budget_exceeded")
            .unwrap(),
        1
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Governed tool calls
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_call_turn_emits_call_and_result_events() {
    let state = state_with_script(vec![
        ScriptedResponse::ToolCall {
            call_id: "call_1".into(),
            tool_name: "echo.text".into(),
            arguments: serde_json::json!({ "text": "ping" }),
        },
        ScriptedResponse::Text("the echo said ping".into()),
    ]);
    state
        .storage
        .agents
        .upsert(&AgentState::bootstrap("agent:a1"))
        .unwrap();
    start_session(&state, "session:s1", 500);

    let req = request("turn:t1", "agent:a1", "session:s1", "please echo ping");
    let result = process_turn(&state, &req).await.unwrap();

    let kinds: Vec<&str> = project_events(&result)
        .iter()
        .map(|e| e.event_type())
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            "turn.started",
            "tool.call",
            "tool.result",
            "assistant.delta",
            "turn.completed",
        ]
    );

    // Tool result content survives into the assistant turn blocks.
    let has_result = result.assistant_content_blocks.iter().any(|b| matches!(
        b,
        ContentBlock::ToolResult { output, is_error: false, .. } if output == "ping"
    ));
    assert!(has_result, "blocks: {:?}", result.assistant_content_blocks);

    // Governance wrapped the invocation: one success audit.
    assert_eq!(
        state
            .storage
            .governance
            .count_audits_with_reason("agent:a1", "tool_invoked:echo.text")
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn unknown_tool_requires_approval_and_fails_closed() {
    let state = state_with_script(vec![
        ScriptedResponse::ToolCall {
            call_id: "call_1".into(),
            tool_name: "shell.exec".into(),
            arguments: serde_json::json!({ "command": "rm -rf /" }),
        },
        ScriptedResponse::Text("understood, I cannot do that".into()),
    ]);
    state
        .storage
        .agents
        .upsert(&AgentState::bootstrap("agent:a1"))
        .unwrap();
    start_session(&state, "session:s1", 500);

    let req = request("turn:t1", "agent:a1", "session:s1", "run a command");
    let result = process_turn(&state, &req).await.unwrap();

    // The tool result is a typed failure, not a crash.
    let errored = result.assistant_content_blocks.iter().any(|b| {
        matches!(b, ContentBlock::ToolResult { is_error: true, .. })
    });
    assert!(errored);
    assert_eq!(
        state
            .storage
            .governance
            .count_audits_with_reason("agent:a1", "tool_requires_approval:shell.exec")
            .unwrap(),
        1
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model failure
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn model_failure_audits_and_maps_to_turn_model_failure() {
    let state = state_with_script(vec![ScriptedResponse::Fail("upstream 500".into())]);
    state
        .storage
        .agents
        .upsert(&AgentState::bootstrap("agent:a1"))
        .unwrap();
    start_session(&state, "session:s1", 500);

    let req = request("turn:t9", "agent:a1", "session:s1", "hello");
    let err = process_turn(&state, &req).await.unwrap_err();
    assert_eq!(err.code(), "TurnModelFailure");

    let failed = TurnEvent::failed(&err);
    assert_eq!(failed.sequence(), FAILED_SEQUENCE);

    assert_eq!(
        state
            .storage
            .governance
            .count_audits_with_reason("agent:a1", "turn_processing_model_error")
            .unwrap(),
        1
    );
    // The user turn was persisted before the model step; no assistant turn.
    assert_eq!(state.storage.sessions.list_turns("session:s1").unwrap().len(), 1);
}

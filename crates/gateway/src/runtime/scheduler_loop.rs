//! Scheduler tick loop: pulls due windows, enforces concurrency policy,
//! runs schedule actions as agent turns, and reports completions.

use std::time::Duration;

use chrono::Utc;

use pa_domain::id;
use pa_domain::schedule::{ExecutionOutcome, ScheduleRecord};
use pa_domain::turn::SessionState;
use pa_domain::{Error, Result};
use pa_scheduler::{ClaimOutcome, Ticket};

use crate::runtime::workflow::TurnRequest;
use crate::state::{AppState, SESSION_TOKEN_CAPACITY};

/// Tick period.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Coarse deadline for one dispatch pass; exceeding it logs and moves on.
const DISPATCH_DEADLINE: Duration = Duration::from_secs(30);

/// Spawn the periodic tick task. Handler errors are logged and never
/// interrupt subsequent ticks.
pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            match tokio::time::timeout(DISPATCH_DEADLINE, dispatch_due(&state)).await {
                Ok(Ok(dispatched)) => {
                    if dispatched > 0 {
                        tracing::debug!(dispatched, "scheduler tick dispatched windows");
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "scheduler tick failed"),
                Err(_) => tracing::warn!(
                    deadline_secs = DISPATCH_DEADLINE.as_secs(),
                    "scheduler dispatch exceeded its deadline"
                ),
            }
        }
    })
}

/// One tick: materialize due windows and claim each against the
/// concurrency policy. Returns the number of actions spawned.
pub async fn dispatch_due(state: &AppState) -> Result<usize> {
    let now = Utc::now();
    let due = state.storage.schedules.list_due(now)?;
    let mut dispatched = 0;

    for window in due {
        let outcome = state.scheduler.claim(
            &window.schedule,
            window.due_at,
            window.trigger_source,
            Utc::now(),
        );
        if handle_claim(state, &window.schedule, outcome).await? {
            dispatched += 1;
        }
    }
    Ok(dispatched)
}

/// Manually fire a schedule. Returns the execution id when a run was
/// claimed, `None` when it was skipped.
pub async fn trigger_now(state: &AppState, schedule_id: &str) -> Result<Option<String>> {
    let schedule = state
        .storage
        .schedules
        .get(schedule_id)?
        .ok_or_else(|| Error::InternalServerError {
            message: format!("no such schedule {schedule_id}"),
        })?;

    let outcome = state.scheduler.trigger_now(&schedule, Utc::now());
    let execution_id = match &outcome {
        ClaimOutcome::Claimed { ticket, .. } => Some(ticket.execution_id.clone()),
        ClaimOutcome::Skipped(_) => None,
    };
    handle_claim(state, &schedule, outcome).await?;
    Ok(execution_id)
}

/// Persist skip records and spawn the action for a claimed ticket.
/// Returns whether an action was spawned.
async fn handle_claim(
    state: &AppState,
    schedule: &ScheduleRecord,
    outcome: ClaimOutcome,
) -> Result<bool> {
    match outcome {
        ClaimOutcome::Skipped(record) => {
            tracing::debug!(
                schedule_id = %record.schedule_id,
                skip_reason = ?record.skip_reason,
                "schedule window skipped"
            );
            state.storage.schedules.record_execution(&record)?;
            Ok(false)
        }
        ClaimOutcome::Claimed { ticket, displaced } => {
            for record in displaced {
                state.storage.schedules.record_execution(&record)?;
            }
            let state = state.clone();
            let schedule = schedule.clone();
            tokio::spawn(async move {
                run_ticket(&state, &schedule, ticket).await;
            });
            Ok(true)
        }
    }
}

/// Execute one ticket: run `action_ref` as a turn on the schedule's own
/// session, then report the outcome. A replaced ticket's completion is a
/// no-op and records nothing.
async fn run_ticket(state: &AppState, schedule: &ScheduleRecord, ticket: Ticket) {
    tracing::info!(
        schedule_id = %ticket.schedule_id,
        execution_id = %ticket.execution_id,
        "scheduled action starting"
    );

    let outcome = match execute_action(state, schedule, &ticket).await {
        Ok(()) => ExecutionOutcome::Succeeded,
        Err(e) => {
            tracing::warn!(
                schedule_id = %ticket.schedule_id,
                execution_id = %ticket.execution_id,
                error = %e,
                "scheduled action failed"
            );
            ExecutionOutcome::Failed
        }
    };

    match state.scheduler.complete(&ticket, outcome, Utc::now()) {
        Some(record) => {
            if let Err(e) = state.storage.schedules.record_execution(&record) {
                tracing::warn!(error = %e, "failed to record scheduled execution");
            }
        }
        None => tracing::debug!(
            execution_id = %ticket.execution_id,
            "completion ignored (ticket replaced or unknown)"
        ),
    }
}

async fn execute_action(
    state: &AppState,
    schedule: &ScheduleRecord,
    ticket: &Ticket,
) -> Result<()> {
    // Each schedule runs against its own session so catch-up runs share
    // one conversation.
    let session_id = id::session_for_channel(&ticket.schedule_id);
    let conversation_id = id::conversation_for_channel(&ticket.schedule_id);

    if state.storage.agents.get(&schedule.owner_agent_id)?.is_none() {
        state
            .storage
            .agents
            .upsert(&pa_domain::agent::AgentState::bootstrap(
                &schedule.owner_agent_id,
            ))?;
    }
    state.storage.sessions.start_session(&SessionState {
        session_id: session_id.clone(),
        conversation_id: conversation_id.clone(),
        token_capacity: SESSION_TOKEN_CAPACITY,
        tokens_used: 0,
    })?;

    let request = TurnRequest {
        turn_id: id::branded(id::TURN_PREFIX, &ticket.execution_id),
        agent_id: schedule.owner_agent_id.clone(),
        session_id: session_id.clone(),
        conversation_id,
        content: ticket.action_ref.clone(),
        created_at: ticket.started_at,
    };
    let payload = serde_json::to_value(&request).map_err(|e| Error::persistence(e.to_string()))?;

    let session = state.session_client(&session_id);
    let mut rx = session.stream_call("process_turn", Some(&request.turn_id), payload)?;

    // Drain the stream; a terminal error fails the execution.
    while let Some(item) = rx.recv().await {
        item?;
    }
    Ok(())
}

//! Schedule endpoints: upsert, list, manual trigger, execution history.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use pa_domain::id;
use pa_domain::schedule::{
    ConcurrencyPolicy, RecurrencePattern, ScheduleRecord, ScheduleStatus, TriggerKind,
};
use pa_scheduler::advance_after;

use crate::runtime::scheduler_loop;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpsertScheduleRequest {
    pub schedule_id: Option<String>,
    pub owner_agent_id: String,
    pub label: String,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    pub action_ref: String,
    #[serde(default = "default_status")]
    pub status: ScheduleStatus,
    #[serde(default = "default_policy")]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default)]
    pub allows_catch_up: bool,
    #[serde(default)]
    pub auto_disable_after_run: bool,
    #[serde(default = "default_catch_up_window")]
    pub catch_up_window_seconds: u64,
    #[serde(default = "default_max_catch_up")]
    pub max_catch_up_runs_per_tick: usize,
    /// Explicit first firing; computed from the recurrence when absent.
    #[serde(default)]
    pub next_execution_at: Option<DateTime<Utc>>,
}

fn default_status() -> ScheduleStatus {
    ScheduleStatus::Active
}

fn default_policy() -> ConcurrencyPolicy {
    ConcurrencyPolicy::Forbid
}

fn default_catch_up_window() -> u64 {
    3600
}

fn default_max_catch_up() -> usize {
    5
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /schedules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn upsert(
    State(state): State<AppState>,
    Json(body): Json<UpsertScheduleRequest>,
) -> Response {
    // Exactly one recurrence source for cron/interval triggers.
    let trigger = match (&body.cron_expression, body.interval_seconds) {
        (Some(_), None) => TriggerKind::Cron,
        (None, Some(_)) => TriggerKind::Interval,
        _ => return bad_request("exactly one of cron_expression / interval_seconds is required"),
    };

    let recurrence = RecurrencePattern {
        label: body.label,
        cron_expression: body.cron_expression,
        interval_seconds: body.interval_seconds,
    };
    let next_execution_at = body
        .next_execution_at
        .or_else(|| advance_after(&recurrence, Utc::now()));

    let record = ScheduleRecord {
        schedule_id: body
            .schedule_id
            .map(|raw| id::branded(id::SCHEDULE_PREFIX, &raw))
            .unwrap_or_else(id::mint_schedule_id),
        owner_agent_id: id::branded(id::AGENT_PREFIX, &body.owner_agent_id),
        recurrence,
        trigger,
        action_ref: body.action_ref,
        status: body.status,
        concurrency_policy: body.concurrency_policy,
        allows_catch_up: body.allows_catch_up,
        auto_disable_after_run: body.auto_disable_after_run,
        catch_up_window_seconds: body.catch_up_window_seconds,
        max_catch_up_runs_per_tick: body.max_catch_up_runs_per_tick,
        last_execution_at: None,
        next_execution_at,
    };

    match state.storage.schedules.upsert_schedule(&record) {
        Ok(()) => Json(serde_json::json!(record)).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.code() })),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /schedules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list(State(state): State<AppState>) -> Response {
    match state.storage.schedules.list() {
        Ok(schedules) => Json(serde_json::json!({ "schedules": schedules })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.code() })),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /schedules/{scheduleId}/trigger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn trigger(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> Response {
    let schedule_id = id::branded(id::SCHEDULE_PREFIX, &schedule_id);
    match scheduler_loop::trigger_now(&state, &schedule_id).await {
        Ok(Some(execution_id)) => Json(serde_json::json!({
            "triggered": true,
            "execution_id": execution_id,
        }))
        .into_response(),
        Ok(None) => Json(serde_json::json!({ "triggered": false })).into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /schedules/{scheduleId}/executions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn executions(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> Response {
    let schedule_id = id::branded(id::SCHEDULE_PREFIX, &schedule_id);
    match state.storage.schedules.list_executions(&schedule_id) {
        Ok(executions) => Json(serde_json::json!({ "executions": executions })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.code() })),
        )
            .into_response(),
    }
}

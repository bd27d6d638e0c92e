//! Schedule and execution records for the recurring-action scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Cron,
    Interval,
    /// Triggered externally; never returned by the due scan.
    Event,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Expired,
    Disabled,
}

/// What happens when a new window fires while earlier runs are in flight.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Overlapping runs are permitted.
    Allow,
    /// New windows are skipped while a run is in flight.
    Forbid,
    /// In-flight runs are abandoned in favour of the new window.
    Replace,
}

/// Recurrence rule. Exactly one of `cron_expression` / `interval_seconds`
/// is set when the trigger is Cron or Interval.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecurrencePattern {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
}

impl RecurrencePattern {
    pub fn interval(label: impl Into<String>, seconds: u64) -> Self {
        Self {
            label: label.into(),
            cron_expression: None,
            interval_seconds: Some(seconds),
        }
    }

    pub fn cron(label: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            cron_expression: Some(expression.into()),
            interval_seconds: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRecord {
    pub schedule_id: String,
    pub owner_agent_id: String,
    pub recurrence: RecurrencePattern,
    pub trigger: TriggerKind,
    /// The action run on each firing (a prompt dispatched as an agent turn).
    pub action_ref: String,
    pub status: ScheduleStatus,
    pub concurrency_policy: ConcurrencyPolicy,
    pub allows_catch_up: bool,
    pub auto_disable_after_run: bool,
    pub catch_up_window_seconds: u64,
    pub max_catch_up_runs_per_tick: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_execution_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    CronTick,
    IntervalTick,
    Event,
    Manual,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConcurrencyForbid,
    ConcurrencyReplace,
    ManualTriggerInactive,
}

/// One recorded firing of a schedule.
///
/// Invariant: `skip_reason` is set exactly when `outcome == Skipped`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduledExecutionRecord {
    pub execution_id: String,
    pub schedule_id: String,
    pub due_at: DateTime<Utc>,
    pub trigger_source: TriggerSource,
    pub outcome: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

/// One materialized due window of a schedule at or before `now`.
#[derive(Clone, Debug)]
pub struct DueSchedule {
    pub schedule: ScheduleRecord,
    pub due_at: DateTime<Utc>,
    pub trigger_source: TriggerSource,
}

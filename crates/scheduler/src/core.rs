//! In-flight ticket table and concurrency policy enforcement.
//!
//! A ticket is the scheduler's claim on one execution of one schedule's
//! action. The table is process-local; check-policy-install runs under a
//! single lock so two concurrent claims cannot both observe an empty
//! in-flight set.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use pa_domain::id::mint_execution_id;
use pa_domain::schedule::{
    ConcurrencyPolicy, ExecutionOutcome, ScheduleRecord, ScheduleStatus,
    ScheduledExecutionRecord, SkipReason, TriggerSource,
};

/// One claimed execution, consumed by the action executor.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub execution_id: String,
    pub schedule_id: String,
    pub due_at: DateTime<Utc>,
    pub trigger_source: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub action_ref: String,
}

/// Result of evaluating the concurrency policy for one due window.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The window was claimed. `displaced` holds the Skipped records for
    /// tickets abandoned by a Replace policy; persist them immediately.
    Claimed {
        ticket: Ticket,
        displaced: Vec<ScheduledExecutionRecord>,
    },
    /// The window was skipped; persist the record.
    Skipped(ScheduledExecutionRecord),
}

#[derive(Default)]
struct Inner {
    /// schedule_id -> in-flight tickets.
    in_flight: HashMap<String, Vec<Ticket>>,
    /// Execution ids displaced by Replace; they can no longer complete.
    replaced: HashSet<String>,
}

#[derive(Default)]
pub struct SchedulerCore {
    inner: Mutex<Inner>,
}

impl SchedulerCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the concurrency policy for one due window and, when
    /// permitted, install a ticket.
    pub fn claim(
        &self,
        schedule: &ScheduleRecord,
        due_at: DateTime<Utc>,
        trigger_source: TriggerSource,
        now: DateTime<Utc>,
    ) -> ClaimOutcome {
        let mut inner = self.inner.lock();
        let existing = inner
            .in_flight
            .get(&schedule.schedule_id)
            .map(|v| v.len())
            .unwrap_or(0);

        match schedule.concurrency_policy {
            ConcurrencyPolicy::Allow => {}
            ConcurrencyPolicy::Forbid if existing > 0 => {
                tracing::debug!(
                    schedule_id = %schedule.schedule_id,
                    in_flight = existing,
                    "forbid policy: skipping due window"
                );
                return ClaimOutcome::Skipped(skip_record(
                    schedule,
                    due_at,
                    trigger_source,
                    now,
                    SkipReason::ConcurrencyForbid,
                ));
            }
            ConcurrencyPolicy::Forbid => {}
            ConcurrencyPolicy::Replace => {
                // Abandon every in-flight ticket before claiming.
                let displaced_tickets = inner
                    .in_flight
                    .remove(&schedule.schedule_id)
                    .unwrap_or_default();
                let mut displaced = Vec::with_capacity(displaced_tickets.len());
                for old in displaced_tickets {
                    inner.replaced.insert(old.execution_id.clone());
                    displaced.push(ScheduledExecutionRecord {
                        execution_id: old.execution_id,
                        schedule_id: old.schedule_id,
                        due_at: old.due_at,
                        trigger_source: old.trigger_source,
                        outcome: ExecutionOutcome::Skipped,
                        started_at: old.started_at,
                        ended_at: Some(now),
                        skip_reason: Some(SkipReason::ConcurrencyReplace),
                    });
                }
                if !displaced.is_empty() {
                    tracing::info!(
                        schedule_id = %schedule.schedule_id,
                        replaced = displaced.len(),
                        "replace policy: abandoning in-flight runs"
                    );
                }
                let ticket = install(&mut inner, schedule, due_at, trigger_source, now);
                return ClaimOutcome::Claimed { ticket, displaced };
            }
        }

        let ticket = install(&mut inner, schedule, due_at, trigger_source, now);
        ClaimOutcome::Claimed {
            ticket,
            displaced: Vec::new(),
        }
    }

    /// Manually fire a schedule right now. Inactive schedules record a
    /// `ManualTriggerInactive` skip instead of claiming.
    pub fn trigger_now(&self, schedule: &ScheduleRecord, now: DateTime<Utc>) -> ClaimOutcome {
        if schedule.status != ScheduleStatus::Active {
            return ClaimOutcome::Skipped(skip_record(
                schedule,
                now,
                TriggerSource::Manual,
                now,
                SkipReason::ManualTriggerInactive,
            ));
        }
        self.claim(schedule, now, TriggerSource::Manual, now)
    }

    /// Retire a ticket. Returns the execution record to persist, or `None`
    /// when the ticket was replaced or is no longer in flight (no-op).
    pub fn complete(
        &self,
        ticket: &Ticket,
        outcome: ExecutionOutcome,
        ended_at: DateTime<Utc>,
    ) -> Option<ScheduledExecutionRecord> {
        let mut inner = self.inner.lock();

        if inner.replaced.remove(&ticket.execution_id) {
            return None;
        }

        let tickets = inner.in_flight.get_mut(&ticket.schedule_id)?;
        let idx = tickets
            .iter()
            .position(|t| t.execution_id == ticket.execution_id)?;
        tickets.remove(idx);
        if tickets.is_empty() {
            inner.in_flight.remove(&ticket.schedule_id);
        }

        Some(ScheduledExecutionRecord {
            execution_id: ticket.execution_id.clone(),
            schedule_id: ticket.schedule_id.clone(),
            due_at: ticket.due_at,
            trigger_source: ticket.trigger_source,
            outcome,
            started_at: ticket.started_at,
            ended_at: Some(ended_at),
            skip_reason: None,
        })
    }

    /// In-flight ticket count for a schedule.
    pub fn in_flight(&self, schedule_id: &str) -> usize {
        self.inner
            .lock()
            .in_flight
            .get(schedule_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

fn install(
    inner: &mut Inner,
    schedule: &ScheduleRecord,
    due_at: DateTime<Utc>,
    trigger_source: TriggerSource,
    now: DateTime<Utc>,
) -> Ticket {
    let ticket = Ticket {
        execution_id: mint_execution_id(),
        schedule_id: schedule.schedule_id.clone(),
        due_at,
        trigger_source,
        started_at: now,
        action_ref: schedule.action_ref.clone(),
    };
    inner
        .in_flight
        .entry(schedule.schedule_id.clone())
        .or_default()
        .push(ticket.clone());
    ticket
}

fn skip_record(
    schedule: &ScheduleRecord,
    due_at: DateTime<Utc>,
    trigger_source: TriggerSource,
    now: DateTime<Utc>,
    reason: SkipReason,
) -> ScheduledExecutionRecord {
    ScheduledExecutionRecord {
        execution_id: mint_execution_id(),
        schedule_id: schedule.schedule_id.clone(),
        due_at,
        trigger_source,
        outcome: ExecutionOutcome::Skipped,
        started_at: now,
        ended_at: Some(now),
        skip_reason: Some(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pa_domain::schedule::{RecurrencePattern, TriggerKind};

    fn schedule(policy: ConcurrencyPolicy) -> ScheduleRecord {
        ScheduleRecord {
            schedule_id: "schedule:s1".into(),
            owner_agent_id: "agent:a1".into(),
            recurrence: RecurrencePattern::interval("test", 60),
            trigger: TriggerKind::Interval,
            action_ref: "digest".into(),
            status: ScheduleStatus::Active,
            concurrency_policy: policy,
            allows_catch_up: false,
            auto_disable_after_run: false,
            catch_up_window_seconds: 0,
            max_catch_up_runs_per_tick: 1,
            last_execution_at: None,
            next_execution_at: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap()
    }

    fn claimed(outcome: ClaimOutcome) -> (Ticket, Vec<ScheduledExecutionRecord>) {
        match outcome {
            ClaimOutcome::Claimed { ticket, displaced } => (ticket, displaced),
            ClaimOutcome::Skipped(r) => panic!("expected claim, got skip: {r:?}"),
        }
    }

    #[test]
    fn allow_policy_permits_overlap() {
        let core = SchedulerCore::new();
        let s = schedule(ConcurrencyPolicy::Allow);
        claimed(core.claim(&s, now(), TriggerSource::IntervalTick, now()));
        claimed(core.claim(&s, now(), TriggerSource::IntervalTick, now()));
        assert_eq!(core.in_flight(&s.schedule_id), 2);
    }

    #[test]
    fn forbid_policy_skips_second_claim() {
        let core = SchedulerCore::new();
        let s = schedule(ConcurrencyPolicy::Forbid);
        claimed(core.claim(&s, now(), TriggerSource::IntervalTick, now()));

        match core.claim(&s, now(), TriggerSource::IntervalTick, now()) {
            ClaimOutcome::Skipped(record) => {
                assert_eq!(record.outcome, ExecutionOutcome::Skipped);
                assert_eq!(record.skip_reason, Some(SkipReason::ConcurrencyForbid));
            }
            ClaimOutcome::Claimed { .. } => panic!("forbid should skip"),
        }
        assert_eq!(core.in_flight(&s.schedule_id), 1);
    }

    #[test]
    fn replace_policy_displaces_in_flight() {
        let core = SchedulerCore::new();
        let s = schedule(ConcurrencyPolicy::Replace);
        let (first, _) = claimed(core.claim(&s, now(), TriggerSource::IntervalTick, now()));
        let (second, displaced) =
            claimed(core.claim(&s, now(), TriggerSource::IntervalTick, now()));

        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].execution_id, first.execution_id);
        assert_eq!(
            displaced[0].skip_reason,
            Some(SkipReason::ConcurrencyReplace)
        );

        // The replaced ticket cannot complete.
        assert!(core
            .complete(&first, ExecutionOutcome::Succeeded, now())
            .is_none());

        // The live ticket completes normally.
        let record = core
            .complete(&second, ExecutionOutcome::Succeeded, now())
            .unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Succeeded);
        assert_eq!(core.in_flight(&s.schedule_id), 0);
    }

    #[test]
    fn complete_unknown_ticket_is_noop() {
        let core = SchedulerCore::new();
        let s = schedule(ConcurrencyPolicy::Allow);
        let (ticket, _) = claimed(core.claim(&s, now(), TriggerSource::IntervalTick, now()));
        assert!(core
            .complete(&ticket, ExecutionOutcome::Succeeded, now())
            .is_some());
        // Second completion: no longer in flight.
        assert!(core
            .complete(&ticket, ExecutionOutcome::Failed, now())
            .is_none());
    }

    #[test]
    fn manual_trigger_on_inactive_schedule_skips() {
        let core = SchedulerCore::new();
        let mut s = schedule(ConcurrencyPolicy::Allow);
        s.status = ScheduleStatus::Paused;
        match core.trigger_now(&s, now()) {
            ClaimOutcome::Skipped(record) => {
                assert_eq!(
                    record.skip_reason,
                    Some(SkipReason::ManualTriggerInactive)
                );
                assert_eq!(record.trigger_source, TriggerSource::Manual);
            }
            ClaimOutcome::Claimed { .. } => panic!("inactive manual trigger must skip"),
        }
    }

    #[test]
    fn manual_trigger_on_active_schedule_claims() {
        let core = SchedulerCore::new();
        let s = schedule(ConcurrencyPolicy::Allow);
        let (ticket, _) = claimed(core.trigger_now(&s, now()));
        assert_eq!(ticket.trigger_source, TriggerSource::Manual);
    }
}

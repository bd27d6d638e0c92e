//! Due-window computation for one schedule at one instant.

use chrono::{DateTime, Duration, Utc};

use pa_domain::schedule::{RecurrencePattern, ScheduleRecord, ScheduleStatus, TriggerKind};

use crate::cron::cron_next;

/// Safety bound on the window sequence for schedules far in the past.
const MAX_WINDOW_SCAN: usize = 10_000;

/// The next firing strictly after `after` under the recurrence rule.
pub fn advance_after(
    recurrence: &RecurrencePattern,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(seconds) = recurrence.interval_seconds {
        if seconds == 0 {
            return None;
        }
        return Some(after + Duration::seconds(seconds as i64));
    }
    if let Some(cron) = recurrence.cron_expression.as_deref() {
        return cron_next(cron, &after);
    }
    None
}

/// The materialized windows of one schedule plus the successor value for
/// `next_execution_at` once those windows have been handed out.
#[derive(Clone, Debug)]
pub struct DueComputation {
    /// Due instants at or before `now`, oldest first.
    pub windows: Vec<DateTime<Utc>>,
    /// First window after the last materialized one.
    pub next_execution_at: Option<DateTime<Utc>>,
}

impl DueComputation {
    fn empty() -> Self {
        Self {
            windows: Vec::new(),
            next_execution_at: None,
        }
    }
}

/// Compute the due windows of `schedule` at `now`.
///
/// 1. Inactive schedules, event triggers, and schedules whose
///    `next_execution_at` is null or in the future yield no windows.
/// 2. The window sequence starts at `next_execution_at` and advances by the
///    recurrence rule while `w <= now`.
/// 3. Without catch-up only a single window at `now` is kept.
/// 4. With catch-up, windows older than the catch-up horizon are dropped and
///    the count is capped at `max_catch_up_runs_per_tick`; the remainder of
///    the sequence fires on later ticks.
pub fn due_windows(schedule: &ScheduleRecord, now: DateTime<Utc>) -> DueComputation {
    if schedule.status != ScheduleStatus::Active || schedule.trigger == TriggerKind::Event {
        return DueComputation::empty();
    }
    let first = match schedule.next_execution_at {
        Some(t) if t <= now => t,
        _ => return DueComputation::empty(),
    };

    // Walk the sequence w_0 = next_execution_at, w_{i+1} = advance(w_i).
    let mut windows = Vec::new();
    let mut cursor = first;
    for _ in 0..MAX_WINDOW_SCAN {
        windows.push(cursor);
        match advance_after(&schedule.recurrence, cursor) {
            Some(next) if next <= now => cursor = next,
            _ => break,
        }
    }

    if !schedule.allows_catch_up {
        // Missed windows collapse to a single firing at the current tick.
        return DueComputation {
            windows: vec![now],
            next_execution_at: advance_after(&schedule.recurrence, now),
        };
    }

    // Successor of the newest window <= now; > now by construction. Used
    // when filtering drops every window, so the grid stays aligned.
    let last_in_sequence = *windows.last().unwrap_or(&first);

    let horizon = now - Duration::seconds(schedule.catch_up_window_seconds as i64);
    windows.retain(|w| *w >= horizon);
    windows.truncate(schedule.max_catch_up_runs_per_tick);

    let next_execution_at = match windows.last() {
        Some(last) => advance_after(&schedule.recurrence, *last),
        None => advance_after(&schedule.recurrence, last_in_sequence),
    };

    DueComputation {
        windows,
        next_execution_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pa_domain::schedule::{ConcurrencyPolicy, TriggerKind};

    fn interval_schedule(seconds: u64) -> ScheduleRecord {
        ScheduleRecord {
            schedule_id: "schedule:s1".into(),
            owner_agent_id: "agent:a1".into(),
            recurrence: RecurrencePattern::interval("test", seconds),
            trigger: TriggerKind::Interval,
            action_ref: "check inbox".into(),
            status: ScheduleStatus::Active,
            concurrency_policy: ConcurrencyPolicy::Allow,
            allows_catch_up: true,
            auto_disable_after_run: false,
            catch_up_window_seconds: 180,
            max_catch_up_runs_per_tick: 2,
            last_execution_at: None,
            next_execution_at: None,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, h, m, s).unwrap()
    }

    #[test]
    fn inactive_schedule_has_no_windows() {
        let mut s = interval_schedule(60);
        s.status = ScheduleStatus::Paused;
        s.next_execution_at = Some(at(9, 0, 0));
        assert!(due_windows(&s, at(10, 0, 0)).windows.is_empty());
    }

    #[test]
    fn future_next_has_no_windows() {
        let mut s = interval_schedule(60);
        s.next_execution_at = Some(at(11, 0, 0));
        assert!(due_windows(&s, at(10, 0, 0)).windows.is_empty());
    }

    #[test]
    fn null_next_has_no_windows() {
        let s = interval_schedule(60);
        assert!(due_windows(&s, at(10, 0, 0)).windows.is_empty());
    }

    #[test]
    fn event_trigger_never_listed() {
        let mut s = interval_schedule(60);
        s.trigger = TriggerKind::Event;
        s.next_execution_at = Some(at(9, 0, 0));
        assert!(due_windows(&s, at(10, 0, 0)).windows.is_empty());
    }

    #[test]
    fn no_catch_up_collapses_to_single_window_at_now() {
        let mut s = interval_schedule(60);
        s.allows_catch_up = false;
        s.next_execution_at = Some(at(9, 55, 0));
        let now = at(10, 0, 0);
        let due = due_windows(&s, now);
        assert_eq!(due.windows, vec![now]);
        assert_eq!(due.next_execution_at, Some(at(10, 1, 0)));
    }

    #[test]
    fn catch_up_horizon_and_cap() {
        // interval=60s, window=180s, cap=2, next = now-5min.
        // Sequence: -5m .. 0; horizon keeps [-3m, 0]; cap keeps the two
        // oldest so the rest fires next tick.
        let mut s = interval_schedule(60);
        s.next_execution_at = Some(at(9, 55, 0));
        let now = at(10, 0, 0);
        let due = due_windows(&s, now);
        assert_eq!(due.windows, vec![at(9, 57, 0), at(9, 58, 0)]);
        assert_eq!(due.next_execution_at, Some(at(9, 59, 0)));
    }

    #[test]
    fn catch_up_within_cap_keeps_all() {
        let mut s = interval_schedule(60);
        s.max_catch_up_runs_per_tick = 10;
        s.next_execution_at = Some(at(9, 58, 0));
        let due = due_windows(&s, at(10, 0, 0));
        assert_eq!(
            due.windows,
            vec![at(9, 58, 0), at(9, 59, 0), at(10, 0, 0)]
        );
        assert_eq!(due.next_execution_at, Some(at(10, 1, 0)));
    }

    #[test]
    fn all_windows_past_horizon_resume_from_now() {
        let mut s = interval_schedule(60);
        s.catch_up_window_seconds = 30;
        s.next_execution_at = Some(at(9, 0, 0));
        let now = at(10, 0, 0);
        let due = due_windows(&s, now);
        // now itself is a window (9:00 + k*60s lands on 10:00) and inside
        // the 30s horizon.
        assert_eq!(due.windows, vec![at(10, 0, 0)]);
    }

    #[test]
    fn cron_advance_is_strictly_increasing() {
        let rec = RecurrencePattern::cron("hourly", "0 * * * *");
        let next = advance_after(&rec, at(10, 0, 0)).unwrap();
        assert_eq!(next, at(11, 0, 0));
    }

    #[test]
    fn zero_interval_never_advances() {
        let rec = RecurrencePattern::interval("broken", 0);
        assert!(advance_after(&rec, at(10, 0, 0)).is_none());
    }
}

//! Schedule port: upsert, due-window materialization, and execution
//! recording.
//!
//! `list_due` owns advancement of `next_execution_at`: materialized
//! windows move the pointer past themselves in the same transaction, so a
//! tick never hands out the same window twice. `record_execution` fills a
//! null pointer (manual triggers) and applies auto-disable atomically.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use pa_domain::schedule::{
    DueSchedule, RecurrencePattern, ScheduleRecord, ScheduleStatus, ScheduledExecutionRecord,
    TriggerKind, TriggerSource,
};
use pa_domain::Result;
use pa_scheduler::{advance_after, due_windows};

use crate::db::{
    db_err, enum_from_text, enum_to_text, opt_ts_from_text, opt_ts_to_text, ts_from_text,
    ts_to_text, Db,
};

#[derive(Clone, Debug)]
pub struct ScheduleStore {
    db: Db,
}

impl ScheduleStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn upsert_schedule(&self, record: &ScheduleRecord) -> Result<()> {
        let trigger = enum_to_text(&record.trigger)?;
        let status = enum_to_text(&record.status)?;
        let policy = enum_to_text(&record.concurrency_policy)?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO schedules
                     (schedule_id, owner_agent_id, label, cron_expression, interval_seconds,
                      trigger, action_ref, status, concurrency_policy, allows_catch_up,
                      auto_disable_after_run, catch_up_window_seconds,
                      max_catch_up_runs_per_tick, last_execution_at, next_execution_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(schedule_id) DO UPDATE SET
                     owner_agent_id = ?2, label = ?3, cron_expression = ?4,
                     interval_seconds = ?5, trigger = ?6, action_ref = ?7, status = ?8,
                     concurrency_policy = ?9, allows_catch_up = ?10,
                     auto_disable_after_run = ?11, catch_up_window_seconds = ?12,
                     max_catch_up_runs_per_tick = ?13, last_execution_at = ?14,
                     next_execution_at = ?15",
                params![
                    record.schedule_id,
                    record.owner_agent_id,
                    record.recurrence.label,
                    record.recurrence.cron_expression,
                    record.recurrence.interval_seconds.map(|v| v as i64),
                    trigger,
                    record.action_ref,
                    status,
                    policy,
                    record.allows_catch_up,
                    record.auto_disable_after_run,
                    record.catch_up_window_seconds as i64,
                    record.max_catch_up_runs_per_tick as i64,
                    opt_ts_to_text(record.last_execution_at),
                    opt_ts_to_text(record.next_execution_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get(&self, schedule_id: &str) -> Result<Option<ScheduleRecord>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("{SELECT_SCHEDULE} WHERE schedule_id = ?1"),
                [schedule_id],
                row_to_raw,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_schedule)
            .transpose()
        })
    }

    pub fn list(&self) -> Result<Vec<ScheduleRecord>> {
        self.db.with(|conn| {
            let mut stmt = conn
                .prepare(&format!("{SELECT_SCHEDULE} ORDER BY schedule_id"))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], row_to_raw)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows.into_iter().map(finish_schedule).collect()
        })
    }

    /// Materialize the due windows of every active schedule at `now`,
    /// advancing each schedule's `next_execution_at` past what was handed
    /// out. Windows are sorted `(due_at asc, schedule_id asc)`.
    pub fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<DueSchedule>> {
        self.db.with_tx(|tx| {
            let mut stmt = tx
                .prepare(&format!(
                    "{SELECT_SCHEDULE}
                     WHERE status = 'active'
                       AND next_execution_at IS NOT NULL
                       AND next_execution_at <= ?1"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([ts_to_text(now)], row_to_raw)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            drop(stmt);

            let mut due = Vec::new();
            for raw in rows {
                let schedule = finish_schedule(raw)?;
                let computed = due_windows(&schedule, now);
                if computed.windows.is_empty() && computed.next_execution_at.is_none() {
                    continue;
                }

                tx.execute(
                    "UPDATE schedules SET next_execution_at = ?2 WHERE schedule_id = ?1",
                    params![
                        schedule.schedule_id,
                        opt_ts_to_text(computed.next_execution_at),
                    ],
                )
                .map_err(db_err)?;

                let trigger_source = match schedule.trigger {
                    TriggerKind::Cron => TriggerSource::CronTick,
                    TriggerKind::Interval => TriggerSource::IntervalTick,
                    TriggerKind::Event => continue,
                };
                for window in computed.windows {
                    due.push(DueSchedule {
                        schedule: schedule.clone(),
                        due_at: window,
                        trigger_source,
                    });
                }
            }

            due.sort_by(|a, b| {
                (a.due_at, &a.schedule.schedule_id).cmp(&(b.due_at, &b.schedule.schedule_id))
            });
            Ok(due)
        })
    }

    /// Insert an execution record and update its schedule atomically: with
    /// `auto_disable_after_run` the schedule is disabled and unscheduled;
    /// otherwise `last_execution_at` moves to `ended_at ?? started_at` and a
    /// null `next_execution_at` is recomputed from the recurrence rule.
    pub fn record_execution(&self, record: &ScheduledExecutionRecord) -> Result<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO scheduled_executions
                     (execution_id, schedule_id, due_at, trigger_source, outcome,
                      started_at, ended_at, skip_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.execution_id,
                    record.schedule_id,
                    ts_to_text(record.due_at),
                    enum_to_text(&record.trigger_source)?,
                    enum_to_text(&record.outcome)?,
                    ts_to_text(record.started_at),
                    opt_ts_to_text(record.ended_at),
                    record
                        .skip_reason
                        .as_ref()
                        .map(enum_to_text)
                        .transpose()?,
                ],
            )
            .map_err(db_err)?;

            let Some(schedule) = read_schedule(tx, &record.schedule_id)? else {
                return Ok(());
            };

            if schedule.auto_disable_after_run {
                tx.execute(
                    "UPDATE schedules
                     SET status = 'disabled', next_execution_at = NULL,
                         last_execution_at = ?2
                     WHERE schedule_id = ?1",
                    params![
                        record.schedule_id,
                        ts_to_text(record.ended_at.unwrap_or(record.started_at)),
                    ],
                )
                .map_err(db_err)?;
                return Ok(());
            }

            let last = record.ended_at.unwrap_or(record.started_at);
            let next = match schedule.next_execution_at {
                Some(existing) => Some(existing),
                None => advance_after(&schedule.recurrence, last),
            };
            tx.execute(
                "UPDATE schedules
                 SET last_execution_at = ?2, next_execution_at = ?3
                 WHERE schedule_id = ?1",
                params![
                    record.schedule_id,
                    ts_to_text(last),
                    opt_ts_to_text(next),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Executions of one schedule, oldest first.
    pub fn list_executions(&self, schedule_id: &str) -> Result<Vec<ScheduledExecutionRecord>> {
        self.db.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT execution_id, schedule_id, due_at, trigger_source, outcome,
                            started_at, ended_at, skip_reason
                     FROM scheduled_executions
                     WHERE schedule_id = ?1
                     ORDER BY started_at ASC, execution_id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([schedule_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            rows.into_iter()
                .map(
                    |(id, sched, due, source, outcome, started, ended, skip)| {
                        Ok(ScheduledExecutionRecord {
                            execution_id: id,
                            schedule_id: sched,
                            due_at: ts_from_text(&due)?,
                            trigger_source: enum_from_text(&source)?,
                            outcome: enum_from_text(&outcome)?,
                            started_at: ts_from_text(&started)?,
                            ended_at: opt_ts_from_text(ended)?,
                            skip_reason: skip
                                .as_deref()
                                .map(enum_from_text)
                                .transpose()?,
                        })
                    },
                )
                .collect()
        })
    }
}

const SELECT_SCHEDULE: &str = "SELECT schedule_id, owner_agent_id, label, cron_expression,
        interval_seconds, trigger, action_ref, status, concurrency_policy,
        allows_catch_up, auto_disable_after_run, catch_up_window_seconds,
        max_catch_up_runs_per_tick, last_execution_at, next_execution_at
 FROM schedules";

fn read_schedule(tx: &Transaction<'_>, schedule_id: &str) -> Result<Option<ScheduleRecord>> {
    tx.query_row(
        &format!("{SELECT_SCHEDULE} WHERE schedule_id = ?1"),
        [schedule_id],
        row_to_raw,
    )
    .optional()
    .map_err(db_err)?
    .map(finish_schedule)
    .transpose()
}

struct RawScheduleRow {
    schedule_id: String,
    owner_agent_id: String,
    label: String,
    cron_expression: Option<String>,
    interval_seconds: Option<i64>,
    trigger: String,
    action_ref: String,
    status: String,
    concurrency_policy: String,
    allows_catch_up: bool,
    auto_disable_after_run: bool,
    catch_up_window_seconds: i64,
    max_catch_up_runs_per_tick: i64,
    last_execution_at: Option<String>,
    next_execution_at: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawScheduleRow> {
    Ok(RawScheduleRow {
        schedule_id: row.get(0)?,
        owner_agent_id: row.get(1)?,
        label: row.get(2)?,
        cron_expression: row.get(3)?,
        interval_seconds: row.get(4)?,
        trigger: row.get(5)?,
        action_ref: row.get(6)?,
        status: row.get(7)?,
        concurrency_policy: row.get(8)?,
        allows_catch_up: row.get(9)?,
        auto_disable_after_run: row.get(10)?,
        catch_up_window_seconds: row.get(11)?,
        max_catch_up_runs_per_tick: row.get(12)?,
        last_execution_at: row.get(13)?,
        next_execution_at: row.get(14)?,
    })
}

fn finish_schedule(raw: RawScheduleRow) -> Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        schedule_id: raw.schedule_id,
        owner_agent_id: raw.owner_agent_id,
        recurrence: RecurrencePattern {
            label: raw.label,
            cron_expression: raw.cron_expression,
            interval_seconds: raw.interval_seconds.map(|v| v.max(0) as u64),
        },
        trigger: enum_from_text(&raw.trigger)?,
        action_ref: raw.action_ref,
        status: enum_from_text(&raw.status)?,
        concurrency_policy: enum_from_text(&raw.concurrency_policy)?,
        allows_catch_up: raw.allows_catch_up,
        auto_disable_after_run: raw.auto_disable_after_run,
        catch_up_window_seconds: raw.catch_up_window_seconds.max(0) as u64,
        max_catch_up_runs_per_tick: raw.max_catch_up_runs_per_tick.max(0) as usize,
        last_execution_at: opt_ts_from_text(raw.last_execution_at)?,
        next_execution_at: opt_ts_from_text(raw.next_execution_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Storage;
    use chrono::{Duration, TimeZone};
    use pa_domain::schedule::{ConcurrencyPolicy, ExecutionOutcome, SkipReason};

    fn schedule(id: &str) -> ScheduleRecord {
        ScheduleRecord {
            schedule_id: id.into(),
            owner_agent_id: "agent:a1".into(),
            recurrence: RecurrencePattern::interval("minutely", 60),
            trigger: TriggerKind::Interval,
            action_ref: "summarize inbox".into(),
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

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap()
    }

    fn execution(
        schedule_id: &str,
        outcome: ExecutionOutcome,
        skip: Option<SkipReason>,
    ) -> ScheduledExecutionRecord {
        ScheduledExecutionRecord {
            execution_id: pa_domain::id::mint_execution_id(),
            schedule_id: schedule_id.into(),
            due_at: now(),
            trigger_source: TriggerSource::IntervalTick,
            outcome,
            started_at: now(),
            ended_at: Some(now() + Duration::seconds(5)),
            skip_reason: skip,
        }
    }

    #[test]
    fn upsert_and_get_roundtrip() {
        let storage = Storage::open_in_memory().unwrap();
        let mut s = schedule("schedule:s1");
        s.next_execution_at = Some(now());
        storage.schedules.upsert_schedule(&s).unwrap();
        assert_eq!(storage.schedules.get("schedule:s1").unwrap().unwrap(), s);
    }

    #[test]
    fn list_due_caps_catch_up_and_advances_pointer() {
        let storage = Storage::open_in_memory().unwrap();
        let mut s = schedule("schedule:s1");
        s.next_execution_at = Some(now() - Duration::minutes(5));
        storage.schedules.upsert_schedule(&s).unwrap();

        let due = storage.schedules.list_due(now()).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].due_at, now() - Duration::minutes(3));
        assert_eq!(due[1].due_at, now() - Duration::minutes(2));

        // The pointer moved just past the handed-out windows; the rest of
        // the backlog fires next tick.
        let after = storage.schedules.get("schedule:s1").unwrap().unwrap();
        assert_eq!(after.next_execution_at, Some(now() - Duration::minutes(1)));

        let due = storage.schedules.list_due(now()).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].due_at, now() - Duration::minutes(1));
        assert_eq!(due[1].due_at, now());
    }

    #[test]
    fn list_due_without_catch_up_is_single_window() {
        let storage = Storage::open_in_memory().unwrap();
        let mut s = schedule("schedule:s1");
        s.allows_catch_up = false;
        s.next_execution_at = Some(now() - Duration::minutes(30));
        storage.schedules.upsert_schedule(&s).unwrap();

        let due = storage.schedules.list_due(now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].due_at, now());

        // Nothing due afterwards.
        assert!(storage.schedules.list_due(now()).unwrap().is_empty());
    }

    #[test]
    fn list_due_sorted_by_due_at_then_schedule_id() {
        let storage = Storage::open_in_memory().unwrap();
        for (id, offset) in [("schedule:b", 2i64), ("schedule:a", 2), ("schedule:c", 4)] {
            let mut s = schedule(id);
            s.max_catch_up_runs_per_tick = 1;
            s.next_execution_at = Some(now() - Duration::minutes(offset));
            storage.schedules.upsert_schedule(&s).unwrap();
        }
        let due = storage.schedules.list_due(now()).unwrap();
        let order: Vec<(&str, DateTime<Utc>)> = due
            .iter()
            .map(|d| (d.schedule.schedule_id.as_str(), d.due_at))
            .collect();
        // schedule:c's oldest windows fall outside the 180s horizon; its
        // earliest surviving window is now-3min.
        assert_eq!(
            order,
            vec![
                ("schedule:c", now() - Duration::minutes(3)),
                ("schedule:a", now() - Duration::minutes(2)),
                ("schedule:b", now() - Duration::minutes(2)),
            ]
        );
    }

    #[test]
    fn paused_and_event_schedules_never_due() {
        let storage = Storage::open_in_memory().unwrap();
        let mut paused = schedule("schedule:paused");
        paused.status = ScheduleStatus::Paused;
        paused.next_execution_at = Some(now() - Duration::minutes(1));
        storage.schedules.upsert_schedule(&paused).unwrap();

        let mut event = schedule("schedule:event");
        event.trigger = TriggerKind::Event;
        event.next_execution_at = Some(now() - Duration::minutes(1));
        storage.schedules.upsert_schedule(&event).unwrap();

        assert!(storage.schedules.list_due(now()).unwrap().is_empty());
    }

    #[test]
    fn record_execution_is_idempotent_and_sets_last() {
        let storage = Storage::open_in_memory().unwrap();
        let mut s = schedule("schedule:s1");
        s.next_execution_at = Some(now() + Duration::minutes(1));
        storage.schedules.upsert_schedule(&s).unwrap();

        let exec = execution("schedule:s1", ExecutionOutcome::Succeeded, None);
        storage.schedules.record_execution(&exec).unwrap();
        storage.schedules.record_execution(&exec).unwrap();

        let executions = storage.schedules.list_executions("schedule:s1").unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0], exec);

        let after = storage.schedules.get("schedule:s1").unwrap().unwrap();
        assert_eq!(after.last_execution_at, exec.ended_at);
        // An already-scheduled pointer is left alone.
        assert_eq!(after.next_execution_at, Some(now() + Duration::minutes(1)));
    }

    #[test]
    fn record_execution_fills_null_next() {
        let storage = Storage::open_in_memory().unwrap();
        let s = schedule("schedule:s1");
        storage.schedules.upsert_schedule(&s).unwrap();

        let exec = execution("schedule:s1", ExecutionOutcome::Succeeded, None);
        storage.schedules.record_execution(&exec).unwrap();

        let after = storage.schedules.get("schedule:s1").unwrap().unwrap();
        assert_eq!(
            after.next_execution_at,
            Some(exec.ended_at.unwrap() + Duration::seconds(60))
        );
    }

    #[test]
    fn auto_disable_after_run() {
        let storage = Storage::open_in_memory().unwrap();
        let mut s = schedule("schedule:once");
        s.auto_disable_after_run = true;
        s.next_execution_at = Some(now());
        storage.schedules.upsert_schedule(&s).unwrap();

        let exec = execution("schedule:once", ExecutionOutcome::Succeeded, None);
        storage.schedules.record_execution(&exec).unwrap();

        let after = storage.schedules.get("schedule:once").unwrap().unwrap();
        assert_eq!(after.status, ScheduleStatus::Disabled);
        assert!(after.next_execution_at.is_none());
    }

    #[test]
    fn skip_record_roundtrips_reason() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .schedules
            .upsert_schedule(&schedule("schedule:s1"))
            .unwrap();
        let exec = execution(
            "schedule:s1",
            ExecutionOutcome::Skipped,
            Some(SkipReason::ConcurrencyForbid),
        );
        storage.schedules.record_execution(&exec).unwrap();
        let executions = storage.schedules.list_executions("schedule:s1").unwrap();
        assert_eq!(
            executions[0].skip_reason,
            Some(SkipReason::ConcurrencyForbid)
        );
    }
}

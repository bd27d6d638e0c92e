//! Forward-only schema migrations, applied in sequence at startup.
//!
//! `PRAGMA user_version` records the last applied migration number. New
//! migrations append to the list; existing ones never change.

use rusqlite::Connection;

use pa_domain::{Error, Result};

use crate::db::db_err;

pub const LATEST_VERSION: i32 = 4;

const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        // 0001 — agents, sessions, turns
        r#"
        CREATE TABLE agents (
            agent_id          TEXT PRIMARY KEY,
            permission_mode   TEXT NOT NULL,
            token_budget      INTEGER NOT NULL,
            quota_period      TEXT NOT NULL,
            tokens_consumed   INTEGER NOT NULL DEFAULT 0,
            budget_reset_at   TEXT
        );

        CREATE TABLE sessions (
            session_id        TEXT PRIMARY KEY,
            conversation_id   TEXT NOT NULL,
            token_capacity    INTEGER NOT NULL,
            tokens_used       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE turns (
            turn_id               TEXT PRIMARY KEY,
            session_id            TEXT NOT NULL,
            conversation_id       TEXT NOT NULL,
            turn_index            INTEGER NOT NULL,
            participant_role      TEXT NOT NULL,
            participant_agent_id  TEXT NOT NULL,
            message_json          TEXT NOT NULL,
            model_finish_reason   TEXT,
            model_usage_json      TEXT,
            created_at            TEXT NOT NULL,
            UNIQUE (session_id, turn_index)
        );

        CREATE INDEX idx_turns_session ON turns (session_id, turn_index);
        "#,
    ),
    (
        2,
        // 0002 — audit trail, channels
        r#"
        CREATE TABLE audit_entries (
            audit_entry_id  TEXT PRIMARY KEY,
            agent_id        TEXT NOT NULL,
            session_id      TEXT,
            decision        TEXT NOT NULL,
            reason          TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX idx_audit_agent ON audit_entries (agent_id, created_at);
        CREATE INDEX idx_audit_reason ON audit_entries (agent_id, reason, created_at);

        CREATE TABLE channels (
            channel_id              TEXT PRIMARY KEY,
            channel_type            TEXT NOT NULL,
            agent_id                TEXT NOT NULL,
            active_session_id       TEXT NOT NULL,
            active_conversation_id  TEXT NOT NULL,
            created_at              TEXT NOT NULL
        );
        "#,
    ),
    (
        3,
        // 0003 — schedules, executions
        r#"
        CREATE TABLE schedules (
            schedule_id                 TEXT PRIMARY KEY,
            owner_agent_id              TEXT NOT NULL,
            label                       TEXT NOT NULL,
            cron_expression             TEXT,
            interval_seconds            INTEGER,
            trigger                     TEXT NOT NULL,
            action_ref                  TEXT NOT NULL,
            status                      TEXT NOT NULL,
            concurrency_policy          TEXT NOT NULL,
            allows_catch_up             INTEGER NOT NULL DEFAULT 0,
            auto_disable_after_run      INTEGER NOT NULL DEFAULT 0,
            catch_up_window_seconds     INTEGER NOT NULL DEFAULT 0,
            max_catch_up_runs_per_tick  INTEGER NOT NULL DEFAULT 1,
            last_execution_at           TEXT,
            next_execution_at           TEXT
        );

        CREATE INDEX idx_schedules_due ON schedules (status, next_execution_at);

        CREATE TABLE scheduled_executions (
            execution_id    TEXT PRIMARY KEY,
            schedule_id     TEXT NOT NULL,
            due_at          TEXT NOT NULL,
            trigger_source  TEXT NOT NULL,
            outcome         TEXT NOT NULL,
            started_at      TEXT NOT NULL,
            ended_at        TEXT,
            skip_reason     TEXT
        );

        CREATE INDEX idx_executions_schedule
            ON scheduled_executions (schedule_id, started_at);
        "#,
    ),
    (
        4,
        // 0004 — memory items, workflow journal
        r#"
        CREATE TABLE memory_items (
            memory_item_id        TEXT PRIMARY KEY,
            agent_id              TEXT NOT NULL,
            tier                  TEXT NOT NULL,
            scope                 TEXT NOT NULL,
            source                TEXT NOT NULL,
            content               TEXT NOT NULL,
            metadata_json         TEXT,
            generated_by_turn_id  TEXT,
            session_id            TEXT,
            sensitivity           TEXT NOT NULL,
            created_at            TEXT NOT NULL,
            updated_at            TEXT NOT NULL
        );

        CREATE INDEX idx_memory_agent_created
            ON memory_items (agent_id, created_at);

        CREATE TABLE workflow_journal (
            execution_id      TEXT NOT NULL,
            activity_name     TEXT NOT NULL,
            idempotency_key   TEXT NOT NULL,
            status            TEXT NOT NULL,
            serialized_result TEXT,
            serialized_error  TEXT,
            timestamp         TEXT NOT NULL,
            PRIMARY KEY (execution_id, activity_name, idempotency_key)
        );
        "#,
    ),
];

/// Apply every migration newer than the recorded `user_version`.
pub fn apply(conn: &mut Connection) -> Result<()> {
    let current: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(db_err)?;

    if current > LATEST_VERSION {
        return Err(Error::persistence(format!(
            "database schema version {current} is newer than this build ({LATEST_VERSION})"
        )));
    }

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql)
            .map_err(|e| Error::persistence(format!("migration {version:04}: {e}")))?;
        tx.pragma_update(None, "user_version", version)
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        tracing::debug!(version, "applied migration");
    }

    Ok(())
}

//! Session and turn port: context-window accounting and the append-only
//! turn log.

use rusqlite::{params, OptionalExtension, Transaction};

use pa_domain::turn::{SessionState, TurnRecord};
use pa_domain::{Error, Result};

use crate::db::{
    db_err, enum_from_text, enum_to_text, json_from_text, json_to_text, ts_from_text,
    ts_to_text, Db,
};

#[derive(Clone, Debug)]
pub struct SessionTurnStore {
    db: Db,
}

impl SessionTurnStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Idempotent session creation: an existing row is left untouched so
    /// re-creation never resets `tokens_used`.
    pub fn start_session(&self, state: &SessionState) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, conversation_id, token_capacity, tokens_used)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO NOTHING",
                params![
                    state.session_id,
                    state.conversation_id,
                    state.token_capacity as i64,
                    state.tokens_used as i64,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionState>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT session_id, conversation_id, token_capacity, tokens_used
                 FROM sessions WHERE session_id = ?1",
                [session_id],
                |row| {
                    Ok(SessionState {
                        session_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        token_capacity: row.get::<_, i64>(2)?.max(0) as u64,
                        tokens_used: row.get::<_, i64>(3)?.max(0) as u64,
                    })
                },
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// Append a turn, assigning the next dense `turn_index` for its session
    /// inside the same transaction. Idempotent on `turn_id`: a replay
    /// returns the stored record and writes nothing.
    pub fn append_turn(&self, turn: &TurnRecord) -> Result<TurnRecord> {
        self.db.with_tx(|tx| {
            if let Some(existing) = read_turn(tx, &turn.turn_id)? {
                return Ok(existing);
            }

            let next_index: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(turn_index) + 1, 0) FROM turns WHERE session_id = ?1",
                    [&turn.session_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;

            let mut stored = turn.clone();
            stored.turn_index = next_index;

            tx.execute(
                "INSERT INTO turns (turn_id, session_id, conversation_id, turn_index,
                                    participant_role, participant_agent_id, message_json,
                                    model_finish_reason, model_usage_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    stored.turn_id,
                    stored.session_id,
                    stored.conversation_id,
                    stored.turn_index,
                    enum_to_text(&stored.participant_role)?,
                    stored.participant_agent_id,
                    json_to_text(&stored.message)?,
                    stored.model_finish_reason,
                    stored.model_usage_json,
                    ts_to_text(stored.created_at),
                ],
            )
            .map_err(db_err)?;

            Ok(stored)
        })
    }

    /// Apply a signed token delta to the session's context window.
    pub fn update_context_window(
        &self,
        session_id: &str,
        delta_tokens: i64,
    ) -> Result<SessionState> {
        self.db.with_tx(|tx| {
            let mut state = tx
                .query_row(
                    "SELECT session_id, conversation_id, token_capacity, tokens_used
                     FROM sessions WHERE session_id = ?1",
                    [session_id],
                    |row| {
                        Ok(SessionState {
                            session_id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            token_capacity: row.get::<_, i64>(2)?.max(0) as u64,
                            tokens_used: row.get::<_, i64>(3)?.max(0) as u64,
                        })
                    },
                )
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| Error::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;

            let attempted = state.tokens_used as i64 + delta_tokens;
            let attempted = attempted.max(0) as u64;
            if attempted > state.token_capacity {
                return Err(Error::ContextWindowExceeded {
                    capacity: state.token_capacity,
                    attempted,
                });
            }

            state.tokens_used = attempted;
            tx.execute(
                "UPDATE sessions SET tokens_used = ?2 WHERE session_id = ?1",
                params![session_id, state.tokens_used as i64],
            )
            .map_err(db_err)?;
            Ok(state)
        })
    }

    /// All turns of a session, ordered by `(turn_index asc, turn_id asc)`.
    pub fn list_turns(&self, session_id: &str) -> Result<Vec<TurnRecord>> {
        self.db.with(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT turn_id, session_id, conversation_id, turn_index,
                            participant_role, participant_agent_id, message_json,
                            model_finish_reason, model_usage_json, created_at
                     FROM turns WHERE session_id = ?1
                     ORDER BY turn_index ASC, turn_id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([session_id], row_to_raw)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows.into_iter().map(finish_turn).collect()
        })
    }
}

fn read_turn(tx: &Transaction<'_>, turn_id: &str) -> Result<Option<TurnRecord>> {
    tx.query_row(
        "SELECT turn_id, session_id, conversation_id, turn_index,
                participant_role, participant_agent_id, message_json,
                model_finish_reason, model_usage_json, created_at
         FROM turns WHERE turn_id = ?1",
        [turn_id],
        row_to_raw,
    )
    .optional()
    .map_err(db_err)?
    .map(finish_turn)
    .transpose()
}

struct RawTurnRow {
    turn_id: String,
    session_id: String,
    conversation_id: String,
    turn_index: i64,
    participant_role: String,
    participant_agent_id: String,
    message_json: String,
    model_finish_reason: Option<String>,
    model_usage_json: Option<String>,
    created_at: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTurnRow> {
    Ok(RawTurnRow {
        turn_id: row.get(0)?,
        session_id: row.get(1)?,
        conversation_id: row.get(2)?,
        turn_index: row.get(3)?,
        participant_role: row.get(4)?,
        participant_agent_id: row.get(5)?,
        message_json: row.get(6)?,
        model_finish_reason: row.get(7)?,
        model_usage_json: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn finish_turn(raw: RawTurnRow) -> Result<TurnRecord> {
    Ok(TurnRecord {
        turn_id: raw.turn_id,
        session_id: raw.session_id,
        conversation_id: raw.conversation_id,
        turn_index: raw.turn_index,
        participant_role: enum_from_text(&raw.participant_role)?,
        participant_agent_id: raw.participant_agent_id,
        message: json_from_text(&raw.message_json)?,
        model_finish_reason: raw.model_finish_reason,
        model_usage_json: raw.model_usage_json,
        created_at: ts_from_text(&raw.created_at)?,
    })
}

//! Agent state port: governance posture and token-budget accounting.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use pa_domain::agent::AgentState;
use pa_domain::{Error, Result};

use crate::db::{
    db_err, enum_from_text, enum_to_text, opt_ts_from_text, opt_ts_to_text, Db,
};

#[derive(Clone, Debug)]
pub struct AgentStore {
    db: Db,
}

impl AgentStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<AgentState>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT agent_id, permission_mode, token_budget, quota_period,
                        tokens_consumed, budget_reset_at
                 FROM agents WHERE agent_id = ?1",
                [agent_id],
                row_to_state,
            )
            .optional()
            .map_err(db_err)?
            .map(finish_row)
            .transpose()
        })
    }

    pub fn upsert(&self, state: &AgentState) -> Result<()> {
        let mode = enum_to_text(&state.permission_mode)?;
        let period = enum_to_text(&state.quota_period)?;
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO agents (agent_id, permission_mode, token_budget,
                                     quota_period, tokens_consumed, budget_reset_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     permission_mode = ?2,
                     token_budget = ?3,
                     quota_period = ?4,
                     tokens_consumed = ?5,
                     budget_reset_at = ?6",
                params![
                    state.agent_id,
                    mode,
                    state.token_budget as i64,
                    period,
                    state.tokens_consumed as i64,
                    opt_ts_to_text(state.budget_reset_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Charge `requested` tokens against the agent's budget.
    ///
    /// Normalization runs first, in the same transaction: when `now` has
    /// passed `budget_reset_at`, consumption resets to zero and the reset
    /// instant advances by one quota period. A failed charge still commits
    /// the normalization.
    pub fn consume_token_budget(
        &self,
        agent_id: &str,
        requested: u64,
        now: DateTime<Utc>,
    ) -> Result<AgentState> {
        self.db.with_tx(|tx| {
            let mut state = read_for_update(tx, agent_id)?;

            if let Some(reset_at) = state.budget_reset_at {
                if now >= reset_at {
                    state.tokens_consumed = 0;
                    state.budget_reset_at = state.quota_period.advance(reset_at);
                }
            }

            let remaining = state.remaining();
            if requested > remaining {
                // Persist normalization before reporting the failure.
                write_budget_fields(tx, &state)?;
                return Err(Error::TokenBudgetExceeded {
                    agent_id: agent_id.to_string(),
                    requested,
                    remaining,
                });
            }

            state.tokens_consumed += requested;
            if state.budget_reset_at.is_none() {
                // First charge opens the quota window.
                state.budget_reset_at = state.quota_period.advance(now);
            }
            write_budget_fields(tx, &state)?;
            Ok(state)
        })
    }
}

fn read_for_update(tx: &Transaction<'_>, agent_id: &str) -> Result<AgentState> {
    tx.query_row(
        "SELECT agent_id, permission_mode, token_budget, quota_period,
                tokens_consumed, budget_reset_at
         FROM agents WHERE agent_id = ?1",
        [agent_id],
        row_to_state,
    )
    .optional()
    .map_err(db_err)?
    .map(finish_row)
    .transpose()?
    .ok_or_else(|| Error::persistence(format!("no agent state for {agent_id}")))
}

fn write_budget_fields(tx: &Transaction<'_>, state: &AgentState) -> Result<()> {
    tx.execute(
        "UPDATE agents SET tokens_consumed = ?2, budget_reset_at = ?3
         WHERE agent_id = ?1",
        params![
            state.agent_id,
            state.tokens_consumed as i64,
            opt_ts_to_text(state.budget_reset_at),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Raw row shape before enum/timestamp decoding.
struct RawAgentRow {
    agent_id: String,
    permission_mode: String,
    token_budget: i64,
    quota_period: String,
    tokens_consumed: i64,
    budget_reset_at: Option<String>,
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAgentRow> {
    Ok(RawAgentRow {
        agent_id: row.get(0)?,
        permission_mode: row.get(1)?,
        token_budget: row.get(2)?,
        quota_period: row.get(3)?,
        tokens_consumed: row.get(4)?,
        budget_reset_at: row.get(5)?,
    })
}

fn finish_row(raw: RawAgentRow) -> Result<AgentState> {
    Ok(AgentState {
        agent_id: raw.agent_id,
        permission_mode: enum_from_text(&raw.permission_mode)?,
        token_budget: raw.token_budget.max(0) as u64,
        quota_period: enum_from_text(&raw.quota_period)?,
        tokens_consumed: raw.tokens_consumed.max(0) as u64,
        budget_reset_at: opt_ts_from_text(raw.budget_reset_at)?,
    })
}

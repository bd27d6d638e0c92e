//! Agent governance state: permission mode, token budget, quota window.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Governance posture applied to every policy evaluation for an agent.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Permissive,
    Standard,
    Restrictive,
}

/// Window over which `tokens_consumed` accumulates before resetting.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
    Yearly,
    Lifetime,
}

impl QuotaPeriod {
    /// The next reset instant after `from`. `Lifetime` never resets.
    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            QuotaPeriod::Daily => Some(from + Duration::days(1)),
            QuotaPeriod::Monthly => {
                let (year, month) = if from.month() == 12 {
                    (from.year() + 1, 1)
                } else {
                    (from.year(), from.month() + 1)
                };
                // Day may not exist in the next month (e.g. Jan 31 -> Feb).
                Utc.with_ymd_and_hms(
                    year,
                    month,
                    from.day(),
                    from.hour(),
                    from.minute(),
                    from.second(),
                )
                .single()
                .or(Some(from + Duration::days(30)))
            }
            QuotaPeriod::Yearly => Utc
                .with_ymd_and_hms(
                    from.year() + 1,
                    from.month(),
                    from.day(),
                    from.hour(),
                    from.minute(),
                    from.second(),
                )
                .single()
                .or(Some(from + Duration::days(365))),
            QuotaPeriod::Lifetime => None,
        }
    }
}

/// Persisted governance state for one agent.
///
/// Invariant: `tokens_consumed <= token_budget`. The consume path normalizes
/// the reset window before charging, inside a single transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub agent_id: String,
    pub permission_mode: PermissionMode,
    pub token_budget: u64,
    pub quota_period: QuotaPeriod,
    pub tokens_consumed: u64,
    pub budget_reset_at: Option<DateTime<Utc>>,
}

impl AgentState {
    /// Default state for an agent first seen through channel creation.
    pub fn bootstrap(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            permission_mode: PermissionMode::Standard,
            token_budget: 200_000,
            quota_period: QuotaPeriod::Daily,
            tokens_consumed: 0,
            budget_reset_at: None,
        }
    }

    /// Tokens still available under the current window.
    pub fn remaining(&self) -> u64 {
        self.token_budget.saturating_sub(self.tokens_consumed)
    }
}

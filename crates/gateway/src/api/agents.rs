//! Agent endpoints: the audit trail, newest first.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use pa_domain::id;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AuditsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn audits(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<AuditsQuery>,
) -> Response {
    let agent_id = id::branded(id::AGENT_PREFIX, &agent_id);
    match state.storage.governance.list_audits(&agent_id, query.limit) {
        Ok(entries) => Json(serde_json::json!({ "audits": entries })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.code() })),
        )
            .into_response(),
    }
}

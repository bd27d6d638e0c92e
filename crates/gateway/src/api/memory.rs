//! Memory endpoints: search (paginated), encode, forget.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use pa_domain::id;
use pa_domain::memory::{MemoryDraft, MemorySearchQuery};

use crate::state::AppState;

fn internal(err: &pa_domain::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.code() })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub agent_id: String,
    #[serde(flatten)]
    pub query: MemorySearchQuery,
}

pub async fn search(State(state): State<AppState>, Json(body): Json<SearchRequest>) -> Response {
    let agent_id = id::branded(id::AGENT_PREFIX, &body.agent_id);
    match state.storage.memory.search(&agent_id, &body.query) {
        Ok(page) => Json(serde_json::json!(page)).into_response(),
        Err(err) => internal(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct EncodeRequest {
    pub agent_id: String,
    pub items: Vec<MemoryDraft>,
}

pub async fn encode(State(state): State<AppState>, Json(body): Json<EncodeRequest>) -> Response {
    let agent_id = id::branded(id::AGENT_PREFIX, &body.agent_id);
    match state.storage.memory.encode(&agent_id, &body.items, Utc::now()) {
        Ok(ids) => Json(serde_json::json!({ "memory_item_ids": ids })).into_response(),
        Err(err) => internal(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct ForgetRequest {
    pub agent_id: String,
    pub cutoff: DateTime<Utc>,
}

pub async fn forget(State(state): State<AppState>, Json(body): Json<ForgetRequest>) -> Response {
    let agent_id = id::branded(id::AGENT_PREFIX, &body.agent_id);
    match state.storage.memory.forget(&agent_id, body.cutoff) {
        Ok(deleted) => Json(serde_json::json!({ "deleted_count": deleted })).into_response(),
        Err(err) => internal(&err),
    }
}

//! HTTP surface.
//!
//! - `GET  /health`
//! - `POST /channels/{channelId}/create`
//! - `POST /channels/{channelId}/messages` (SSE)
//! - `POST /channels/{channelId}/history`
//! - schedules, memory, and audit endpoints (see the submodules)

pub mod agents;
pub mod channels;
pub mod memory;
pub mod schedules;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/channels/:channel_id/create", post(channels::create))
        .route("/channels/:channel_id/messages", post(channels::messages))
        .route("/channels/:channel_id/history", post(channels::history))
        .route("/schedules", post(schedules::upsert).get(schedules::list))
        .route("/schedules/:schedule_id/trigger", post(schedules::trigger))
        .route(
            "/schedules/:schedule_id/executions",
            get(schedules::executions),
        )
        .route("/memory/search", post(memory::search))
        .route("/memory/encode", post(memory::encode))
        .route("/memory/forget", post(memory::forget))
        .route("/agents/:agent_id/audits", get(agents::audits))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "personal-agent",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

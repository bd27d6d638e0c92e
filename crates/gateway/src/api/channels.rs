//! Channel endpoints: create, message streaming (SSE), history.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use serde::Deserialize;

use pa_domain::channel::ChannelType;
use pa_domain::event::TurnEvent;
use pa_domain::id;
use pa_domain::Error;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub channel_type: ChannelType,
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

/// Build a standardized JSON error response: `{ "error": <code>, ... }`.
fn api_error(status: StatusCode, err: &Error) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": err.code(),
            "message": err.to_string(),
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /channels/{channelId}/create
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(body): Json<CreateChannelRequest>,
) -> Response {
    let channel_id = id::branded(id::CHANNEL_PREFIX, &channel_id);
    let client = state.channel_client(&channel_id);

    let primary_key = format!("create:{}", body.agent_id);
    let payload = serde_json::json!({
        "channel_type": body.channel_type,
        "agent_id": body.agent_id,
    });

    match client.persisted_call("create", &primary_key, payload).await {
        Ok(_) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /channels/{channelId}/messages (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn messages(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Response {
    let channel_id = id::branded(id::CHANNEL_PREFIX, &channel_id);
    let client = state.channel_client(&channel_id);

    let rx = client.stream_call(
        "send_message",
        None,
        serde_json::json!({ "content": body.content }),
    );

    match rx {
        Ok(rx) => Sse::new(sse_stream(rx))
            .keep_alive(KeepAlive::default())
            .into_response(),
        Err(err) => {
            // Could not even enqueue; emit a single turn.failed frame so
            // stream consumers see a uniform shape.
            let event = TurnEvent::failed(&err);
            let stream = futures_util::stream::once(async move {
                Ok::<_, std::convert::Infallible>(encode_frame(&event))
            });
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

/// One SSE frame per turn event: `event:` is the type, `id:` the
/// sequence, `data:` the JSON body. A terminal stream error becomes a
/// trailing `turn.failed` frame.
fn sse_stream(
    mut rx: tokio::sync::mpsc::Receiver<pa_entity::StreamItem>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(item) = rx.recv().await {
            match item {
                Ok(event) => yield Ok(encode_frame(&event)),
                Err(err) => {
                    yield Ok(encode_frame(&TurnEvent::failed(&err)));
                    break;
                }
            }
        }
    }
}

fn encode_frame(event: &TurnEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    Event::default()
        .event(event.event_type())
        .id(event.sequence().to_string())
        .data(data)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /channels/{channelId}/history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn history(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Response {
    let channel_id = id::branded(id::CHANNEL_PREFIX, &channel_id);
    let client = state.channel_client(&channel_id);

    match client.call("get_history", serde_json::Value::Null).await {
        Ok(turns) => Json(turns).into_response(),
        Err(err @ Error::ChannelNotFound { .. }) => api_error(StatusCode::NOT_FOUND, &err),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

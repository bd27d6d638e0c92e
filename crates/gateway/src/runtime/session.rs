//! Session entity: the single writer over one session's turns.

use async_trait::async_trait;
use serde_json::Value;

use pa_entity::{EntityHandler, StreamSender};
use pa_domain::{Error, Result};

use crate::runtime::workflow::{process_turn, project_events, TurnRequest};
use crate::state::AppState;

pub struct SessionEntity {
    state: AppState,
}

impl SessionEntity {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl EntityHandler for SessionEntity {
    async fn handle_call(&self, op: &str, payload: Value) -> Result<Value> {
        match op {
            // Read-through: no session state is cached across calls.
            "get_history" => {
                let session_id = payload
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| bad_payload(op))?;
                let turns = self.state.storage.sessions.list_turns(session_id)?;
                serde_json::to_value(turns).map_err(|e| Error::persistence(e.to_string()))
            }
            other => Err(unknown_op(other)),
        }
    }

    async fn handle_stream(&self, op: &str, payload: Value, events: StreamSender) -> Result<()> {
        match op {
            "process_turn" => {
                let req: TurnRequest = serde_json::from_value(payload)
                    .map_err(|_| bad_payload("process_turn"))?;
                let result = process_turn(&self.state, &req).await?;
                for event in project_events(&result) {
                    // A dropped receiver cancels the stream; journalled
                    // activities are not rolled back.
                    if events.send(Ok(event)).await.is_err() {
                        tracing::debug!(turn_id = %req.turn_id, "turn stream cancelled by consumer");
                        break;
                    }
                }
                Ok(())
            }
            other => Err(unknown_op(other)),
        }
    }
}

pub(crate) fn bad_payload(op: &str) -> Error {
    Error::InternalServerError {
        message: format!("malformed payload for session op {op}"),
    }
}

pub(crate) fn unknown_op(op: &str) -> Error {
    Error::InternalServerError {
        message: format!("unknown session op {op}"),
    }
}

//! Channel facade: binds an external caller to an
//! (agent, session, conversation) triple and relays turn streams.
//!
//! The facade holds a session entity *client*, never a session object;
//! cross-entity streaming rides a direct in-process channel so no stream
//! traverses two mailboxes.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use pa_domain::agent::AgentState;
use pa_domain::channel::{ChannelRecord, ChannelType};
use pa_domain::id;
use pa_domain::turn::SessionState;
use pa_domain::{Error, Result};
use pa_entity::{EntityHandler, StreamSender};

use crate::runtime::session::{bad_payload, unknown_op};
use crate::runtime::workflow::TurnRequest;
use crate::state::{AppState, SESSION_TOKEN_CAPACITY};

pub struct ChannelEntity {
    state: AppState,
    channel_id: String,
}

impl ChannelEntity {
    pub fn new(state: AppState, channel_id: String) -> Self {
        Self { state, channel_id }
    }
}

#[derive(Deserialize)]
struct CreatePayload {
    channel_type: ChannelType,
    agent_id: String,
}

#[derive(Deserialize)]
struct SendMessagePayload {
    content: String,
}

#[async_trait]
impl EntityHandler for ChannelEntity {
    async fn handle_call(&self, op: &str, payload: Value) -> Result<Value> {
        match op {
            "create" => {
                let payload: CreatePayload =
                    serde_json::from_value(payload).map_err(|_| bad_payload(op))?;
                self.create_channel(payload)
            }
            "get_history" => self.get_history(),
            other => Err(unknown_op(other)),
        }
    }

    async fn handle_stream(&self, op: &str, payload: Value, events: StreamSender) -> Result<()> {
        match op {
            "send_message" => {
                let payload: SendMessagePayload =
                    serde_json::from_value(payload).map_err(|_| bad_payload(op))?;
                self.send_message(payload.content, events).await
            }
            other => Err(unknown_op(other)),
        }
    }
}

impl ChannelEntity {
    /// Idempotent channel creation. Order matters: agent state, then
    /// session, then the channel record — a crash leaves only prefixes
    /// that the retry completes.
    fn create_channel(&self, payload: CreatePayload) -> Result<Value> {
        let agent_id = id::branded(id::AGENT_PREFIX, &payload.agent_id);

        if self.state.storage.channels.get(&self.channel_id)?.is_some() {
            // The channel exists; still make sure its agent has state.
            self.ensure_agent_state(&agent_id)?;
            return Ok(serde_json::json!({ "ok": true }));
        }

        let session_id = id::session_for_channel(&self.channel_id);
        let conversation_id = id::conversation_for_channel(&self.channel_id);

        self.ensure_agent_state(&agent_id)?;
        self.state.storage.sessions.start_session(&SessionState {
            session_id: session_id.clone(),
            conversation_id: conversation_id.clone(),
            token_capacity: SESSION_TOKEN_CAPACITY,
            tokens_used: 0,
        })?;
        self.state.storage.channels.create(&ChannelRecord {
            channel_id: self.channel_id.clone(),
            channel_type: payload.channel_type,
            agent_id,
            active_session_id: session_id,
            active_conversation_id: conversation_id,
            created_at: Utc::now(),
        })?;

        tracing::info!(channel_id = %self.channel_id, "channel created");
        Ok(serde_json::json!({ "ok": true }))
    }

    fn ensure_agent_state(&self, agent_id: &str) -> Result<()> {
        if self.state.storage.agents.get(agent_id)?.is_none() {
            self.state
                .storage
                .agents
                .upsert(&AgentState::bootstrap(agent_id))?;
        }
        Ok(())
    }

    fn get_history(&self) -> Result<Value> {
        let record = self.lookup_channel()?;
        let turns = self
            .state
            .storage
            .sessions
            .list_turns(&record.active_session_id)?;
        serde_json::to_value(turns).map_err(|e| Error::persistence(e.to_string()))
    }

    /// Mint a turn id, dispatch to the session entity's streaming
    /// `process_turn`, and relay its events 1:1. Entity-transport errors
    /// are mapped to `TurnModelFailure`.
    async fn send_message(&self, content: String, events: StreamSender) -> Result<()> {
        let record = self.lookup_channel()?;
        let turn_id = id::mint_turn_id();

        let request = TurnRequest {
            turn_id: turn_id.clone(),
            agent_id: record.agent_id.clone(),
            session_id: record.active_session_id.clone(),
            conversation_id: record.active_conversation_id.clone(),
            content,
            created_at: Utc::now(),
        };
        let payload =
            serde_json::to_value(&request).map_err(|e| Error::persistence(e.to_string()))?;

        let session = self.state.session_client(&record.active_session_id);
        let mut rx = session
            .stream_call("process_turn", Some(&turn_id), payload)
            .map_err(|err| map_transport_error(&turn_id, err))?;

        while let Some(item) = rx.recv().await {
            let item = item.map_err(|err| map_transport_error(&turn_id, err));
            match item {
                Ok(event) => {
                    if events.send(Ok(event)).await.is_err() {
                        // Client went away; sever the upstream stream.
                        drop(rx);
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn lookup_channel(&self) -> Result<ChannelRecord> {
        self.state
            .storage
            .channels
            .get(&self.channel_id)?
            .ok_or_else(|| Error::ChannelNotFound {
                channel_id: self.channel_id.clone(),
            })
    }
}

/// Entity-runtime transport failures surface as turn failures on the
/// stream, per the facade contract.
fn map_transport_error(turn_id: &str, err: Error) -> Error {
    match err {
        Error::MailboxFull { .. } => Error::TurnModelFailure {
            turn_id: turn_id.to_string(),
            reason: "session_entity_mailbox_full".into(),
        },
        Error::AlreadyProcessingMessage { .. } => Error::TurnModelFailure {
            turn_id: turn_id.to_string(),
            reason: "session_entity_already_processing".into(),
        },
        Error::PersistenceError { message } => Error::TurnModelFailure {
            turn_id: turn_id.to_string(),
            reason: format!("persistence: {message}"),
        },
        other => other,
    }
}

//! Mailbox envelope shapes and message lifecycle.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use pa_domain::event::TurnEvent;
use pa_domain::Result;

/// One element of a streaming reply: a value, or the terminal error.
pub type StreamItem = Result<TurnEvent>;

/// Producer half handed to streaming handlers.
pub type StreamSender = mpsc::Sender<StreamItem>;

/// A message travelling through an entity mailbox.
///
/// Lifecycle: Enqueued (in the mailbox) -> InFlight (picked up by the
/// entity task) -> Completed / Failed (reply sent) or Cancelled (reply
/// receiver dropped).
pub(crate) enum Envelope {
    /// Request/reply with no durable tracking; used for reads.
    Call {
        op: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value>>,
        seq: u64,
    },
    /// Request/reply recorded under a primary key; the handler runs at
    /// most once per key and duplicates receive the recorded reply.
    PersistedCall {
        op: String,
        primary_key: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value>>,
        seq: u64,
    },
    /// Reply is a lazy sequence of values plus a terminal error. The
    /// mailbox drains only when the stream closes.
    StreamCall {
        op: String,
        /// When set, a second stream for the same key is rejected with
        /// `AlreadyProcessingMessage` while this one is live.
        primary_key: Option<String>,
        payload: Value,
        events: StreamSender,
        seq: u64,
    },
}

impl Envelope {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Envelope::Call { .. } => "call",
            Envelope::PersistedCall { .. } => "persisted_call",
            Envelope::StreamCall { .. } => "stream_call",
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        match self {
            Envelope::Call { seq, .. }
            | Envelope::PersistedCall { seq, .. }
            | Envelope::StreamCall { seq, .. } => *seq,
        }
    }
}

//! Actor-style entity runtime: single-writer dispatch per key, bounded
//! mailboxes, journal-backed deduplication of persisted RPCs, and
//! streaming RPCs over in-process channels.
//!
//! An entity is identified by `(entity_type, entity_key)`. Each live entity
//! has exactly one mailbox and one processing task; messages to the same
//! key are handled strictly in enqueue order. A streaming call holds the
//! mailbox until its stream closes, which is what makes the session entity
//! a single writer over its chat history.

mod message;
mod runtime;

pub use message::{StreamItem, StreamSender};
pub use runtime::{EntityClient, EntityHandler, EntityRuntime, MAILBOX_CAPACITY};

/// Journal execution id under which an entity's persisted RPCs are
/// recorded: `entity:{type}:{key}`.
pub fn execution_id_for(entity_type: &str, entity_key: &str) -> String {
    format!("entity:{entity_type}:{entity_key}")
}

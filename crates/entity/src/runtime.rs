//! Entity directory, mailbox tasks, and client handles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use pa_domain::{Error, Result};
use pa_storage::{JournalStatus, JournalStore};

use crate::execution_id_for;
use crate::message::{Envelope, StreamSender};

/// Bounded mailbox size; a full mailbox rejects with `MailboxFull`.
pub const MAILBOX_CAPACITY: usize = 64;

/// Behaviour of one entity type. Implementations never cache persisted
/// state across calls; every handler invocation reads through the ports.
#[async_trait]
pub trait EntityHandler: Send + Sync + 'static {
    /// Request/reply operation (used by both plain and persisted RPCs).
    async fn handle_call(&self, op: &str, payload: Value) -> Result<Value>;

    /// Streaming operation; values are written to `events`. Returning `Err`
    /// delivers the terminal error to the consumer.
    async fn handle_stream(&self, op: &str, payload: Value, events: StreamSender) -> Result<()>;
}

struct EntityHandle {
    tx: mpsc::Sender<Envelope>,
    /// Primary keys of streams currently enqueued or in flight.
    live_streams: Arc<Mutex<HashSet<String>>>,
}

/// Process-wide entity directory. Created once at startup and passed
/// explicitly; entities are spawned on first use and stay resident.
pub struct EntityRuntime {
    journal: JournalStore,
    entities: Mutex<HashMap<(String, String), EntityHandle>>,
    /// Monotonic enqueue counter, the tie-break for simultaneous arrivals.
    seq: Arc<AtomicU64>,
}

impl EntityRuntime {
    pub fn new(journal: JournalStore) -> Self {
        Self {
            journal,
            entities: Mutex::new(HashMap::new()),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get or spawn the entity for `(entity_type, key)` and hand back a
    /// client for its mailbox. The factory runs only when the entity is
    /// not yet resident.
    pub fn client(
        &self,
        entity_type: &str,
        entity_key: &str,
        make_handler: impl FnOnce() -> Arc<dyn EntityHandler>,
    ) -> EntityClient {
        let mut entities = self.entities.lock();
        let handle = entities
            .entry((entity_type.to_string(), entity_key.to_string()))
            .or_insert_with(|| {
                spawn_entity(
                    entity_type,
                    entity_key,
                    make_handler(),
                    self.journal.clone(),
                )
            });

        EntityClient {
            entity: format!("{entity_type}:{entity_key}"),
            tx: handle.tx.clone(),
            live_streams: handle.live_streams.clone(),
            seq: self.seq.clone(),
        }
    }
}

/// Client handle for one entity's mailbox. Cloneable and cheap.
#[derive(Clone)]
pub struct EntityClient {
    entity: String,
    tx: mpsc::Sender<Envelope>,
    live_streams: Arc<Mutex<HashSet<String>>>,
    seq: Arc<AtomicU64>,
}

impl EntityClient {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Non-persisted request/reply.
    pub async fn call(&self, op: &str, payload: Value) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Envelope::Call {
            op: op.to_string(),
            payload,
            reply: reply_tx,
            seq: self.next_seq(),
        })?;
        reply_rx.await.map_err(|_| cancelled(&self.entity))?
    }

    /// Persisted request/reply: at most one handler run per primary key,
    /// duplicates receive the recorded reply.
    pub async fn persisted_call(
        &self,
        op: &str,
        primary_key: &str,
        payload: Value,
    ) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Envelope::PersistedCall {
            op: op.to_string(),
            primary_key: primary_key.to_string(),
            payload,
            reply: reply_tx,
            seq: self.next_seq(),
        })?;
        reply_rx.await.map_err(|_| cancelled(&self.entity))?
    }

    /// Streaming request. Returns the consumer half of the event channel;
    /// dropping it cancels the stream.
    pub fn stream_call(
        &self,
        op: &str,
        primary_key: Option<&str>,
        payload: Value,
    ) -> Result<mpsc::Receiver<crate::StreamItem>> {
        if let Some(key) = primary_key {
            let mut live = self.live_streams.lock();
            if !live.insert(key.to_string()) {
                return Err(Error::AlreadyProcessingMessage {
                    entity: self.entity.clone(),
                    primary_key: key.to_string(),
                });
            }
        }

        let (events_tx, events_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let envelope = Envelope::StreamCall {
            op: op.to_string(),
            primary_key: primary_key.map(String::from),
            payload,
            events: events_tx,
            seq: self.next_seq(),
        };

        if let Err(err) = self.enqueue(envelope) {
            if let Some(key) = primary_key {
                self.live_streams.lock().remove(key);
            }
            return Err(err);
        }
        Ok(events_rx)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        tracing::debug!(
            entity = %self.entity,
            kind = envelope.kind(),
            seq = envelope.seq(),
            "entity message enqueued"
        );
        self.tx
            .try_send(envelope)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::MailboxFull {
                    entity: self.entity.clone(),
                },
                mpsc::error::TrySendError::Closed(_) => Error::InternalServerError {
                    message: format!("entity {} mailbox closed", self.entity),
                },
            })
    }
}

fn cancelled(entity: &str) -> Error {
    Error::InternalServerError {
        message: format!("entity {entity} dropped the reply"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entity task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn spawn_entity(
    entity_type: &str,
    entity_key: &str,
    handler: Arc<dyn EntityHandler>,
    journal: JournalStore,
) -> EntityHandle {
    let (tx, mut rx) = mpsc::channel::<Envelope>(MAILBOX_CAPACITY);
    let live_streams: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let entity = format!("{entity_type}:{entity_key}");
    let execution_id = execution_id_for(entity_type, entity_key);
    let streams_for_task = live_streams.clone();

    tokio::spawn(async move {
        tracing::debug!(entity = %entity, "entity task started");
        while let Some(envelope) = rx.recv().await {
            let seq = envelope.seq();
            let kind = envelope.kind();
            tracing::debug!(entity = %entity, kind, seq, "entity message in flight");
            match envelope {
                Envelope::Call {
                    op,
                    payload,
                    reply,
                    ..
                } => {
                    let result = handler.handle_call(&op, payload).await;
                    log_outcome(&entity, &op, seq, &result);
                    let _ = reply.send(result);
                }
                Envelope::PersistedCall {
                    op,
                    primary_key,
                    payload,
                    reply,
                    ..
                } => {
                    let result = persisted_dispatch(
                        handler.as_ref(),
                        &journal,
                        &execution_id,
                        &op,
                        &primary_key,
                        payload,
                    )
                    .await;
                    log_outcome(&entity, &op, seq, &result);
                    let _ = reply.send(result);
                }
                Envelope::StreamCall {
                    op,
                    primary_key,
                    payload,
                    events,
                    ..
                } => {
                    let result = handler.handle_stream(&op, payload, events.clone()).await;
                    if let Err(err) = result {
                        tracing::debug!(
                            entity = %entity, op = %op, seq,
                            code = err.code(),
                            "entity stream failed"
                        );
                        // Terminal error; the consumer may already be gone.
                        let _ = events.send(Err(err)).await;
                    } else {
                        tracing::debug!(entity = %entity, op = %op, seq, "entity stream completed");
                    }
                    if let Some(key) = primary_key {
                        streams_for_task.lock().remove(&key);
                    }
                }
            }
        }
        tracing::debug!(entity = %entity, "entity task stopped");
    });

    EntityHandle { tx, live_streams }
}

/// Replay-or-run for a persisted RPC: the journal entry under
/// `(entity execution id, "rpc:{op}", primary_key)` is the commit point.
async fn persisted_dispatch(
    handler: &dyn EntityHandler,
    journal: &JournalStore,
    execution_id: &str,
    op: &str,
    primary_key: &str,
    payload: Value,
) -> Result<Value> {
    let activity = format!("rpc:{op}");

    if let Some(entry) = journal.lookup(execution_id, &activity, primary_key)? {
        return match entry.status {
            JournalStatus::Complete => {
                let raw = entry.serialized_result.unwrap_or_else(|| "null".into());
                serde_json::from_str(&raw)
                    .map_err(|e| Error::persistence(format!("journal replay: {e}")))
            }
            JournalStatus::Failed => {
                let raw = entry.serialized_error.unwrap_or_default();
                Err(serde_json::from_str(&raw).unwrap_or(Error::InternalServerError {
                    message: format!("journalled failure for {activity}:{primary_key}"),
                }))
            }
        };
    }

    let now = chrono::Utc::now();
    match handler.handle_call(op, payload).await {
        Ok(value) => {
            let serialized = serde_json::to_string(&value)
                .map_err(|e| Error::persistence(e.to_string()))?;
            journal.record_complete(execution_id, &activity, primary_key, &serialized, now)?;
            Ok(value)
        }
        Err(err) => {
            let serialized = serde_json::to_string(&err)
                .map_err(|e| Error::persistence(e.to_string()))?;
            journal.record_failure(execution_id, &activity, primary_key, &serialized, now)?;
            Err(err)
        }
    }
}

fn log_outcome(entity: &str, op: &str, seq: u64, result: &Result<Value>) {
    match result {
        Ok(_) => tracing::debug!(entity = %entity, op = %op, seq, "entity message completed"),
        Err(err) => tracing::debug!(
            entity = %entity, op = %op, seq,
            code = err.code(),
            "entity message failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_domain::event::TurnEvent;
    use pa_storage::Storage;
    use std::time::Duration;

    /// Counts handler runs; used to prove at-most-once semantics.
    struct CountingHandler {
        runs: AtomicU64,
        delay: Option<Duration>,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                runs: AtomicU64::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl EntityHandler for CountingHandler {
        async fn handle_call(&self, op: &str, payload: Value) -> Result<Value> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            match op {
                "fail" => Err(Error::InternalServerError {
                    message: "boom".into(),
                }),
                _ => Ok(serde_json::json!({ "op": op, "run": run, "payload": payload })),
            }
        }

        async fn handle_stream(
            &self,
            _op: &str,
            _payload: Value,
            events: StreamSender,
        ) -> Result<()> {
            for sequence in 1..=3 {
                let _ = events
                    .send(Ok(TurnEvent::AssistantDelta {
                        sequence,
                        text: format!("chunk {sequence}"),
                    }))
                    .await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }
    }

    fn runtime() -> EntityRuntime {
        EntityRuntime::new(Storage::open_in_memory().unwrap().journal)
    }

    #[tokio::test]
    async fn call_reply_roundtrip() {
        let rt = runtime();
        let client = rt.client("session", "session:s1", || Arc::new(CountingHandler::new()));
        let reply = client.call("echo", serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(reply["op"], "echo");
        assert_eq!(reply["payload"]["x"], 1);
    }

    #[tokio::test]
    async fn handler_error_keeps_entity_alive() {
        let rt = runtime();
        let client = rt.client("session", "session:s1", || Arc::new(CountingHandler::new()));
        let err = client.call("fail", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), "InternalServerError");
        // Next message is handled normally.
        assert!(client.call("ok", Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn persisted_call_runs_handler_once() {
        let rt = runtime();
        let client = rt.client("channel", "channel:c1", || Arc::new(CountingHandler::new()));

        let first = client
            .persisted_call("create", "create:agent:a1", Value::Null)
            .await
            .unwrap();
        let second = client
            .persisted_call("create", "create:agent:a1", Value::Null)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first["run"], 0);

        // A different primary key runs the handler again.
        let third = client
            .persisted_call("create", "create:agent:a2", Value::Null)
            .await
            .unwrap();
        assert_eq!(third["run"], 1);
    }

    #[tokio::test]
    async fn persisted_failure_replays_error() {
        let rt = runtime();
        let client = rt.client("channel", "channel:c1", || Arc::new(CountingHandler::new()));
        let first = client
            .persisted_call("fail", "create:a", Value::Null)
            .await
            .unwrap_err();
        let second = client
            .persisted_call("fail", "create:a", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn duplicate_persisted_call_waits_for_the_in_flight_first() {
        let rt = runtime();
        let handler = Arc::new(CountingHandler {
            runs: AtomicU64::new(0),
            delay: Some(Duration::from_millis(150)),
        });
        let handler_for_client = handler.clone();
        let client = rt.client("channel", "channel:c1", || handler_for_client);

        // First call reaches the handler and sits in its delay...
        let racing = client.clone();
        let first = tokio::spawn(async move {
            racing.persisted_call("create", "create:a", Value::Null).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // ...while the duplicate queues behind it in the mailbox.
        let racing = client.clone();
        let second = tokio::spawn(async move {
            racing.persisted_call("create", "create:a", Value::Null).await
        });

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        // The duplicate replayed the journal entry; the handler ran once.
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persisted_dedup_survives_new_entity_instance() {
        let storage = Storage::open_in_memory().unwrap();
        let rt = EntityRuntime::new(storage.journal.clone());
        let client = rt.client("channel", "channel:c1", || Arc::new(CountingHandler::new()));
        let first = client
            .persisted_call("create", "create:a", Value::Null)
            .await
            .unwrap();

        // A fresh runtime over the same journal replays without rerunning.
        let rt2 = EntityRuntime::new(storage.journal);
        let client2 = rt2.client("channel", "channel:c1", || Arc::new(CountingHandler::new()));
        let replay = client2
            .persisted_call("create", "create:a", Value::Null)
            .await
            .unwrap();
        assert_eq!(first, replay);
        assert_eq!(replay["run"], 0);
    }

    #[tokio::test]
    async fn stream_delivers_values_in_order() {
        let rt = runtime();
        let client = rt.client("session", "session:s1", || Arc::new(CountingHandler::new()));
        let mut rx = client
            .stream_call("process_turn", Some("turn:t1"), Value::Null)
            .unwrap();

        let mut texts = Vec::new();
        while let Some(item) = rx.recv().await {
            match item.unwrap() {
                TurnEvent::AssistantDelta { text, .. } => texts.push(text),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(texts, vec!["chunk 1", "chunk 2", "chunk 3"]);
    }

    #[tokio::test]
    async fn duplicate_live_stream_is_rejected() {
        let rt = runtime();
        let handler = Arc::new(CountingHandler {
            runs: AtomicU64::new(0),
            delay: Some(Duration::from_millis(200)),
        });
        let client = rt.client("session", "session:s1", || handler);

        let _rx = client
            .stream_call("process_turn", Some("turn:t1"), Value::Null)
            .unwrap();
        let err = client
            .stream_call("process_turn", Some("turn:t1"), Value::Null)
            .unwrap_err();
        assert_eq!(err.code(), "AlreadyProcessingMessage");

        // A different primary key is fine.
        assert!(client
            .stream_call("process_turn", Some("turn:t2"), Value::Null)
            .is_ok());
    }

    #[tokio::test]
    async fn stream_key_frees_after_completion() {
        let rt = runtime();
        let client = rt.client("session", "session:s1", || Arc::new(CountingHandler::new()));
        let mut rx = client
            .stream_call("process_turn", Some("turn:t1"), Value::Null)
            .unwrap();
        while rx.recv().await.is_some() {}
        // Give the task a beat to clear the live set.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client
            .stream_call("process_turn", Some("turn:t1"), Value::Null)
            .is_ok());
    }

    #[tokio::test]
    async fn full_mailbox_rejects() {
        let rt = runtime();
        let handler = Arc::new(CountingHandler {
            runs: AtomicU64::new(0),
            delay: Some(Duration::from_secs(5)),
        });
        let client = rt.client("session", "session:slow", || handler);

        // Occupy the handler, then let the entity task pull it off the queue.
        use futures_util::FutureExt;
        let _ = client.call("first", Value::Null).now_or_never();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Fill the mailbox behind the in-flight message. `now_or_never`
        // polls once, which performs the synchronous enqueue.
        for i in 0..MAILBOX_CAPACITY {
            let _ = client.call("op", serde_json::json!(i)).now_or_never();
        }

        let err = client.call("overflow", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), "MailboxFull");
    }

    #[tokio::test]
    async fn messages_are_serialized_per_key() {
        let rt = runtime();
        let client = rt.client("session", "session:s1", || Arc::new(CountingHandler::new()));
        let mut replies = Vec::new();
        for i in 0..10 {
            replies.push(client.call("op", serde_json::json!(i)).await.unwrap());
        }
        // Runs observed in enqueue order.
        for (i, reply) in replies.iter().enumerate() {
            assert_eq!(reply["run"], i as u64);
        }
    }
}

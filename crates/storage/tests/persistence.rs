//! On-disk behaviour: migrations at open, durability across reopen, and
//! journal replay surviving a restart.

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use pa_domain::agent::AgentState;
use pa_storage::{JournalStatus, Storage};

#[test]
fn state_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("agent.db");

    {
        let storage = Storage::open(&db_path).unwrap();
        let mut agent = AgentState::bootstrap("agent:a1");
        agent.token_budget = 1234;
        storage.agents.upsert(&agent).unwrap();
        storage
            .journal
            .record_complete(
                "workflow:session:s1",
                "InvokeModel",
                "turn:t1",
                "{\"text\":\"hi\"}",
                Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap(),
            )
            .unwrap();
    }

    // Re-opening applies migrations idempotently and sees the same rows.
    let storage = Storage::open(&db_path).unwrap();
    let agent = storage.agents.get("agent:a1").unwrap().unwrap();
    assert_eq!(agent.token_budget, 1234);

    let entry = storage
        .journal
        .lookup("workflow:session:s1", "InvokeModel", "turn:t1")
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, JournalStatus::Complete);
    assert_eq!(entry.serialized_result.as_deref(), Some("{\"text\":\"hi\"}"));
}

#[test]
fn missing_parent_directory_fails_cleanly() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("no/such/dir/agent.db");
    let err = Storage::open(&db_path).unwrap_err();
    assert_eq!(err.code(), "PersistenceError");
}

//! Shared fixtures: in-memory state with a scripted provider.

use std::sync::Arc;

use pa_domain::config::Config;
use pa_domain::turn::SessionState;
use pa_gateway::state::AppState;
use pa_providers::{mock::ScriptedResponse, ProviderRegistry, ScriptedProvider};
use pa_storage::Storage;

/// App state over an in-memory database and a provider that always
/// answers with `text`.
pub fn state_with_text(text: &str) -> AppState {
    state_with_script(vec![ScriptedResponse::Text(text.into())])
}

pub fn state_with_script(script: Vec<ScriptedResponse>) -> AppState {
    let config = Config::template();
    let providers = Arc::new(ProviderRegistry::with_provider(
        &config,
        "openai",
        Arc::new(ScriptedProvider::new(script)),
    ));
    AppState::new(
        Arc::new(config),
        Storage::open_in_memory().unwrap(),
        providers,
    )
}

/// Start a bare session (no channel) for direct workflow tests.
pub fn start_session(state: &AppState, session_id: &str, capacity: u64) {
    state
        .storage
        .sessions
        .start_session(&SessionState {
            session_id: session_id.into(),
            conversation_id: format!("conv:{session_id}"),
            token_capacity: capacity,
            tokens_used: 0,
        })
        .unwrap();
}

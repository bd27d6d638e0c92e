//! Memory items and the search/pagination contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemoryTier {
    #[serde(rename = "SemanticMemory")]
    Semantic,
    #[serde(rename = "EpisodicMemory")]
    Episodic,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemoryScope {
    #[serde(rename = "SessionScope")]
    Session,
    #[serde(rename = "ProjectScope")]
    Project,
    #[serde(rename = "GlobalScope")]
    Global,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemorySource {
    #[serde(rename = "UserSource")]
    User,
    #[serde(rename = "SystemSource")]
    System,
    #[serde(rename = "AgentSource")]
    Agent,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Internal,
    Confidential,
    Restricted,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub memory_item_id: String,
    pub agent_id: String,
    pub tier: MemoryTier,
    pub scope: MemoryScope,
    pub source: MemorySource,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_by_turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub sensitivity: Sensitivity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New item payload for `encode`; the store mints the id and stamps times.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryDraft {
    pub tier: MemoryTier,
    pub scope: MemoryScope,
    pub source: MemorySource,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by_turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: Sensitivity,
}

fn default_sensitivity() -> Sensitivity {
    Sensitivity::Internal
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemorySortOrder {
    CreatedAsc,
    CreatedDesc,
}

impl Default for MemorySortOrder {
    fn default() -> Self {
        Self::CreatedDesc
    }
}

/// Substring search with keyset pagination.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct MemorySearchQuery {
    /// Case-insensitive substring filter on `content`. Empty matches all.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub sort: MemorySortOrder,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Opaque cursor from a previous page. Malformed values mean "no cursor".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

fn default_limit() -> usize {
    20
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemorySearchPage {
    pub items: Vec<MemoryItem>,
    /// Set when more pages remain; walk until `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Total matches across all pages, computed on every page.
    pub total_count: u64,
}

//! Parameter definitions for the long-term memory tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `store_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StoreMemoryParams {
    #[schemars(description = "User who owns this memory")]
    pub user_id: String,

    #[schemars(description = "The content to store")]
    pub content: String,

    #[schemars(
        description = "Category: 'episodic', 'semantic', 'procedural', or 'preference'. Auto-classified if not provided."
    )]
    pub memory_category: Option<String>,

    #[schemars(description = "Subtype within the category (auto-classified if not provided)")]
    pub memory_subtype: Option<String>,

    #[schemars(description = "Importance score 0.0-1.0 (default: classifier's estimate or 0.5)")]
    pub importance: Option<f64>,

    #[schemars(description = "Comma-separated entities (e.g. 'table:users,database:prod_db')")]
    pub entities: Option<String>,

    #[schemars(description = "ISO timestamp of when the event occurred (for episodic memories)")]
    pub event_time: Option<String>,

    #[schemars(description = "Optional JSON metadata blob, passed through verbatim")]
    pub metadata: Option<serde_json::Value>,

    #[schemars(description = "Session ID that created this memory")]
    pub source_session: Option<String>,
}

/// Parameters for the `recall_memories` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecallMemoriesParams {
    #[schemars(description = "User whose memories to search")]
    pub user_id: String,

    #[schemars(description = "Natural language query for semantic search")]
    pub query: String,

    #[schemars(description = "Comma-separated categories to filter (e.g. 'episodic,semantic')")]
    pub memory_categories: Option<String>,

    #[schemars(description = "Comma-separated subtypes to filter (e.g. 'decision,entity')")]
    pub memory_subtypes: Option<String>,

    #[schemars(description = "Comma-separated entities for exact matching (e.g. 'table:users')")]
    pub entities: Option<String>,

    #[schemars(description = "Maximum memories to return (default: 10)")]
    pub limit: Option<usize>,

    #[schemars(description = "Minimum cosine similarity (default: 0.7)")]
    pub min_similarity: Option<f64>,

    #[schemars(description = "Include related memories for each result (default: false)")]
    pub include_related: Option<bool>,

    #[schemars(description = "Session to attribute access-log entries to")]
    pub session_id: Option<String>,
}

/// Parameters for the `update_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UpdateMemoryParams {
    #[schemars(description = "The memory to update")]
    pub memory_id: String,

    #[schemars(description = "User who owns the memory")]
    pub user_id: String,

    #[schemars(description = "New content (re-embedded and re-validated if changed)")]
    pub content: Option<String>,

    #[schemars(description = "New importance score 0.0-1.0")]
    pub importance: Option<f64>,

    #[schemars(description = "New comma-separated entities (replaces the existing set)")]
    pub entities: Option<String>,

    #[schemars(description = "Metadata to merge into the existing blob, key by key")]
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for the `forget_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ForgetMemoryParams {
    #[schemars(description = "The memory to delete")]
    pub memory_id: String,

    #[schemars(description = "User who owns the memory")]
    pub user_id: String,

    #[schemars(
        description = "If true, permanently delete the row and its relationships. Default: soft delete."
    )]
    pub hard_delete: Option<bool>,
}

/// Parameters for the `forget_all_user_memories` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ForgetAllUserMemoriesParams {
    #[schemars(description = "User whose data to erase across all tables")]
    pub user_id: String,

    #[schemars(description = "Must be the literal string 'CONFIRM_DELETE_ALL'")]
    pub confirmation: String,
}

//! Parameter definitions for the working-memory tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `init_session` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct InitSessionParams {
    #[schemars(description = "Unique identifier for the user")]
    pub user_id: String,

    #[schemars(description = "Optional session ID; a UUID is generated if not provided")]
    pub session_id: Option<String>,

    #[schemars(description = "Optional organization ID for multi-tenant isolation")]
    pub org_id: Option<String>,

    #[schemars(description = "Maximum tokens for working memory (default: 8000)")]
    pub max_tokens: Option<i64>,
}

/// Parameters for the `add_to_working_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AddToWorkingMemoryParams {
    #[schemars(description = "The session to add to (auto-created if missing)")]
    pub session_id: String,

    #[schemars(description = "User who owns the session")]
    pub user_id: String,

    #[schemars(description = "The content to store")]
    pub content: String,

    #[schemars(
        description = "Content type: 'message', 'task_state', 'scratchpad', 'system', or 'retrieved_memory'. Default: 'message'."
    )]
    pub content_type: Option<String>,

    #[schemars(description = "If true, the item is protected from eviction")]
    pub pinned: Option<bool>,

    #[schemars(description = "Initial relevance score 0.0-1.0 (default: 1.0)")]
    pub relevance_score: Option<f64>,
}

/// Parameters for the `get_working_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetWorkingMemoryParams {
    #[schemars(description = "The session to retrieve")]
    pub session_id: String,

    #[schemars(description = "Maximum tokens to return (session capacity if not specified)")]
    pub token_budget: Option<i64>,

    #[schemars(description = "Comma-separated content types to include (e.g. 'message,task_state')")]
    pub include_types: Option<String>,
}

/// Parameters for the `update_working_memory_item` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UpdateWorkingMemoryItemParams {
    #[schemars(description = "The item to update")]
    pub item_id: String,

    #[schemars(description = "The session containing the item")]
    pub session_id: String,

    #[schemars(description = "New pinned status")]
    pub pinned: Option<bool>,

    #[schemars(description = "New relevance score 0.0-1.0")]
    pub relevance_score: Option<f64>,
}

/// Parameters for the `clear_working_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ClearWorkingMemoryParams {
    #[schemars(description = "The session to clear")]
    pub session_id: String,

    #[schemars(
        description = "Promote durable items to long-term memory before deleting (default: true)"
    )]
    pub checkpoint_first: Option<bool>,
}

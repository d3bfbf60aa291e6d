//! Parameter definitions for the context-assembly tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `get_relevant_context` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetRelevantContextParams {
    #[schemars(description = "Current session ID")]
    pub session_id: String,

    #[schemars(description = "User ID for memory retrieval")]
    pub user_id: String,

    #[schemars(description = "The query/task to find relevant context for")]
    pub query: String,

    #[schemars(description = "Maximum tokens for the assembled context")]
    pub token_budget: i64,

    #[schemars(
        description = "Intent hint: 'how_to', 'what_happened', 'what_is', 'debug', 'general'. Auto-detected if not provided."
    )]
    pub query_intent: Option<String>,

    #[schemars(description = "Comma-separated entities to boost (e.g. 'table:users,file:api.py')")]
    pub focus_entities: Option<String>,
}

/// Parameters for the `checkpoint_working_memory` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CheckpointWorkingMemoryParams {
    #[schemars(description = "Session whose durable items to promote to long-term memory")]
    pub session_id: String,
}

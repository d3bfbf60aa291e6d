//! Parameter definitions for the analytics tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `get_stats` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetStatsParams {
    #[schemars(description = "Time window in minutes for recent service metrics (default: 60)")]
    pub time_window_minutes: Option<i64>,
}

/// Parameters for the `get_recent_calls` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetRecentCallsParams {
    #[schemars(description = "Service name: 'model' or 'store' (default: 'model')")]
    pub service: Option<String>,

    #[schemars(description = "Maximum calls to return (default: 50)")]
    pub limit: Option<usize>,
}

/// Parameters for the `get_memory_analytics` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetMemoryAnalyticsParams {
    #[schemars(description = "User whose memory usage to analyze")]
    pub user_id: String,
}

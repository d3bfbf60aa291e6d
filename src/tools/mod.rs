//! The MCP tool surface: fifteen operations over working memory, long-term
//! memory, context assembly, and analytics.
//!
//! Handlers are async; database and model work runs in `spawn_blocking`.
//! Model-dependent phases (embedding, classification, intent detection)
//! execute before the connection lock is taken, so model latency never
//! extends the write-lock scope. Failures are returned as the stable
//! `{code, message, hint?}` error object and recorded best-effort in the
//! tool error log.

pub mod context;
pub mod longterm;
pub mod stats;
pub mod working_memory;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::tool::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::EngramConfig;
use crate::context::ContextQuery;
use crate::db::retry::Deadline;
use crate::error::MemoryError;
use crate::memory::types::ContentType;
use crate::memory::{forget, recall, stats as memory_stats, store, working};
use crate::metrics::MetricsRegistry;
use crate::model::ModelGateway;
use crate::taxonomy::{Intent, MemoryCategory};

use context::{CheckpointWorkingMemoryParams, GetRelevantContextParams};
use longterm::{
    ForgetAllUserMemoriesParams, ForgetMemoryParams, RecallMemoriesParams, StoreMemoryParams,
    UpdateMemoryParams,
};
use stats::{GetMemoryAnalyticsParams, GetRecentCallsParams, GetStatsParams};
use working_memory::{
    AddToWorkingMemoryParams, ClearWorkingMemoryParams, GetWorkingMemoryParams,
    InitSessionParams, UpdateWorkingMemoryItemParams,
};

/// The Engram MCP tool handler. Holds the shared component instances (store
/// connection, model gateway, metrics registry, config).
#[derive(Clone)]
pub struct EngramTools {
    tool_router: ToolRouter<Self>,
    db: Arc<Mutex<Connection>>,
    model: Arc<ModelGateway>,
    metrics: Arc<MetricsRegistry>,
    config: Arc<EngramConfig>,
}

/// Split a comma-separated parameter into trimmed, non-empty values.
fn parse_csv(raw: Option<&str>) -> Option<Vec<String>> {
    let values: Vec<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    (!values.is_empty()).then_some(values)
}

fn parse_categories(
    raw: Option<&str>,
) -> Result<Option<Vec<MemoryCategory>>, MemoryError> {
    let Some(values) = parse_csv(raw) else {
        return Ok(None);
    };
    values
        .iter()
        .map(|v| v.parse().map_err(MemoryError::Validation))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn parse_content_types(raw: Option<&str>) -> Result<Option<Vec<ContentType>>, MemoryError> {
    let Some(values) = parse_csv(raw) else {
        return Ok(None);
    };
    values
        .iter()
        .map(|v| v.parse().map_err(MemoryError::Validation))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

#[tool_router]
impl EngramTools {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        model: Arc<ModelGateway>,
        metrics: Arc<MetricsRegistry>,
        config: Arc<EngramConfig>,
    ) -> Self {
        Self {
            tool_router: Self::tool_router(),
            db,
            model,
            metrics,
            config,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(Duration::from_secs(self.config.server.request_timeout_secs))
    }

    /// Run blocking core work, serialize the outcome, and log failures.
    async fn run<T, F>(
        &self,
        tool: &'static str,
        user: Option<String>,
        work: F,
    ) -> Result<String, String>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let joined = tokio::task::spawn_blocking(work).await.map_err(|e| {
            MemoryError::Internal(format!("task join failed: {e}"))
                .to_wire()
                .to_string()
        })?;

        match joined {
            Ok(value) => serde_json::to_string(&value).map_err(|e| {
                MemoryError::from(e).to_wire().to_string()
            }),
            Err(err) => {
                tracing::warn!(tool, code = err.code(), "tool call failed");
                if let Ok(conn) = db.try_lock() {
                    crate::metrics::log_tool_error(
                        &conn,
                        tool,
                        err.code(),
                        &err.to_string(),
                        user.as_deref(),
                    );
                }
                Err(err.to_wire().to_string())
            }
        }
    }

    // ── Working memory ───────────────────────────────────────────────────

    #[tool(description = "Initialize or resume a working-memory session. Sessions are created on first reference and carry a token capacity.")]
    async fn init_session(
        &self,
        Parameters(params): Parameters<InitSessionParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let config = Arc::clone(&self.config);
        let deadline = self.deadline();
        let user = params.user_id.clone();
        self.run("init_session", Some(user), move || {
            let mut conn = lock(&db)?;
            working::init_session(
                &mut conn,
                &config,
                deadline,
                &params.user_id,
                params.session_id.as_deref(),
                params.org_id.as_deref(),
                params.max_tokens,
            )
        })
        .await
    }

    #[tool(description = "Add an item to working memory. Overflow triggers eviction of the lowest-priority unpinned items; durable evictees are promoted to long-term memory first.")]
    async fn add_to_working_memory(
        &self,
        Parameters(params): Parameters<AddToWorkingMemoryParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let model = Arc::clone(&self.model);
        let config = Arc::clone(&self.config);
        let deadline = self.deadline();
        let user = params.user_id.clone();
        self.run("add_to_working_memory", Some(user), move || {
            let content_type: ContentType = params
                .content_type
                .as_deref()
                .unwrap_or("message")
                .parse()
                .map_err(MemoryError::Validation)?;
            let mut conn = lock(&db)?;
            working::append_item(
                &mut conn,
                &model,
                &config,
                deadline,
                working::AppendRequest {
                    session_id: params.session_id,
                    user_id: params.user_id,
                    content: params.content,
                    content_type,
                    pinned: params.pinned.unwrap_or(false),
                    relevance: params.relevance_score.unwrap_or(1.0),
                },
            )
        })
        .await
    }

    #[tool(description = "Retrieve working-memory items ordered by (pinned, relevance, recency), greedily filled up to a token budget.")]
    async fn get_working_memory(
        &self,
        Parameters(params): Parameters<GetWorkingMemoryParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        self.run("get_working_memory", None, move || {
            let include_types = parse_content_types(params.include_types.as_deref())?;
            let conn = lock(&db)?;
            working::get_items(
                &conn,
                &params.session_id,
                params.token_budget,
                include_types.as_deref(),
            )
        })
        .await
    }

    #[tool(description = "Update a working-memory item's pinned flag and/or relevance score.")]
    async fn update_working_memory_item(
        &self,
        Parameters(params): Parameters<UpdateWorkingMemoryItemParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let deadline = self.deadline();
        self.run("update_working_memory_item", None, move || {
            let mut conn = lock(&db)?;
            working::update_item(
                &mut conn,
                deadline,
                &params.session_id,
                &params.item_id,
                params.pinned,
                params.relevance_score,
            )?;
            Ok(serde_json::json!({"success": true, "item_id": params.item_id}))
        })
        .await
    }

    #[tool(description = "Clear a session's working memory. By default, items with relevance >= 0.5 or pinned are promoted to long-term memory first.")]
    async fn clear_working_memory(
        &self,
        Parameters(params): Parameters<ClearWorkingMemoryParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let model = Arc::clone(&self.model);
        let config = Arc::clone(&self.config);
        let deadline = self.deadline();
        self.run("clear_working_memory", None, move || {
            let mut conn = lock(&db)?;
            working::clear_session(
                &mut conn,
                &model,
                &config,
                deadline,
                &params.session_id,
                params.checkpoint_first.unwrap_or(true),
            )
        })
        .await
    }

    // ── Long-term memory ─────────────────────────────────────────────────

    #[tool(description = "Store a memory in long-term storage with auto-classification. Near-duplicates (cosine >= 0.95) merge with the existing memory instead of inserting.")]
    async fn store_memory(
        &self,
        Parameters(params): Parameters<StoreMemoryParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let model = Arc::clone(&self.model);
        let config = Arc::clone(&self.config);
        let deadline = self.deadline();
        let user = params.user_id.clone();
        self.run("store_memory", Some(user), move || {
            let category = params
                .memory_category
                .as_deref()
                .map(|c| c.parse::<MemoryCategory>().map_err(MemoryError::Validation))
                .transpose()?;
            let request = store::StoreRequest {
                user_id: params.user_id,
                content: params.content,
                category,
                subtype: params.memory_subtype,
                importance: params.importance,
                entities: parse_csv(params.entities.as_deref()),
                event_time: params.event_time,
                metadata: params.metadata,
                source_session: params.source_session,
                source_type: None,
            };
            // Classification and embedding happen before the write lock.
            let prepared = store::prepare_store(&model, deadline, request)?;
            let mut conn = lock(&db)?;
            store::commit_store(&mut conn, &config, deadline, prepared)
        })
        .await
    }

    #[tool(description = "Recall memories by semantic search, ranked by a composite of similarity, recency, access frequency, and importance.")]
    async fn recall_memories(
        &self,
        Parameters(params): Parameters<RecallMemoriesParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let model = Arc::clone(&self.model);
        let config = Arc::clone(&self.config);
        let deadline = self.deadline();
        let user = params.user_id.clone();
        self.run("recall_memories", Some(user), move || {
            let request = recall::RecallRequest {
                user_id: params.user_id,
                query_text: params.query.clone(),
                categories: parse_categories(params.memory_categories.as_deref())?,
                subtypes: parse_csv(params.memory_subtypes.as_deref()),
                entities: parse_csv(params.entities.as_deref()),
                limit: params.limit.unwrap_or(10),
                min_similarity: params.min_similarity,
                include_related: params.include_related.unwrap_or(false),
                session_id: params.session_id,
            };
            let query_embedding = model.embed(&params.query)?;
            let mut conn = lock(&db)?;
            recall::recall(&mut conn, &config, deadline, &query_embedding, &request)
        })
        .await
    }

    #[tool(description = "Update an existing memory. Content changes are re-validated and re-embedded; metadata is merged key by key.")]
    async fn update_memory(
        &self,
        Parameters(params): Parameters<UpdateMemoryParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let model = Arc::clone(&self.model);
        let deadline = self.deadline();
        let user = params.user_id.clone();
        self.run("update_memory", Some(user), move || {
            let mut conn = lock(&db)?;
            store::update_memory(
                &mut conn,
                &model,
                deadline,
                &params.memory_id,
                &params.user_id,
                store::UpdateRequest {
                    content: params.content,
                    importance: params.importance,
                    entities: parse_csv(params.entities.as_deref()),
                    metadata: params.metadata,
                },
            )
        })
        .await
    }

    #[tool(description = "Delete a memory. Soft delete by default (restorable until hard delete); hard delete removes the row and its relationships.")]
    async fn forget_memory(
        &self,
        Parameters(params): Parameters<ForgetMemoryParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let deadline = self.deadline();
        let user = params.user_id.clone();
        self.run("forget_memory", Some(user), move || {
            let mut conn = lock(&db)?;
            forget::forget_memory(
                &mut conn,
                deadline,
                &params.memory_id,
                &params.user_id,
                params.hard_delete.unwrap_or(false),
            )
        })
        .await
    }

    #[tool(description = "GDPR erasure: hard-delete all of a user's data across every table. Requires confirmation='CONFIRM_DELETE_ALL'.")]
    async fn forget_all_user_memories(
        &self,
        Parameters(params): Parameters<ForgetAllUserMemoriesParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let deadline = self.deadline();
        let user = params.user_id.clone();
        self.run("forget_all_user_memories", Some(user), move || {
            let mut conn = lock(&db)?;
            forget::forget_all_for_user(&mut conn, deadline, &params.user_id, &params.confirmation)
        })
        .await
    }

    // ── Context ──────────────────────────────────────────────────────────

    #[tool(description = "Assemble optimal context from working + long-term memory under a token budget, weighted by the detected query intent.")]
    async fn get_relevant_context(
        &self,
        Parameters(params): Parameters<GetRelevantContextParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let model = Arc::clone(&self.model);
        let config = Arc::clone(&self.config);
        let user = params.user_id.clone();
        self.run("get_relevant_context", Some(user), move || {
            // A valid hint wins; anything else falls back to detection.
            let intent = params
                .query_intent
                .as_deref()
                .and_then(|hint| hint.parse::<Intent>().ok())
                .unwrap_or_else(|| model.detect_intent(&params.query));
            let query_embedding = model.embed(&params.query)?;

            let query = ContextQuery {
                session_id: params.session_id,
                user_id: params.user_id,
                query_text: params.query,
                token_budget: params.token_budget,
                focus_entities: parse_csv(params.focus_entities.as_deref()).unwrap_or_default(),
            };
            let conn = lock(&db)?;
            crate::context::assemble(&conn, &config, intent, &query_embedding, &query)
        })
        .await
    }

    #[tool(description = "Promote a session's durable working-memory items (relevance >= 0.5 or pinned) to long-term memory without deleting them.")]
    async fn checkpoint_working_memory(
        &self,
        Parameters(params): Parameters<CheckpointWorkingMemoryParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let model = Arc::clone(&self.model);
        let config = Arc::clone(&self.config);
        let deadline = self.deadline();
        self.run("checkpoint_working_memory", None, move || {
            let mut conn = lock(&db)?;
            working::checkpoint(&mut conn, &model, &config, deadline, &params.session_id)
        })
        .await
    }

    // ── Analytics ────────────────────────────────────────────────────────

    #[tool(description = "Server statistics: store counts plus windowed service metrics from the in-process ring buffer.")]
    async fn get_stats(
        &self,
        Parameters(params): Parameters<GetStatsParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let metrics = Arc::clone(&self.metrics);
        self.run("get_stats", None, move || {
            let conn = lock(&db)?;
            // Opportunistic flush keeps the service_metrics table current.
            crate::metrics::persist_pending(&conn, &metrics);
            let snapshot = memory_stats::store_snapshot(&conn)?;
            Ok(serde_json::json!({
                "memory": snapshot,
                "services": metrics.stats(params.time_window_minutes.unwrap_or(60)),
                "totals": metrics.totals(),
                "started_at": metrics.started_at(),
            }))
        })
        .await
    }

    #[tool(description = "Recent gateway calls for a service ('model' or 'store'), newest first.")]
    async fn get_recent_calls(
        &self,
        Parameters(params): Parameters<GetRecentCallsParams>,
    ) -> Result<String, String> {
        let metrics = Arc::clone(&self.metrics);
        self.run("get_recent_calls", None, move || {
            let service = params.service.unwrap_or_else(|| "model".to_string());
            let calls = metrics.recent_calls(&service, params.limit.unwrap_or(50));
            Ok(serde_json::json!({
                "service": service,
                "call_count": calls.len(),
                "calls": calls,
            }))
        })
        .await
    }

    #[tool(description = "Per-user memory analytics: distribution, access patterns, top memories, and recent queries.")]
    async fn get_memory_analytics(
        &self,
        Parameters(params): Parameters<GetMemoryAnalyticsParams>,
    ) -> Result<String, String> {
        let db = Arc::clone(&self.db);
        let user = params.user_id.clone();
        self.run("get_memory_analytics", Some(user), move || {
            let conn = lock(&db)?;
            memory_stats::memory_analytics(&conn, &params.user_id)
        })
        .await
    }
}

fn lock(db: &Arc<Mutex<Connection>>) -> crate::error::Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| MemoryError::Internal(format!("store lock poisoned: {e}")))
}

#[tool_handler]
impl ServerHandler for EngramTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Engram is a two-tier memory server. Use init_session and \
                 add_to_working_memory for session context, store_memory and \
                 recall_memories for persistent knowledge, and \
                 get_relevant_context to assemble the best mix for a query \
                 under a token budget."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_trims_and_drops_empty() {
        assert_eq!(
            parse_csv(Some("a, b ,,c")),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(parse_csv(Some("  ")), None);
        assert_eq!(parse_csv(None), None);
    }

    #[test]
    fn parse_categories_validates() {
        let parsed = parse_categories(Some("episodic,semantic")).unwrap().unwrap();
        assert_eq!(parsed, vec![MemoryCategory::Episodic, MemoryCategory::Semantic]);
        assert!(parse_categories(Some("episodic,bogus")).is_err());
    }

    #[test]
    fn parse_content_types_validates() {
        let parsed = parse_content_types(Some("message,task_state")).unwrap().unwrap();
        assert_eq!(parsed, vec![ContentType::Message, ContentType::TaskState]);
        assert!(parse_content_types(Some("note")).is_err());
    }
}

//! SQL DDL for all Engram tables.
//!
//! Defines the five entity tables (`sessions`, `working_memory_items`,
//! `long_term_memories`, `memory_relationships`, `memory_access_log`), the
//! two append-only auxiliary tables (`tool_error_log`, `service_metrics`),
//! the `memories_vec` (vec0) vector index, and `schema_meta`. All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.
//!
//! The vector index must exist before the first memory insertion, and its
//! dimension is fixed at creation time — see [`init_schema`].

use rusqlite::Connection;

/// All schema DDL statements for Engram's relational tables.
const SCHEMA_SQL: &str = r#"
-- Working-memory sessions
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    org_id TEXT,
    max_tokens INTEGER NOT NULL DEFAULT 8000,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    config TEXT,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

-- Session-scoped working memory
CREATE TABLE IF NOT EXISTS working_memory_items (
    item_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    content_type TEXT NOT NULL
        CHECK(content_type IN ('message','task_state','scratchpad','system','retrieved_memory')),
    content TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    relevance_score REAL NOT NULL DEFAULT 1.0
        CHECK(relevance_score >= 0.0 AND relevance_score <= 1.0),
    pinned INTEGER NOT NULL DEFAULT 0,
    sequence_num INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed TEXT,
    UNIQUE(session_id, sequence_num)
);

CREATE INDEX IF NOT EXISTS idx_working_session ON working_memory_items(session_id);
CREATE INDEX IF NOT EXISTS idx_working_user ON working_memory_items(user_id);

-- User-scoped long-term memory (embedding lives in memories_vec)
CREATE TABLE IF NOT EXISTS long_term_memories (
    memory_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    org_id TEXT,
    memory_category TEXT NOT NULL
        CHECK(memory_category IN ('episodic','semantic','procedural','preference')),
    memory_subtype TEXT NOT NULL,
    content TEXT NOT NULL,
    summary TEXT,
    entities TEXT NOT NULL DEFAULT '[]',
    metadata TEXT,
    event_time TEXT,
    is_temporal INTEGER NOT NULL DEFAULT 0,
    importance REAL NOT NULL DEFAULT 0.5
        CHECK(importance >= 0.0 AND importance <= 1.0),
    access_count INTEGER NOT NULL DEFAULT 0,
    decay_factor REAL NOT NULL DEFAULT 1.0,
    supersedes TEXT,
    source_session TEXT,
    source_type TEXT NOT NULL DEFAULT 'conversation',
    confidence REAL NOT NULL DEFAULT 1.0
        CHECK(confidence >= 0.0 AND confidence <= 1.0),
    created_at TEXT NOT NULL,
    last_accessed TEXT,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_ltm_user ON long_term_memories(user_id);
CREATE INDEX IF NOT EXISTS idx_ltm_category ON long_term_memories(memory_category, memory_subtype);
CREATE INDEX IF NOT EXISTS idx_ltm_deleted ON long_term_memories(deleted_at);
CREATE INDEX IF NOT EXISTS idx_ltm_accessed ON long_term_memories(last_accessed);

-- Directed memory relationship graph (edge list; cycles are legal)
CREATE TABLE IF NOT EXISTS memory_relationships (
    relationship_id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES long_term_memories(memory_id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES long_term_memories(memory_id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    relationship TEXT NOT NULL
        CHECK(relationship IN ('related_to','part_of','depends_on','contradicts','updates')),
    strength REAL NOT NULL DEFAULT 1.0
        CHECK(strength >= 0.0 AND strength <= 1.0),
    context TEXT,
    created_at TEXT NOT NULL,
    created_by TEXT NOT NULL DEFAULT 'user',
    UNIQUE(source_id, target_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_rel_source ON memory_relationships(source_id);
CREATE INDEX IF NOT EXISTS idx_rel_target ON memory_relationships(target_id);

-- Append-only retrieval log (analytics, never correctness)
CREATE TABLE IF NOT EXISTS memory_access_log (
    access_id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    query_text TEXT,
    similarity_score REAL,
    was_useful INTEGER,
    was_used INTEGER,
    accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_memory ON memory_access_log(memory_id);
CREATE INDEX IF NOT EXISTS idx_access_user ON memory_access_log(user_id);

-- Append-only tool failure records
CREATE TABLE IF NOT EXISTS tool_error_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_name TEXT NOT NULL,
    error_type TEXT NOT NULL,
    error_message TEXT NOT NULL,
    user_id TEXT,
    input_preview TEXT,
    created_at TEXT NOT NULL
);

-- Append-only per-call service metrics
CREATE TABLE IF NOT EXISTS service_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    operation TEXT NOT NULL,
    latency_ms REAL NOT NULL,
    success INTEGER NOT NULL,
    error_msg TEXT,
    tokens_in INTEGER,
    tokens_out INTEGER,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables for the configured embedding dimension.
/// Idempotent (uses IF NOT EXISTS).
///
/// The vec0 dimension is baked into the virtual table at creation; opening a
/// database created with a different dimension is rejected so stale indexes
/// cannot silently accept wrong-length vectors.
pub fn init_schema(conn: &Connection, embedding_dim: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // vec0 virtual table must be created separately (sqlite-vec syntax).
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(\n\
             memory_id TEXT PRIMARY KEY,\n\
             embedding FLOAT[{embedding_dim}]\n\
         );"
    ))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dim', ?1)",
        [embedding_dim.to_string()],
    )?;

    let stored_dim: String = conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_dim'",
        [],
        |row| row.get(0),
    )?;
    if stored_dim != embedding_dim.to_string() {
        return Err(rusqlite::Error::InvalidParameterName(format!(
            "database was created with embedding_dim={stored_dim}, configured \
             {embedding_dim}; re-embed all rows before changing the dimension"
        )));
    }

    Ok(())
}

//! The two memory managers and their supporting operations.
//!
//! Working memory ([`working`]) is session-scoped and volatile: append,
//! budgeted reads, eviction with promotion, checkpoint. Long-term memory is
//! user-scoped and persistent: the write path ([`store`]), vector recall
//! ([`recall`]), deletion ([`forget`]), the relationship graph
//! ([`relations`]), lifecycle maintenance ([`maintenance`]), and analytics
//! ([`stats`]). Entity definitions live in [`types`].

pub mod forget;
pub mod maintenance;
pub mod recall;
pub mod relations;
pub mod stats;
pub mod store;
pub mod types;
pub mod working;

/// Current UTC timestamp in the RFC 3339 form every table stores.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Age in fractional days between an RFC 3339 timestamp and now. Unparseable
/// timestamps count as age zero.
pub(crate) fn age_days(timestamp: &str) -> f64 {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .map(|t| {
            let age = chrono::Utc::now().signed_duration_since(t);
            (age.num_seconds() as f64 / 86_400.0).max(0.0)
        })
        .unwrap_or(0.0)
}

/// Truncate content to `max_chars`, appending "..." if truncated.
pub(crate) fn truncate_preview(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        content.to_string()
    } else {
        let end = content
            .char_indices()
            .take_while(|(i, _)| *i < max_chars)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_chars);
        format!("{}...", &content[..end])
    }
}

/// Shared fixtures for unit tests: an in-memory database, a deterministic
/// stub model gateway, and direct row insertion with controlled embeddings.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use rusqlite::{params, Connection};

    use crate::config::EngramConfig;
    use crate::db;
    use crate::error::Result;
    use crate::metrics::MetricsRegistry;
    use crate::model::{ChatProvider, EmbeddingProvider, ModelGateway};

    /// Embedding dimension used by unit tests (small for speed).
    pub const STUB_DIM: usize = 64;

    /// Deterministic pseudo-random embedding derived from the text hash.
    /// Identical texts map to identical vectors; distinct texts are nearly
    /// orthogonal with overwhelming probability.
    pub struct StubEmbedder;

    impl EmbeddingProvider for StubEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(hash_embedding(text, STUB_DIM))
        }

        fn dimensions(&self) -> usize {
            STUB_DIM
        }
    }

    /// Chat stub that always fails, driving every model-dependent path
    /// through its documented fallback.
    pub struct StubChat;

    impl ChatProvider for StubChat {
        fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            Err(crate::error::MemoryError::UpstreamModel(
                "stub chat has no model".into(),
            ))
        }
    }

    pub fn hash_embedding(text: &str, dim: usize) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut state = hasher.finish() | 1;
        let mut v = Vec::with_capacity(dim);
        for _ in 0..dim {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            v.push(((state % 2_000) as f32 / 1_000.0) - 1.0);
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    /// Unit spike vector; seeds produce orthogonal embeddings.
    pub fn spike_embedding(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; STUB_DIM];
        v[seed % STUB_DIM] = 1.0;
        v
    }

    pub fn test_conn() -> Connection {
        db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        db::schema::init_schema(&conn, STUB_DIM).unwrap();
        db::migrations::run_migrations(&conn).unwrap();
        conn
    }

    pub fn test_config() -> EngramConfig {
        let mut config = EngramConfig::default();
        config.storage.embedding_dim = STUB_DIM;
        config
    }

    pub fn stub_gateway() -> ModelGateway {
        ModelGateway::new(
            Box::new(StubEmbedder),
            Box::new(StubChat),
            Arc::new(MetricsRegistry::new()),
        )
    }

    /// Insert a long-term memory row directly with a controlled embedding.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_memory_raw(
        conn: &Connection,
        user_id: &str,
        category: &str,
        subtype: &str,
        content: &str,
        importance: f64,
        entities: &[&str],
        embedding: &[f32],
    ) -> String {
        let memory_id = uuid::Uuid::new_v4().to_string();
        let now = super::now_rfc3339();
        let entities_json = serde_json::to_string(entities).unwrap();
        conn.execute(
            "INSERT INTO long_term_memories (
                memory_id, user_id, memory_category, memory_subtype, content,
                entities, importance, source_type, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'conversation', ?8, ?8)",
            params![memory_id, user_id, category, subtype, content, entities_json, importance, now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memories_vec (memory_id, embedding) VALUES (?1, ?2)",
            params![memory_id, crate::db::vector::embedding_to_bytes(embedding)],
        )
        .unwrap();
        memory_id
    }
}

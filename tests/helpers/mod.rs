#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use engram::config::EngramConfig;
use engram::db;
use engram::error::{MemoryError, Result};
use engram::metrics::MetricsRegistry;
use engram::model::{ChatProvider, EmbeddingProvider, ModelGateway};
use rusqlite::Connection;

/// Embedding dimension used by the integration tests (small for speed).
pub const DIM: usize = 64;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn, DIM).unwrap();
    db::migrations::run_migrations(&conn).unwrap();
    conn
}

/// Config matching the test embedding dimension.
pub fn test_config() -> EngramConfig {
    let mut config = EngramConfig::default();
    config.storage.embedding_dim = DIM;
    config
}

/// Deterministic pseudo-random embedding derived from the text hash.
/// Identical texts map to identical vectors; distinct texts are nearly
/// orthogonal.
pub fn hash_embedding(text: &str) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let mut state = hasher.finish() | 1;
    let mut v = Vec::with_capacity(DIM);
    for _ in 0..DIM {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        v.push(((state % 2_000) as f32 / 1_000.0) - 1.0);
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

/// Unit spike vector; distinct seeds produce orthogonal embeddings.
pub fn spike_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[seed % DIM] = 1.0;
    v
}

/// Embedding provider backed by [`hash_embedding`].
pub struct StubEmbedder;

impl EmbeddingProvider for StubEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_embedding(text))
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Chat provider that replays a fixed queue of responses, then errors.
pub struct ScriptedChat(Mutex<Vec<String>>);

impl ScriptedChat {
    pub fn new(responses: &[&str]) -> Self {
        Self(Mutex::new(responses.iter().map(|s| s.to_string()).collect()))
    }
}

impl ChatProvider for ScriptedChat {
    fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        let mut queue = self.0.lock().unwrap();
        if queue.is_empty() {
            Err(MemoryError::UpstreamModel("no scripted response".into()))
        } else {
            Ok(queue.remove(0))
        }
    }
}

/// Gateway whose chat always fails: every classification takes its fallback.
pub fn stub_gateway() -> ModelGateway {
    gateway_with_chat(&[])
}

/// Gateway with a scripted chat queue (for intent/classification tests).
pub fn gateway_with_chat(responses: &[&str]) -> ModelGateway {
    ModelGateway::new(
        Box::new(StubEmbedder),
        Box::new(ScriptedChat::new(responses)),
        Arc::new(MetricsRegistry::new()),
    )
}

/// Insert a long-term memory row directly with a controlled embedding.
/// Returns the memory ID.
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
    let now = chrono::Utc::now().to_rfc3339();
    let entities_json = serde_json::to_string(entities).unwrap();
    conn.execute(
        "INSERT INTO long_term_memories (
            memory_id, user_id, memory_category, memory_subtype, content,
            entities, importance, source_type, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'conversation', ?8, ?8)",
        rusqlite::params![
            memory_id,
            user_id,
            category,
            subtype,
            content,
            entities_json,
            importance,
            now
        ],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO memories_vec (memory_id, embedding) VALUES (?1, ?2)",
        rusqlite::params![memory_id, engram::db::vector::embedding_to_bytes(embedding)],
    )
    .unwrap();
    memory_id
}

//! Model gateway: embeddings (with in-process cache), classification, entity
//! extraction, intent detection, and summarization.
//!
//! Providers are synchronous trait objects — callers in async contexts use
//! `tokio::task::spawn_blocking`. Classification and entity extraction
//! recover from model failures with fallback defaults (logged at warn);
//! embedding failures surface as `upstream_model` errors.

pub mod http;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::error::{MemoryError, Result};
use crate::metrics::MetricsRegistry;
use crate::taxonomy::{validate_subtype, Intent, MemoryCategory};

/// Embedding cache capacity (entries).
const EMBED_CACHE_CAPACITY: usize = 1_000;

/// Deterministic token estimator used for all token accounting.
///
/// Roughly four characters per token, floored at one for non-empty text —
/// the convention the rest of the pipeline (budgets, eviction, summaries)
/// is calibrated against.
pub fn count_tokens(text: &str) -> i64 {
    if text.is_empty() {
        0
    } else {
        (((text.len() as i64) + 3) / 4).max(1)
    }
}

/// Produces raw embedding vectors of a fixed dimension.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;
}

/// Single-turn chat completion against the model service.
pub trait ChatProvider: Send + Sync {
    fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Result of classifying content into the memory taxonomy.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: MemoryCategory,
    pub subtype: String,
    pub importance: f64,
    pub entities: Vec<String>,
    pub is_temporal: bool,
    pub summary: Option<String>,
}

impl Classification {
    /// The fallback used when the model fails or returns unusable output.
    pub fn fallback() -> Self {
        Self {
            category: MemoryCategory::Semantic,
            subtype: "domain".to_string(),
            importance: 0.5,
            entities: Vec::new(),
            is_temporal: false,
            summary: None,
        }
    }
}

/// FIFO cache keyed by a 64-bit hash of the text.
struct EmbeddingCache {
    map: HashMap<u64, Vec<f32>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: u64) -> Option<Vec<f32>> {
        self.map.get(&key).cloned()
    }

    fn insert(&mut self, key: u64, value: Vec<f32>) {
        if self.map.contains_key(&key) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key);
        self.map.insert(key, value);
    }
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// The gateway shared by the managers and the context assembler.
pub struct ModelGateway {
    embedder: Box<dyn EmbeddingProvider>,
    chat: Box<dyn ChatProvider>,
    cache: Mutex<EmbeddingCache>,
    metrics: Arc<MetricsRegistry>,
}

impl ModelGateway {
    pub fn new(
        embedder: Box<dyn EmbeddingProvider>,
        chat: Box<dyn ChatProvider>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            embedder,
            chat,
            cache: Mutex::new(EmbeddingCache::new(EMBED_CACHE_CAPACITY)),
            metrics,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embed one text. Deterministic per text within the process lifetime via
    /// the FIFO cache. The returned vector is L2-normalized and has exactly
    /// [`Self::dimensions`] components.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = text_hash(text);
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(key) {
                return Ok(hit);
            }
        }

        let tokens = count_tokens(text) as u64;
        let raw = self
            .metrics
            .timed("model", "embed", tokens, || self.embedder.embed(text))?;

        if raw.len() != self.embedder.dimensions() {
            return Err(MemoryError::UpstreamModel(format!(
                "embedding has {} components, expected {}",
                raw.len(),
                self.embedder.dimensions()
            )));
        }

        let normalized = l2_normalize(raw)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, normalized.clone());
        }
        Ok(normalized)
    }

    /// Embed a batch, preserving order and populating the cache.
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Classify content into the taxonomy. Never fails: transport and parse
    /// failures fall back to `(semantic, domain, 0.5, [], false, None)`.
    pub fn classify(&self, content: &str, context: &str) -> Classification {
        let prompt = format!(
            "Content to classify:\n{content}\n\nAdditional context:\n{}\n\nReturn JSON only, no explanation.",
            if context.is_empty() { "None provided" } else { context }
        );
        let tokens = count_tokens(&prompt) as u64;
        let response = self.metrics.timed("model", "classify", tokens, || {
            self.chat.complete(CLASSIFY_SYSTEM_PROMPT, &prompt)
        });

        match response {
            Ok(text) => parse_classification(&text).unwrap_or_else(|| {
                tracing::warn!("classification output unparseable, using fallback");
                Classification::fallback()
            }),
            Err(err) => {
                tracing::warn!(error = %err, "classification call failed, using fallback");
                Classification::fallback()
            }
        }
    }

    /// Extract "type:name" entities. Empty list on any failure.
    pub fn extract_entities(&self, content: &str) -> Vec<String> {
        let prompt = format!("Content:\n{content}");
        let tokens = count_tokens(&prompt) as u64;
        let response = self.metrics.timed("model", "extract_entities", tokens, || {
            self.chat.complete(ENTITIES_SYSTEM_PROMPT, &prompt)
        });

        match response {
            Ok(text) => extract_json_array(&text).unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "entity extraction failed, returning none");
                Vec::new()
            }
        }
    }

    /// Detect the query intent. `General` on any ambiguity or failure;
    /// there is no retryable failure class here.
    pub fn detect_intent(&self, query: &str) -> Intent {
        let tokens = count_tokens(query) as u64;
        let response = self.metrics.timed("model", "detect_intent", tokens, || {
            self.chat.complete(INTENT_SYSTEM_PROMPT, query)
        });

        let Ok(text) = response else {
            return Intent::General;
        };
        let word = text
            .trim()
            .to_lowercase()
            .replace(['"', '\''], "");

        // Tolerate minor model phrasing drift around the canonical words.
        if word.contains("how") {
            Intent::HowTo
        } else if word.contains("happened") {
            Intent::WhatHappened
        } else if word.contains("what_is") || word.contains("what is") {
            Intent::WhatIs
        } else if word.contains("debug") {
            Intent::Debug
        } else {
            word.parse().unwrap_or(Intent::General)
        }
    }

    /// Summarize content in at most `max_words` words. `None` on failure.
    pub fn summarize(&self, content: &str, max_words: usize) -> Option<String> {
        let system = format!(
            "Summarize the given content in {max_words} words or less. \
             Return ONLY the summary text, nothing else. \
             Be concise and preserve key facts."
        );
        let prompt = format!("Summarize:\n{content}");
        let tokens = count_tokens(&prompt) as u64;
        let response = self.metrics.timed("model", "summarize", tokens, || {
            self.chat.complete(&system, &prompt)
        });

        match response {
            Ok(text) => {
                let summary = text.trim().to_string();
                if summary.len() < 10 || summary.contains("```") {
                    None
                } else {
                    Some(summary)
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "summarization failed");
                None
            }
        }
    }
}

fn l2_normalize(mut v: Vec<f32>) -> Result<Vec<f32>> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return Err(MemoryError::UpstreamModel(
            "model returned a zero-magnitude embedding".into(),
        ));
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(v)
}

const CLASSIFY_SYSTEM_PROMPT: &str = "\
You are a memory classification system. Analyze the given content and \
classify it for storage in a long-term memory system.

Return ONLY valid JSON with these fields:
- memory_category: one of 'episodic', 'semantic', 'procedural', 'preference'
- memory_subtype:
  - For episodic: 'event', 'decision', 'conversation', 'outcome'
  - For semantic: 'user', 'project', 'environment', 'domain', 'entity'
  - For procedural: 'workflow', 'pattern', 'tool_usage', 'debugging'
  - For preference: 'communication', 'style', 'tools', 'boundaries'
- importance: float 0.0 to 1.0 (how likely to be needed again)
- entities: array of named entities in format \"type:name\" \
(e.g., \"database:prod_db\", \"table:users\", \"file:api.py\")
- is_temporal: boolean (is this time-sensitive information?)
- summary: optional shorter version (only if content is long)";

const ENTITIES_SYSTEM_PROMPT: &str = "\
Extract named entities from the content. Return a JSON array of strings in \
the format \"type:name\".

Entity types to look for: database, table, field, file, function, class, \
api, service, person, tool, concept.

Return ONLY a JSON array, no explanation.";

const INTENT_SYSTEM_PROMPT: &str = "\
Classify the query intent. Return ONLY one of these words:
- how_to: asking how to do something
- what_happened: asking about past events/decisions
- what_is: asking for facts/information
- debug: asking for help with an error/problem
- general: other/unclear

Return only the classification word, nothing else.";

#[derive(Deserialize)]
struct RawClassification {
    memory_category: Option<String>,
    memory_subtype: Option<String>,
    importance: Option<f64>,
    entities: Option<Vec<String>>,
    is_temporal: Option<bool>,
    summary: Option<String>,
}

/// Parse the classifier's strict-JSON response. `None` when the response is
/// not rescuable (no JSON object, unknown category, illegal pair).
fn parse_classification(text: &str) -> Option<Classification> {
    let json = extract_json_object(text)?;
    let raw: RawClassification = serde_json::from_str(&json).ok()?;

    let category: MemoryCategory = raw.memory_category?.parse().ok()?;
    let subtype = raw.memory_subtype?;
    if !validate_subtype(category, &subtype) {
        return None;
    }

    Some(Classification {
        category,
        subtype,
        importance: raw.importance.unwrap_or(0.5).clamp(0.0, 1.0),
        entities: raw.entities.unwrap_or_default(),
        is_temporal: raw.is_temporal.unwrap_or(false),
        summary: raw.summary.filter(|s| !s.trim().is_empty()),
    })
}

/// Pull the first `{...}` span out of a model response.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}

/// Pull the first `[...]` span out of a model response and parse it.
fn extract_json_array(text: &str) -> Option<Vec<String>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedChat(std::sync::Mutex<Vec<String>>);

    impl ChatProvider for FixedChat {
        fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            let mut responses = self.0.lock().unwrap();
            if responses.is_empty() {
                Err(MemoryError::UpstreamModel("no response queued".into()))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    struct SpikeEmbedder {
        dim: usize,
        calls: std::sync::Mutex<usize>,
    }

    impl EmbeddingProvider for SpikeEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            *self.calls.lock().unwrap() += 1;
            let mut v = vec![0.0f32; self.dim];
            v[text.len() % self.dim] = 2.0; // not normalized on purpose
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            self.dim
        }
    }

    fn gateway_with(responses: Vec<&str>) -> ModelGateway {
        ModelGateway::new(
            Box::new(SpikeEmbedder {
                dim: 8,
                calls: std::sync::Mutex::new(0),
            }),
            Box::new(FixedChat(std::sync::Mutex::new(
                responses.into_iter().map(String::from).collect(),
            ))),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn embed_normalizes_and_caches() {
        let embedder = SpikeEmbedder {
            dim: 8,
            calls: std::sync::Mutex::new(0),
        };
        let gateway = ModelGateway::new(
            Box::new(embedder),
            Box::new(FixedChat(std::sync::Mutex::new(vec![]))),
            Arc::new(MetricsRegistry::new()),
        );

        let first = gateway.embed("hello").unwrap();
        let norm: f32 = first.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        // Second call for the same text is served from cache (identical vector)
        let second = gateway.embed("hello").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn embed_batch_preserves_order() {
        let gateway = gateway_with(vec![]);
        let batch = gateway.embed_batch(&["a", "bb", "ccc"]).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], gateway.embed("a").unwrap());
        assert_eq!(batch[2], gateway.embed("ccc").unwrap());
    }

    #[test]
    fn classify_parses_strict_json() {
        let gateway = gateway_with(vec![
            r#"{"memory_category": "procedural", "memory_subtype": "workflow",
                "importance": 0.8, "entities": ["tool:cargo"], "is_temporal": false}"#,
        ]);
        let c = gateway.classify("run cargo build before pushing", "");
        assert_eq!(c.category, MemoryCategory::Procedural);
        assert_eq!(c.subtype, "workflow");
        assert!((c.importance - 0.8).abs() < f64::EPSILON);
        assert_eq!(c.entities, vec!["tool:cargo"]);
    }

    #[test]
    fn classify_tolerates_prose_around_json() {
        let gateway = gateway_with(vec![
            r#"Sure! Here is the classification:
               {"memory_category": "preference", "memory_subtype": "style", "importance": 0.4}
               Hope that helps."#,
        ]);
        let c = gateway.classify("user likes short answers", "");
        assert_eq!(c.category, MemoryCategory::Preference);
        assert_eq!(c.subtype, "style");
    }

    #[test]
    fn classify_falls_back_on_garbage() {
        let gateway = gateway_with(vec!["I cannot classify this."]);
        let c = gateway.classify("whatever", "");
        assert_eq!(c.category, MemoryCategory::Semantic);
        assert_eq!(c.subtype, "domain");
        assert!((c.importance - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn classify_falls_back_on_illegal_pair() {
        let gateway = gateway_with(vec![
            r#"{"memory_category": "episodic", "memory_subtype": "workflow"}"#,
        ]);
        let c = gateway.classify("text", "");
        assert_eq!(c.category, MemoryCategory::Semantic);
        assert_eq!(c.subtype, "domain");
    }

    #[test]
    fn classify_falls_back_on_transport_error() {
        let gateway = gateway_with(vec![]);
        let c = gateway.classify("text", "");
        assert_eq!(c.category, MemoryCategory::Semantic);
    }

    #[test]
    fn extract_entities_parses_array() {
        let gateway = gateway_with(vec![r#"["table:users", "database:prod"]"#]);
        assert_eq!(
            gateway.extract_entities("the users table in prod"),
            vec!["table:users", "database:prod"]
        );
    }

    #[test]
    fn extract_entities_empty_on_failure() {
        let gateway = gateway_with(vec!["no entities here"]);
        assert!(gateway.extract_entities("text").is_empty());
    }

    #[test]
    fn detect_intent_maps_words() {
        let gateway = gateway_with(vec!["how_to", "what_happened", "debug", "nonsense"]);
        assert_eq!(gateway.detect_intent("q1"), Intent::HowTo);
        assert_eq!(gateway.detect_intent("q2"), Intent::WhatHappened);
        assert_eq!(gateway.detect_intent("q3"), Intent::Debug);
        assert_eq!(gateway.detect_intent("q4"), Intent::General);
    }

    #[test]
    fn detect_intent_defaults_to_general_on_error() {
        let gateway = gateway_with(vec![]);
        assert_eq!(gateway.detect_intent("anything"), Intent::General);
    }

    #[test]
    fn summarize_rejects_junk() {
        let gateway = gateway_with(vec!["```json\nnot a summary\n```"]);
        assert!(gateway.summarize("long content", 50).is_none());
    }

    #[test]
    fn count_tokens_is_deterministic() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("abc"), 1);
        assert_eq!(count_tokens("abcd"), 1);
        assert_eq!(count_tokens("abcde"), 2);
        let long = "x".repeat(400);
        assert_eq!(count_tokens(&long), 100);
    }

    #[test]
    fn cache_evicts_fifo() {
        let mut cache = EmbeddingCache::new(2);
        cache.insert(1, vec![1.0]);
        cache.insert(2, vec![2.0]);
        cache.insert(3, vec![3.0]);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }
}

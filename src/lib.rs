//! Two-tier memory for conversational AI agents — session-scoped working
//! memory plus persistent, vector-indexed long-term memory, served over MCP.
//!
//! Engram gives an agent memory that survives across sessions and assembles,
//! under a strict token budget, the most relevant subset of that memory for
//! any query:
//!
//! | Tier | Scope | Lifecycle |
//! |------|-------|-----------|
//! | **Working memory** | Session | Volatile; evicted by priority, promoted on checkpoint |
//! | **Long-term memory** | User | Persistent; classified, deduplicated, decayed |
//!
//! Long-term memories are classified into a fixed taxonomy (episodic,
//! semantic, procedural, preference — each with subtypes), embedded, and
//! recalled by a composite of semantic similarity, recency, access
//! frequency, and importance. The context assembler splits a token budget
//! across working memory and the taxonomy pools according to the detected
//! query intent.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for vector search; a single shared connection serializes writers
//! - **Models**: an Ollama-compatible HTTP service for embeddings,
//!   classification, entity extraction, intent detection, and summarization
//! - **Transport**: MCP over stdio (primary) or Streamable HTTP
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — Store gateway: schema, migrations, write retry, vector search
//! - [`model`] — Model gateway with embedding cache and classification fallbacks
//! - [`memory`] — The two memory managers: working and long-term
//! - [`context`] — Budget-bounded context assembly under intent weight profiles
//! - [`security`] — Credential-pattern validation for stored content
//! - [`taxonomy`] — The fixed category/subtype table and intent weight profiles
//! - [`metrics`] — In-process metrics ring buffer
//! - [`error`] — The fixed error taxonomy

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod security;
pub mod taxonomy;

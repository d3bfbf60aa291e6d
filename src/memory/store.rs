//! Long-term write path — security check, auto-classification, embedding,
//! deduplication, insertion, and supersession.
//!
//! [`store_memory`] is the single entry point for new memories; promotion
//! from working memory and checkpointing reuse it. Classification and
//! embedding run before the write transaction so model latency never holds
//! the writer lock longer than the row insert itself.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::config::EngramConfig;
use crate::db::retry::{with_write_retry, Deadline};
use crate::db::vector;
use crate::error::{MemoryError, Result};
use crate::memory::types::{Memory, RelationshipKind};
use crate::memory::now_rfc3339;
use crate::model::{count_tokens, ModelGateway};
use crate::security;
use crate::taxonomy::{validate_subtype, MemoryCategory};

/// Tokens above which a summary is generated for stored content.
const SUMMARY_TOKEN_THRESHOLD: i64 = 50;

/// Inputs for a store operation. Absent hints are filled by classification.
#[derive(Debug, Default)]
pub struct StoreRequest {
    pub user_id: String,
    pub content: String,
    pub category: Option<MemoryCategory>,
    pub subtype: Option<String>,
    pub importance: Option<f64>,
    pub entities: Option<Vec<String>>,
    pub event_time: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub source_session: Option<String>,
    /// `"conversation"`, `"checkpoint"`, or `"eviction"`.
    pub source_type: Option<String>,
}

/// What happened to the submitted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreAction {
    CreatedNew,
    MergedWithExisting,
}

/// Result returned from a store operation.
#[derive(Debug, Serialize)]
pub struct StoreOutcome {
    pub memory_id: String,
    pub action: StoreAction,
    pub memory_category: MemoryCategory,
    pub memory_subtype: String,
    pub entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub content_tokens: i64,
}

/// A store request after the model-dependent phase: validated, classified,
/// and embedded, ready for the write-lock scope.
#[derive(Debug)]
pub struct PreparedStore {
    user_id: String,
    content: String,
    category: MemoryCategory,
    subtype: String,
    importance: f64,
    entities: Vec<String>,
    event_time: Option<String>,
    metadata: Option<serde_json::Value>,
    source_session: Option<String>,
    source_type: String,
    is_temporal: bool,
    summary: Option<String>,
    content_tokens: i64,
    embedding: Vec<f32>,
}

/// The model-dependent half of the write path: security gate, classification
/// of missing hints, entity extraction, summarization, and embedding. Needs
/// no database access, so callers run it before taking the write lock.
pub fn prepare_store(
    model: &ModelGateway,
    deadline: Deadline,
    req: StoreRequest,
) -> Result<PreparedStore> {
    if req.content.is_empty() {
        return Err(MemoryError::Validation("content must not be empty".into()));
    }
    if let Some(importance) = req.importance {
        if !(0.0..=1.0).contains(&importance) {
            return Err(MemoryError::Validation(format!(
                "importance must be within [0.0, 1.0], got {importance}"
            )));
        }
    }

    // Security gate; nothing is written when content matches a pattern.
    security::check_content(&req.content)?;

    let mut category = req.category;
    let mut subtype = req.subtype;
    let mut importance = req.importance;
    let mut entities = req.entities.unwrap_or_default();
    let mut is_temporal = req.event_time.is_some();
    let mut summary = None;

    let content_tokens = count_tokens(&req.content);

    if category.is_none() || subtype.is_none() {
        deadline.check("classification")?;
        let classification = model.classify(&req.content, "");
        category = category.or(Some(classification.category));
        subtype = subtype.or(Some(classification.subtype));
        importance = importance.or(Some(classification.importance));
        if entities.is_empty() {
            entities = classification.entities;
        }
        is_temporal = is_temporal || classification.is_temporal;
        summary = classification.summary;
    }

    let category = category.unwrap_or(MemoryCategory::Semantic);
    let subtype = subtype.unwrap_or_else(|| "domain".to_string());
    let importance = importance.unwrap_or(0.5);

    // Taxonomy gate (hinted pairs included).
    if !validate_subtype(category, &subtype) {
        return Err(MemoryError::Validation(format!(
            "invalid subtype '{subtype}' for category '{category}'"
        )));
    }

    if entities.is_empty() {
        deadline.check("entity extraction")?;
        entities = model.extract_entities(&req.content);
    }

    if summary.is_none() && content_tokens > SUMMARY_TOKEN_THRESHOLD {
        deadline.check("summarization")?;
        summary = model.summarize(&req.content, 50);
    }

    deadline.check("embedding")?;
    let embedding = model.embed(&req.content)?;

    Ok(PreparedStore {
        user_id: req.user_id,
        content: req.content,
        category,
        subtype,
        importance,
        entities,
        event_time: req.event_time,
        metadata: req.metadata,
        source_session: req.source_session,
        source_type: req.source_type.unwrap_or_else(|| "conversation".to_string()),
        is_temporal,
        summary,
        content_tokens,
        embedding,
    })
}

/// The write-lock half: dedup gate then insert. Two near-duplicate writes
/// cannot both pass the gate because the caller holds the process-wide
/// write lock across this call.
pub fn commit_store(
    conn: &mut Connection,
    config: &EngramConfig,
    deadline: Deadline,
    prepared: PreparedStore,
) -> Result<StoreOutcome> {
    // Dedup gate: an existing memory at or above the threshold absorbs this
    // write instead of creating a near-duplicate row.
    let hits = vector::search(
        conn,
        &prepared.embedding,
        &prepared.user_id,
        &vector::SearchFilters::default(),
        config.retrieval.dedup_threshold,
        3,
    )?;
    if let Some(existing) = hits.first() {
        let memory_id = existing.memory_id.clone();
        touch_memory(conn, deadline, &memory_id)?;
        tracing::debug!(memory_id = %memory_id, similarity = existing.similarity, "store merged with existing memory");
        return Ok(StoreOutcome {
            memory_id,
            action: StoreAction::MergedWithExisting,
            memory_category: prepared.category,
            memory_subtype: prepared.subtype,
            entities: prepared.entities,
            summary: prepared.summary,
            content_tokens: prepared.content_tokens,
        });
    }

    let memory_id = uuid::Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let entities_json = serde_json::to_string(&prepared.entities)?;
    let metadata_json = prepared
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    with_write_retry(deadline, || {
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO long_term_memories (
                memory_id, user_id, memory_category, memory_subtype, content,
                summary, entities, metadata, event_time, is_temporal,
                importance, access_count, decay_factor, source_session,
                source_type, confidence, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, 1.0, ?12, ?13, 1.0, ?14, ?14)",
            params![
                memory_id,
                prepared.user_id,
                prepared.category.as_str(),
                prepared.subtype,
                prepared.content,
                prepared.summary,
                entities_json,
                metadata_json,
                prepared.event_time,
                prepared.is_temporal,
                prepared.importance,
                prepared.source_session,
                prepared.source_type,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO memories_vec (memory_id, embedding) VALUES (?1, ?2)",
            params![memory_id, vector::embedding_to_bytes(&prepared.embedding)],
        )?;
        tx.commit()
    })?;

    tracing::info!(memory_id = %memory_id, category = %prepared.category, subtype = %prepared.subtype, "memory stored");

    Ok(StoreOutcome {
        memory_id,
        action: StoreAction::CreatedNew,
        memory_category: prepared.category,
        memory_subtype: prepared.subtype,
        entities: prepared.entities,
        summary: prepared.summary,
        content_tokens: prepared.content_tokens,
    })
}

/// Full write path in one call, for callers already inside the write-lock
/// scope (eviction promotion, checkpointing).
pub fn store_memory(
    conn: &mut Connection,
    model: &ModelGateway,
    config: &EngramConfig,
    deadline: Deadline,
    req: StoreRequest,
) -> Result<StoreOutcome> {
    let prepared = prepare_store(model, deadline, req)?;
    commit_store(conn, config, deadline, prepared)
}

/// Fields accepted by [`update_memory`]; `None` means unchanged.
#[derive(Debug, Default)]
pub struct UpdateRequest {
    pub content: Option<String>,
    pub importance: Option<f64>,
    pub entities: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct UpdateOutcome {
    pub memory_id: String,
    pub re_embedded: bool,
}

/// Update an existing memory. Content changes re-run the security validator
/// and re-embed; metadata is merged key-by-key rather than replaced.
pub fn update_memory(
    conn: &mut Connection,
    model: &ModelGateway,
    deadline: Deadline,
    memory_id: &str,
    user_id: &str,
    req: UpdateRequest,
) -> Result<UpdateOutcome> {
    let existing = fetch_memory(conn, memory_id, Some(user_id), false)?
        .ok_or_else(|| MemoryError::NotFound(format!("memory {memory_id}")))?;

    if req.content.is_none()
        && req.importance.is_none()
        && req.entities.is_none()
        && req.metadata.is_none()
    {
        return Err(MemoryError::Validation("no updates provided".into()));
    }
    if let Some(importance) = req.importance {
        if !(0.0..=1.0).contains(&importance) {
            return Err(MemoryError::Validation(format!(
                "importance must be within [0.0, 1.0], got {importance}"
            )));
        }
    }

    let mut new_embedding = None;
    if let Some(content) = &req.content {
        if content.is_empty() {
            return Err(MemoryError::Validation("content must not be empty".into()));
        }
        security::check_content(content)?;
        deadline.check("embedding")?;
        new_embedding = Some(model.embed(content)?);
    }

    let merged_metadata = match (&existing.metadata, &req.metadata) {
        (Some(old), Some(new)) => Some(merge_metadata(old, new)),
        (None, Some(new)) => Some(new.clone()),
        (old, None) => old.clone(),
    };
    let metadata_json = merged_metadata.as_ref().map(serde_json::to_string).transpose()?;
    let entities_json = req.entities.as_ref().map(serde_json::to_string).transpose()?;
    let now = now_rfc3339();

    with_write_retry(deadline, || {
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE long_term_memories SET
                content = COALESCE(?1, content),
                importance = COALESCE(?2, importance),
                entities = COALESCE(?3, entities),
                metadata = COALESCE(?4, metadata),
                updated_at = ?5
             WHERE memory_id = ?6 AND user_id = ?7",
            params![
                req.content,
                req.importance,
                entities_json,
                metadata_json,
                now,
                memory_id,
                user_id,
            ],
        )?;
        if let Some(embedding) = &new_embedding {
            tx.execute(
                "UPDATE memories_vec SET embedding = ?1 WHERE memory_id = ?2",
                params![vector::embedding_to_bytes(embedding), memory_id],
            )?;
        }
        tx.commit()
    })?;

    Ok(UpdateOutcome {
        memory_id: memory_id.to_string(),
        re_embedded: new_embedding.is_some(),
    })
}

#[derive(Debug, Serialize)]
pub struct SupersedeOutcome {
    pub old_id: String,
    pub new_id: String,
}

/// Replace `old_id` with `new_id`: the new memory records what it supersedes,
/// the old one is soft-deleted, and an `updates` edge old → new is inserted.
/// Both memories must belong to `user_id`.
pub fn supersede(
    conn: &mut Connection,
    deadline: Deadline,
    user_id: &str,
    old_id: &str,
    new_id: &str,
) -> Result<SupersedeOutcome> {
    if old_id == new_id {
        return Err(MemoryError::Validation(
            "a memory cannot supersede itself".into(),
        ));
    }
    // Old may already be soft-deleted by an earlier supersession attempt.
    fetch_memory(conn, old_id, Some(user_id), true)?
        .ok_or_else(|| MemoryError::NotFound(format!("memory {old_id}")))?;
    fetch_memory(conn, new_id, Some(user_id), false)?
        .ok_or_else(|| MemoryError::NotFound(format!("memory {new_id}")))?;

    let now = now_rfc3339();
    let relationship_id = uuid::Uuid::new_v4().to_string();

    with_write_retry(deadline, || {
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE long_term_memories SET supersedes = ?1, updated_at = ?2 \
             WHERE memory_id = ?3 AND user_id = ?4",
            params![old_id, now, new_id, user_id],
        )?;
        tx.execute(
            "UPDATE long_term_memories SET deleted_at = ?1, updated_at = ?1 \
             WHERE memory_id = ?2 AND user_id = ?3 AND deleted_at IS NULL",
            params![now, old_id, user_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO memory_relationships
                (relationship_id, source_id, target_id, user_id, relationship,
                 strength, context, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, 1.0, 'superseded', ?6, 'system')",
            params![
                relationship_id,
                old_id,
                new_id,
                user_id,
                RelationshipKind::Updates.as_str(),
                now,
            ],
        )?;
        tx.commit()
    })?;

    tracing::info!(old = %old_id, new = %new_id, "memory superseded");
    Ok(SupersedeOutcome {
        old_id: old_id.to_string(),
        new_id: new_id.to_string(),
    })
}

/// Bump access bookkeeping on a dedup match.
fn touch_memory(conn: &mut Connection, deadline: Deadline, memory_id: &str) -> Result<()> {
    let now = now_rfc3339();
    with_write_retry(deadline, || {
        conn.execute(
            "UPDATE long_term_memories SET access_count = access_count + 1, \
             last_accessed = ?1, updated_at = ?1 WHERE memory_id = ?2",
            params![now, memory_id],
        )
    })?;
    Ok(())
}

/// Shallow key-by-key merge; new keys win.
fn merge_metadata(old: &serde_json::Value, new: &serde_json::Value) -> serde_json::Value {
    match (old, new) {
        (serde_json::Value::Object(old_map), serde_json::Value::Object(new_map)) => {
            let mut merged = old_map.clone();
            for (k, v) in new_map {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => new.clone(),
    }
}

/// Fetch one memory row, optionally scoped to a user and including
/// soft-deleted rows.
pub(crate) fn fetch_memory(
    conn: &Connection,
    memory_id: &str,
    user_id: Option<&str>,
    include_deleted: bool,
) -> Result<Option<Memory>> {
    let mut sql = String::from(
        "SELECT memory_id, user_id, memory_category, memory_subtype, content, \
         summary, entities, metadata, event_time, is_temporal, importance, \
         access_count, decay_factor, supersedes, source_session, source_type, \
         confidence, created_at, last_accessed, updated_at, deleted_at \
         FROM long_term_memories WHERE memory_id = ?1",
    );
    if !include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }

    let row = conn
        .query_row(&sql, params![memory_id], map_memory_row)
        .optional()?;

    Ok(row.filter(|m| user_id.is_none_or(|u| m.user_id == u)))
}

pub(crate) fn map_memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let category_str: String = row.get(2)?;
    let entities_str: String = row.get(6)?;
    let metadata_str: Option<String> = row.get(7)?;
    Ok(Memory {
        memory_id: row.get(0)?,
        user_id: row.get(1)?,
        memory_category: category_str.parse().unwrap_or(MemoryCategory::Semantic),
        memory_subtype: row.get(3)?,
        content: row.get(4)?,
        summary: row.get(5)?,
        entities: serde_json::from_str(&entities_str).unwrap_or_default(),
        metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
        event_time: row.get(8)?,
        is_temporal: row.get(9)?,
        importance: row.get(10)?,
        access_count: row.get(11)?,
        decay_factor: row.get(12)?,
        supersedes: row.get(13)?,
        source_session: row.get(14)?,
        source_type: row.get(15)?,
        confidence: row.get(16)?,
        created_at: row.get(17)?,
        last_accessed: row.get(18)?,
        updated_at: row.get(19)?,
        deleted_at: row.get(20)?,
    })
}

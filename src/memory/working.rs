//! Session-scoped working memory: lifecycle, append with eviction, budgeted
//! reads, and checkpoint promotion into long-term memory.
//!
//! Sessions are created on first reference and never hard-deleted outside
//! the GDPR erasure path. Sequence numbers are assigned under the write
//! lock, so appends against the same session are totally ordered. The
//! session's running token total always equals the sum of its live items'
//! token counts.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::config::EngramConfig;
use crate::db::retry::{with_write_retry, Deadline};
use crate::error::{MemoryError, Result};
use crate::memory::store::{store_memory, StoreAction, StoreRequest};
use crate::memory::types::{ContentType, Session, WorkingItem};
use crate::memory::now_rfc3339;
use crate::model::{count_tokens, ModelGateway};
use crate::security;

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created: bool,
    pub total_tokens: i64,
    pub max_tokens: i64,
}

/// Initialize or resume a session. An expired session transitions back to
/// absent: its items are dropped and a fresh lifetime starts under the same
/// key.
pub fn init_session(
    conn: &mut Connection,
    config: &EngramConfig,
    deadline: Deadline,
    user_id: &str,
    session_id: Option<&str>,
    org_id: Option<&str>,
    max_tokens: Option<i64>,
) -> Result<SessionInfo> {
    let max = max_tokens.unwrap_or(config.working_memory.default_max_tokens);
    if max <= 0 {
        return Err(MemoryError::Validation(format!(
            "max_tokens must be positive, got {max}"
        )));
    }
    let sid = session_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Some(session) = load_session(conn, &sid)? {
        if session_expired(&session) {
            reset_expired_session(conn, deadline, &sid)?;
            return Ok(SessionInfo {
                session_id: sid,
                created: true,
                total_tokens: 0,
                max_tokens: max,
            });
        }
        let now = now_rfc3339();
        with_write_retry(deadline, || {
            conn.execute(
                "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
                params![now, sid],
            )
        })?;
        return Ok(SessionInfo {
            session_id: sid,
            created: false,
            total_tokens: session.total_tokens,
            max_tokens: session.max_tokens,
        });
    }

    let now = now_rfc3339();
    with_write_retry(deadline, || {
        conn.execute(
            "INSERT INTO sessions (session_id, user_id, org_id, max_tokens, total_tokens, created_at, last_activity) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![sid, user_id, org_id, max, now],
        )
    })?;

    Ok(SessionInfo {
        session_id: sid,
        created: true,
        total_tokens: 0,
        max_tokens: max,
    })
}

#[derive(Debug)]
pub struct AppendRequest {
    pub session_id: String,
    pub user_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub pinned: bool,
    pub relevance: f64,
}

#[derive(Debug, Serialize)]
pub struct EvictedItem {
    pub item_id: String,
    pub token_count: i64,
    pub promoted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppendOutcome {
    pub item_id: String,
    pub token_count: i64,
    pub sequence_num: i64,
    pub evicted: Vec<EvictedItem>,
}

/// Append an item, evicting lower-priority items first when the session
/// would overflow. Auto-creates the session on first reference.
pub fn append_item(
    conn: &mut Connection,
    model: &ModelGateway,
    config: &EngramConfig,
    deadline: Deadline,
    req: AppendRequest,
) -> Result<AppendOutcome> {
    if req.content.is_empty() {
        return Err(MemoryError::Validation("content must not be empty".into()));
    }
    if !(0.0..=1.0).contains(&req.relevance) {
        return Err(MemoryError::Validation(format!(
            "relevance must be within [0.0, 1.0], got {}",
            req.relevance
        )));
    }
    if req.content_type != ContentType::System {
        security::check_content(&req.content)?;
    }

    let session = ensure_session(conn, config, deadline, &req.session_id, &req.user_id)?;
    let token_count = count_tokens(&req.content);
    if token_count > session.max_tokens {
        return Err(MemoryError::Validation(format!(
            "item is {token_count} tokens, session capacity is {}",
            session.max_tokens
        )));
    }

    // Eviction runs before the insert returns success.
    let mut evicted = Vec::new();
    if session.total_tokens + token_count > session.max_tokens {
        let needed = session.total_tokens + token_count - session.max_tokens;
        evicted = evict(conn, model, config, deadline, &req.session_id, &session.user_id, needed)?;
    }

    let item_id = uuid::Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let mut sequence_num = 0i64;

    with_write_retry(deadline, || {
        let tx = conn.transaction()?;
        sequence_num = tx.query_row(
            "SELECT COALESCE(MAX(sequence_num), 0) + 1 FROM working_memory_items WHERE session_id = ?1",
            params![req.session_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO working_memory_items \
             (item_id, session_id, user_id, content_type, content, token_count, \
              relevance_score, pinned, sequence_num, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                item_id,
                req.session_id,
                session.user_id,
                req.content_type.as_str(),
                req.content,
                token_count,
                req.relevance,
                req.pinned,
                sequence_num,
                now,
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET total_tokens = total_tokens + ?1, last_activity = ?2 \
             WHERE session_id = ?3",
            params![token_count, now, req.session_id],
        )?;
        tx.commit()
    })?;

    Ok(AppendOutcome {
        item_id,
        token_count,
        sequence_num,
        evicted,
    })
}

struct EvictionCandidate {
    item_id: String,
    content: String,
    content_type: ContentType,
    token_count: i64,
    relevance: f64,
    priority: f64,
}

/// Remove the lowest-priority unpinned items until at least `needed` tokens
/// are freed. Items above the promotion threshold (or carrying task state)
/// are stored to long-term memory before removal.
fn evict(
    conn: &mut Connection,
    model: &ModelGateway,
    config: &EngramConfig,
    deadline: Deadline,
    session_id: &str,
    user_id: &str,
    needed: i64,
) -> Result<Vec<EvictedItem>> {
    let mut candidates: Vec<EvictionCandidate> = {
        let mut stmt = conn.prepare(
            "SELECT item_id, content, content_type, token_count, relevance_score, created_at \
             FROM working_memory_items WHERE session_id = ?1 AND pinned = 0",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let content_type: String = row.get(2)?;
                let created_at: String = row.get(5)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    content_type,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                    created_at,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(item_id, content, ct, token_count, relevance, created_at)| {
                let content_type: ContentType =
                    ct.parse().unwrap_or(ContentType::Message);
                let age_seconds = crate::memory::age_days(&created_at) * 86_400.0;
                let priority = 100.0 * relevance
                    + 10.0 / (1.0 + age_seconds / 3_600.0)
                    + if content_type == ContentType::TaskState { 10.0 } else { 0.0 };
                EvictionCandidate {
                    item_id,
                    content,
                    content_type,
                    token_count,
                    relevance,
                    priority,
                }
            })
            .collect()
    };

    // Lowest priority goes first.
    candidates.sort_by(|a, b| {
        a.priority
            .partial_cmp(&b.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut evicted = Vec::new();
    let mut freed = 0i64;

    for candidate in candidates {
        if freed >= needed {
            break;
        }

        let should_promote = candidate.relevance
            >= config.working_memory.eviction_promotion_threshold
            || candidate.content_type == ContentType::TaskState;

        let mut memory_id = None;
        if should_promote && promotable(candidate.content_type) {
            match store_memory(
                conn,
                model,
                config,
                deadline,
                StoreRequest {
                    user_id: user_id.to_string(),
                    content: candidate.content.clone(),
                    importance: Some(candidate.relevance),
                    source_session: Some(session_id.to_string()),
                    source_type: Some("eviction".to_string()),
                    ..StoreRequest::default()
                },
            ) {
                Ok(outcome) => memory_id = Some(outcome.memory_id),
                Err(err) => {
                    // The item is still evicted; losing the promotion is
                    // preferable to failing the append.
                    tracing::warn!(item = %candidate.item_id, error = %err, "eviction promotion failed");
                }
            }
        }

        let now = now_rfc3339();
        with_write_retry(deadline, || {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM working_memory_items WHERE item_id = ?1",
                params![candidate.item_id],
            )?;
            tx.execute(
                "UPDATE sessions SET total_tokens = total_tokens - ?1, last_activity = ?2 \
                 WHERE session_id = ?3",
                params![candidate.token_count, now, session_id],
            )?;
            tx.commit()
        })?;

        freed += candidate.token_count;
        evicted.push(EvictedItem {
            item_id: candidate.item_id,
            token_count: candidate.token_count,
            promoted: memory_id.is_some(),
            memory_id,
        });
    }

    Ok(evicted)
}

/// Retrieved memories already live in long-term storage and system content
/// is not the user's to keep.
fn promotable(content_type: ContentType) -> bool {
    !matches!(content_type, ContentType::System | ContentType::RetrievedMemory)
}

#[derive(Debug, Serialize)]
pub struct WorkingView {
    pub items: Vec<WorkingItem>,
    pub total_tokens: i64,
    pub session_total_tokens: i64,
    pub truncated: bool,
    pub item_count: usize,
}

/// Items ordered by (pinned desc, relevance desc, sequence desc), greedily
/// filled up to the token budget. Items that do not fit stay persisted.
pub fn get_items(
    conn: &Connection,
    session_id: &str,
    token_budget: Option<i64>,
    include_types: Option<&[ContentType]>,
) -> Result<WorkingView> {
    let session = load_session(conn, session_id)?
        .ok_or_else(|| MemoryError::NotFound(format!("session {session_id}")))?;

    if let Some(budget) = token_budget {
        if budget < 0 {
            return Err(MemoryError::Validation(format!(
                "token_budget must be nonnegative, got {budget}"
            )));
        }
    }
    let budget = token_budget.unwrap_or(session.max_tokens);

    let mut stmt = conn.prepare(
        "SELECT item_id, session_id, content_type, content, token_count, \
                relevance_score, pinned, sequence_num, created_at \
         FROM working_memory_items WHERE session_id = ?1 \
         ORDER BY pinned DESC, relevance_score DESC, sequence_num DESC",
    )?;
    let all: Vec<WorkingItem> = stmt
        .query_map(params![session_id], map_item_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut items = Vec::new();
    let mut used = 0i64;
    for item in all {
        if let Some(types) = include_types {
            if !types.contains(&item.content_type) {
                continue;
            }
        }
        if used + item.token_count <= budget {
            used += item.token_count;
            items.push(item);
        }
    }

    Ok(WorkingView {
        total_tokens: used,
        session_total_tokens: session.total_tokens,
        truncated: used < session.total_tokens,
        item_count: items.len(),
        items,
    })
}

/// Update an item's pinned flag and/or relevance score.
pub fn update_item(
    conn: &mut Connection,
    deadline: Deadline,
    session_id: &str,
    item_id: &str,
    pinned: Option<bool>,
    relevance: Option<f64>,
) -> Result<()> {
    if pinned.is_none() && relevance.is_none() {
        return Err(MemoryError::Validation("no updates provided".into()));
    }
    if let Some(relevance) = relevance {
        if !(0.0..=1.0).contains(&relevance) {
            return Err(MemoryError::Validation(format!(
                "relevance must be within [0.0, 1.0], got {relevance}"
            )));
        }
    }

    let now = now_rfc3339();
    let updated = with_write_retry(deadline, || {
        conn.execute(
            "UPDATE working_memory_items SET \
                pinned = COALESCE(?1, pinned), \
                relevance_score = COALESCE(?2, relevance_score), \
                last_accessed = ?3 \
             WHERE item_id = ?4 AND session_id = ?5",
            params![pinned, relevance, now, item_id, session_id],
        )
    })?;

    if updated == 0 {
        return Err(MemoryError::NotFound(format!(
            "item {item_id} in session {session_id}"
        )));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct CheckpointOutcome {
    pub memories_created: usize,
    pub memories_merged: usize,
    pub items_examined: usize,
}

/// Promote durable items (relevance ≥ threshold or pinned) to long-term
/// memory without deleting anything.
pub fn checkpoint(
    conn: &mut Connection,
    model: &ModelGateway,
    config: &EngramConfig,
    deadline: Deadline,
    session_id: &str,
) -> Result<CheckpointOutcome> {
    let session = load_session(conn, session_id)?
        .ok_or_else(|| MemoryError::NotFound(format!("session {session_id}")))?;
    promote_durable_items(conn, model, config, deadline, session_id, &session.user_id)
}

#[derive(Debug, Serialize)]
pub struct ClearOutcome {
    pub items_cleared: usize,
    pub memories_created: usize,
    pub memories_merged: usize,
    pub remaining_tokens: i64,
}

/// Clear a session. With `checkpoint_first` (the default), durable items are
/// promoted before deletion; the session row itself survives with an empty
/// item bag and a zero token total.
pub fn clear_session(
    conn: &mut Connection,
    model: &ModelGateway,
    config: &EngramConfig,
    deadline: Deadline,
    session_id: &str,
    checkpoint_first: bool,
) -> Result<ClearOutcome> {
    let session = load_session(conn, session_id)?
        .ok_or_else(|| MemoryError::NotFound(format!("session {session_id}")))?;

    let promotion = if checkpoint_first {
        promote_durable_items(conn, model, config, deadline, session_id, &session.user_id)?
    } else {
        CheckpointOutcome {
            memories_created: 0,
            memories_merged: 0,
            items_examined: 0,
        }
    };

    let now = now_rfc3339();
    let mut cleared = 0usize;
    with_write_retry(deadline, || {
        let tx = conn.transaction()?;
        cleared = tx.execute(
            "DELETE FROM working_memory_items WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute(
            "UPDATE sessions SET total_tokens = 0, last_activity = ?1 WHERE session_id = ?2",
            params![now, session_id],
        )?;
        tx.commit()
    })?;

    Ok(ClearOutcome {
        items_cleared: cleared,
        memories_created: promotion.memories_created,
        memories_merged: promotion.memories_merged,
        remaining_tokens: 0,
    })
}

/// The shared promotion pass for checkpoint and clear: relevance ≥ threshold
/// or pinned, excluding system and already-stored retrieved content. The
/// dedup gate inside the store path keeps repeated checkpoints from piling
/// up duplicate rows.
fn promote_durable_items(
    conn: &mut Connection,
    model: &ModelGateway,
    config: &EngramConfig,
    deadline: Deadline,
    session_id: &str,
    user_id: &str,
) -> Result<CheckpointOutcome> {
    let threshold = config.working_memory.checkpoint_relevance_threshold;
    let items: Vec<(String, ContentType, f64)> = {
        let mut stmt = conn.prepare(
            "SELECT content, content_type, relevance_score FROM working_memory_items \
             WHERE session_id = ?1 AND (relevance_score >= ?2 OR pinned = 1) \
             ORDER BY sequence_num ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id, threshold], |row| {
                let ct: String = row.get(1)?;
                Ok((
                    row.get::<_, String>(0)?,
                    ct.parse().unwrap_or(ContentType::Message),
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut created = 0usize;
    let mut merged = 0usize;
    let examined = items.len();

    for (content, content_type, relevance) in items {
        if !promotable(content_type) {
            continue;
        }
        deadline.check("checkpoint promotion")?;
        match store_memory(
            conn,
            model,
            config,
            deadline,
            StoreRequest {
                user_id: user_id.to_string(),
                content,
                importance: Some(relevance),
                source_session: Some(session_id.to_string()),
                source_type: Some("checkpoint".to_string()),
                ..StoreRequest::default()
            },
        ) {
            Ok(outcome) if outcome.action == StoreAction::CreatedNew => created += 1,
            Ok(_) => merged += 1,
            Err(err) => {
                tracing::warn!(session = %session_id, error = %err, "checkpoint promotion failed for item");
            }
        }
    }

    Ok(CheckpointOutcome {
        memories_created: created,
        memories_merged: merged,
        items_examined: examined,
    })
}

fn ensure_session(
    conn: &mut Connection,
    config: &EngramConfig,
    deadline: Deadline,
    session_id: &str,
    user_id: &str,
) -> Result<Session> {
    match load_session(conn, session_id)? {
        Some(session) if !session_expired(&session) => Ok(session),
        Some(_) => {
            reset_expired_session(conn, deadline, session_id)?;
            load_session(conn, session_id)?
                .ok_or_else(|| MemoryError::Internal("session vanished during reset".into()))
        }
        None => {
            init_session(conn, config, deadline, user_id, Some(session_id), None, None)?;
            load_session(conn, session_id)?
                .ok_or_else(|| MemoryError::Internal("session vanished after create".into()))
        }
    }
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    let row = conn
        .query_row(
            "SELECT session_id, user_id, org_id, max_tokens, total_tokens, config, \
             created_at, last_activity, expires_at FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                let config_str: Option<String> = row.get(5)?;
                Ok(Session {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    org_id: row.get(2)?,
                    max_tokens: row.get(3)?,
                    total_tokens: row.get(4)?,
                    config: config_str.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at: row.get(6)?,
                    last_activity: row.get(7)?,
                    expires_at: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn session_expired(session: &Session) -> bool {
    session
        .expires_at
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .is_some_and(|t| t <= chrono::Utc::now())
}

/// An expired session transitions back to absent: items dropped, counters
/// reset, a fresh lifetime begins under the same key.
fn reset_expired_session(
    conn: &mut Connection,
    deadline: Deadline,
    session_id: &str,
) -> Result<()> {
    let now = now_rfc3339();
    with_write_retry(deadline, || {
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM working_memory_items WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute(
            "UPDATE sessions SET total_tokens = 0, created_at = ?1, last_activity = ?1, \
             expires_at = NULL WHERE session_id = ?2",
            params![now, session_id],
        )?;
        tx.commit()
    })?;
    Ok(())
}

fn map_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkingItem> {
    let content_type: String = row.get(2)?;
    Ok(WorkingItem {
        item_id: row.get(0)?,
        session_id: row.get(1)?,
        content_type: content_type.parse().unwrap_or(ContentType::Message),
        content: row.get(3)?,
        token_count: row.get(4)?,
        relevance_score: row.get(5)?,
        pinned: row.get(6)?,
        sequence_num: row.get(7)?,
        created_at: row.get(8)?,
    })
}

//! Read path — vector recall ranked by the composite relevance score.
//!
//! Candidates come from the store gateway's KNN primitive; each is rescored
//! as a weighted sum of semantic similarity, recency, access frequency, and
//! importance. Returned memories get their access bookkeeping bumped in one
//! batched write; the access log is appended best-effort.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::{EngramConfig, RetrievalConfig};
use crate::db::retry::{with_write_retry, Deadline};
use crate::db::vector;
use crate::error::Result;
use crate::memory::store::{fetch_memory, map_memory_row};
use crate::memory::types::Memory;
use crate::memory::{age_days, now_rfc3339, truncate_preview};
use crate::model::count_tokens;
use crate::taxonomy::MemoryCategory;

/// Inputs for a recall operation.
#[derive(Debug, Default)]
pub struct RecallRequest {
    pub user_id: String,
    pub query_text: String,
    pub categories: Option<Vec<MemoryCategory>>,
    pub subtypes: Option<Vec<String>>,
    /// Exact-match entities; matching memories get a similarity boost.
    pub entities: Option<Vec<String>>,
    pub limit: usize,
    pub min_similarity: Option<f64>,
    /// Pull each result's strongest outgoing relationships.
    pub include_related: bool,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RelatedMemory {
    pub memory_id: String,
    pub relationship: String,
    pub strength: f64,
    pub content_preview: String,
}

#[derive(Debug, Serialize)]
pub struct RecalledMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub similarity: f64,
    pub relevance: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedMemory>,
}

#[derive(Debug, Default, Serialize)]
pub struct RecallBreakdown {
    pub by_category: HashMap<String, usize>,
    pub by_subtype: HashMap<String, usize>,
    pub entity_matches: usize,
}

#[derive(Debug, Serialize)]
pub struct RecallResponse {
    pub memories: Vec<RecalledMemory>,
    pub total_returned: usize,
    pub query_tokens: i64,
    pub breakdown: RecallBreakdown,
}

/// The composite relevance score used to rank recall candidates.
pub fn composite_relevance(
    config: &RetrievalConfig,
    similarity: f64,
    age_in_days: f64,
    access_count: i64,
    importance: f64,
) -> f64 {
    let recency = (-age_in_days / config.recency_half_life_days).exp();
    let cap = (1.0 + config.access_count_cap as f64).ln();
    let frequency = if cap > 0.0 {
        ((1.0 + access_count.max(0) as f64).ln() / cap).min(1.0)
    } else {
        0.0
    };
    config.weight_semantic * similarity
        + config.weight_recency * recency
        + config.weight_frequency * frequency
        + config.weight_importance * importance
}

/// Recall memories for a query embedding. Only the requesting user's
/// non-deleted rows are ever considered.
pub fn recall(
    conn: &mut Connection,
    config: &EngramConfig,
    deadline: Deadline,
    query_embedding: &[f32],
    req: &RecallRequest,
) -> Result<RecallResponse> {
    let query_tokens = count_tokens(&req.query_text);
    if req.limit == 0 {
        return Ok(empty_response(query_tokens));
    }

    // Some vector backends fail KNN over an empty set; cheap to skip anyway.
    let user_memory_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM long_term_memories WHERE user_id = ?1 AND deleted_at IS NULL",
        params![req.user_id],
        |row| row.get(0),
    )?;
    if user_memory_count == 0 {
        return Ok(empty_response(query_tokens));
    }

    let min_similarity = req
        .min_similarity
        .unwrap_or(config.retrieval.min_similarity);
    let filters = vector::SearchFilters {
        categories: req.categories.clone(),
        subtypes: req.subtypes.clone(),
        ..vector::SearchFilters::default()
    };
    let hits = vector::search(
        conn,
        query_embedding,
        &req.user_id,
        &filters,
        min_similarity,
        req.limit * 3,
    )?;

    let entity_filter: Option<HashSet<&str>> = req
        .entities
        .as_ref()
        .map(|e| e.iter().map(String::as_str).collect());

    let mut scored: Vec<(Memory, f64, f64)> = Vec::new();
    for hit in &hits {
        let Some(memory) = fetch_memory(conn, &hit.memory_id, Some(&req.user_id), false)? else {
            continue;
        };

        // Entity boost raises effective similarity for exact entity matches.
        let mut similarity = hit.similarity;
        if let Some(wanted) = &entity_filter {
            let matches = memory
                .entities
                .iter()
                .filter(|e| wanted.contains(e.as_str()))
                .count();
            if matches > 0 {
                similarity = (similarity * (1.0 + 0.2 * matches as f64)).min(1.0);
            }
        }

        let relevance = composite_relevance(
            &config.retrieval,
            similarity,
            age_days(&memory.created_at),
            memory.access_count,
            memory.importance,
        );
        scored.push((memory, similarity, relevance));
    }

    // Rank by relevance; ties fall back to importance, then recency of
    // creation.
    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.0.importance
                    .partial_cmp(&a.0.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.0.created_at.cmp(&a.0.created_at))
    });
    scored.truncate(req.limit);

    // Batched access bookkeeping: one write transaction for all returned
    // rows.
    let returned_ids: Vec<String> = scored.iter().map(|(m, _, _)| m.memory_id.clone()).collect();
    if !returned_ids.is_empty() {
        let now = now_rfc3339();
        with_write_retry(deadline, || {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE long_term_memories SET access_count = access_count + 1, \
                     last_accessed = ?1 WHERE memory_id = ?2",
                )?;
                for id in &returned_ids {
                    stmt.execute(params![now, id])?;
                }
            }
            tx.commit()
        })?;
    }

    // Access log is best-effort and sits outside the write above; counts and
    // log can drift under crash.
    for (memory, similarity, _) in &scored {
        log_access(
            conn,
            &memory.memory_id,
            req.session_id.as_deref().unwrap_or(""),
            &req.user_id,
            &req.query_text,
            *similarity,
        );
    }

    let mut breakdown = RecallBreakdown::default();
    let mut seen: HashSet<String> = returned_ids.iter().cloned().collect();
    let mut memories = Vec::with_capacity(scored.len());

    for (memory, similarity, relevance) in scored {
        *breakdown
            .by_category
            .entry(memory.memory_category.as_str().to_string())
            .or_insert(0) += 1;
        *breakdown
            .by_subtype
            .entry(memory.memory_subtype.clone())
            .or_insert(0) += 1;
        if let Some(wanted) = &entity_filter {
            if memory.entities.iter().any(|e| wanted.contains(e.as_str())) {
                breakdown.entity_matches += 1;
            }
        }

        let related = if req.include_related {
            related_memories(conn, &memory.memory_id, &req.user_id, &mut seen)?
        } else {
            Vec::new()
        };

        memories.push(RecalledMemory {
            memory,
            similarity,
            relevance,
            related,
        });
    }

    Ok(RecallResponse {
        total_returned: memories.len(),
        query_tokens,
        breakdown,
        memories,
    })
}

/// The strongest outgoing edges of one memory, hydrated with previews.
fn related_memories(
    conn: &Connection,
    memory_id: &str,
    user_id: &str,
    seen: &mut HashSet<String>,
) -> Result<Vec<RelatedMemory>> {
    let mut stmt = conn.prepare(
        "SELECT r.target_id, r.relationship, r.strength, m.content \
         FROM memory_relationships r \
         JOIN long_term_memories m ON m.memory_id = r.target_id \
         WHERE r.source_id = ?1 AND r.user_id = ?2 AND m.deleted_at IS NULL \
         ORDER BY r.strength DESC LIMIT 3",
    )?;
    let rows = stmt
        .query_map(params![memory_id, user_id], |row| {
            let content: String = row.get(3)?;
            Ok(RelatedMemory {
                memory_id: row.get(0)?,
                relationship: row.get(1)?,
                strength: row.get(2)?,
                content_preview: truncate_preview(&content, 100),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter(|r| seen.insert(r.memory_id.clone()))
        .collect())
}

/// Append one access-log row. Best-effort: failures are logged and dropped.
pub(crate) fn log_access(
    conn: &Connection,
    memory_id: &str,
    session_id: &str,
    user_id: &str,
    query_text: &str,
    similarity: f64,
) {
    let access_id = uuid::Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let query = truncate_preview(query_text, 500);
    if let Err(err) = conn.execute(
        "INSERT INTO memory_access_log \
         (access_id, memory_id, session_id, user_id, query_text, similarity_score, accessed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![access_id, memory_id, session_id, user_id, query, similarity, now],
    ) {
        tracing::warn!(error = %err, "access log write failed");
    }
}

fn empty_response(query_tokens: i64) -> RecallResponse {
    RecallResponse {
        memories: Vec::new(),
        total_returned: 0,
        query_tokens,
        breakdown: RecallBreakdown::default(),
    }
}

/// Hydrate memories by id, preserving input order. Used by analytics paths;
/// performs no search and no access tracking.
pub fn get_by_ids(conn: &Connection, user_id: &str, ids: &[String]) -> Result<Vec<Memory>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (2..ids.len() + 2).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT memory_id, user_id, memory_category, memory_subtype, content, \
         summary, entities, metadata, event_time, is_temporal, importance, \
         access_count, decay_factor, supersedes, source_session, source_type, \
         confidence, created_at, last_accessed, updated_at, deleted_at \
         FROM long_term_memories \
         WHERE user_id = ?1 AND deleted_at IS NULL AND memory_id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut params_vec: Vec<&dyn rusqlite::types::ToSql> = vec![&user_id];
    for id in ids {
        params_vec.push(id);
    }
    let rows = stmt
        .query_map(params_vec.as_slice(), map_memory_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let by_id: HashMap<&str, &Memory> =
        rows.iter().map(|m| (m.memory_id.as_str(), m)).collect();
    Ok(ids
        .iter()
        .filter_map(|id| by_id.get(id.as_str()).map(|m| (*m).clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::{
        hash_embedding, insert_memory_raw, spike_embedding, test_config, test_conn, STUB_DIM,
    };

    fn request(user: &str, query: &str) -> RecallRequest {
        RecallRequest {
            user_id: user.to_string(),
            query_text: query.to_string(),
            limit: 10,
            ..RecallRequest::default()
        }
    }

    #[test]
    fn recall_finds_semantically_close_memories() {
        let mut conn = test_conn();
        let config = test_config();

        let query_emb = hash_embedding("postgres version", STUB_DIM);
        let close = insert_memory_raw(
            &conn, "u1", "semantic", "project", "Project uses PostgreSQL 15", 0.5, &[], &query_emb,
        );
        insert_memory_raw(
            &conn,
            "u1",
            "semantic",
            "project",
            "Unrelated fact about fonts",
            0.5,
            &[],
            &spike_embedding(3),
        );

        let response = recall(
            &mut conn,
            &config,
            Deadline::unbounded(),
            &query_emb,
            &request("u1", "postgres version"),
        )
        .unwrap();

        assert_eq!(response.total_returned, 1);
        assert_eq!(response.memories[0].memory.memory_id, close);
        assert!(response.memories[0].similarity > 0.99);
        assert_eq!(response.breakdown.by_category["semantic"], 1);
    }

    #[test]
    fn recall_never_crosses_users() {
        let mut conn = test_conn();
        let config = test_config();

        let emb = spike_embedding(1);
        insert_memory_raw(&conn, "alice", "semantic", "project", "X", 0.5, &[], &emb);

        let mut req = request("bob", "X");
        req.min_similarity = Some(0.0);
        let response = recall(&mut conn, &config, Deadline::unbounded(), &emb, &req).unwrap();
        assert_eq!(response.total_returned, 0);
    }

    #[test]
    fn recall_skips_soft_deleted() {
        let mut conn = test_conn();
        let config = test_config();

        let emb = spike_embedding(1);
        let id = insert_memory_raw(&conn, "u1", "semantic", "project", "gone", 0.5, &[], &emb);
        conn.execute(
            "UPDATE long_term_memories SET deleted_at = ?1 WHERE memory_id = ?2",
            params![now_rfc3339(), id],
        )
        .unwrap();

        let response = recall(
            &mut conn,
            &config,
            Deadline::unbounded(),
            &emb,
            &request("u1", "gone"),
        )
        .unwrap();
        assert_eq!(response.total_returned, 0);
    }

    #[test]
    fn composite_score_prefers_importance_on_equal_similarity() {
        let mut conn = test_conn();
        let config = test_config();

        let emb = spike_embedding(5);
        let low = insert_memory_raw(&conn, "u1", "semantic", "domain", "low importance", 0.2, &[], &emb);
        let high = insert_memory_raw(&conn, "u1", "semantic", "domain", "high importance", 0.9, &[], &emb);

        let response = recall(
            &mut conn,
            &config,
            Deadline::unbounded(),
            &emb,
            &request("u1", "anything"),
        )
        .unwrap();

        assert_eq!(response.total_returned, 2);
        assert_eq!(response.memories[0].memory.memory_id, high);
        assert_eq!(response.memories[1].memory.memory_id, low);
        assert!(response.memories[0].relevance > response.memories[1].relevance);
    }

    #[test]
    fn recall_updates_access_bookkeeping_and_log() {
        let mut conn = test_conn();
        let config = test_config();

        let emb = spike_embedding(2);
        let id = insert_memory_raw(&conn, "u1", "semantic", "domain", "tracked", 0.5, &[], &emb);

        let mut req = request("u1", "tracked fact");
        req.session_id = Some("sess-9".to_string());
        recall(&mut conn, &config, Deadline::unbounded(), &emb, &req).unwrap();

        let (access_count, last_accessed): (i64, Option<String>) = conn
            .query_row(
                "SELECT access_count, last_accessed FROM long_term_memories WHERE memory_id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(access_count, 1);
        assert!(last_accessed.is_some());

        let (log_count, session_id): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(session_id) FROM memory_access_log WHERE memory_id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(log_count, 1);
        assert_eq!(session_id, "sess-9");
    }

    #[test]
    fn entity_boost_lifts_matching_memories() {
        let mut conn = test_conn();
        let config = test_config();

        // Same embedding, same importance; only the entity set differs.
        let emb = spike_embedding(7);
        let plain = insert_memory_raw(&conn, "u1", "semantic", "entity", "users table plain", 0.5, &[], &emb);
        let tagged = insert_memory_raw(
            &conn, "u1", "semantic", "entity", "users table tagged", 0.5, &["table:users"], &emb,
        );

        let mut req = request("u1", "users table");
        req.entities = Some(vec!["table:users".to_string()]);
        let response = recall(&mut conn, &config, Deadline::unbounded(), &emb, &req).unwrap();

        assert_eq!(response.memories[0].memory.memory_id, tagged);
        assert_eq!(response.memories[1].memory.memory_id, plain);
        assert_eq!(response.breakdown.entity_matches, 1);
    }

    #[test]
    fn category_filter_restricts_results() {
        let mut conn = test_conn();
        let config = test_config();

        let emb = spike_embedding(9);
        insert_memory_raw(&conn, "u1", "episodic", "event", "it happened", 0.5, &[], &emb);
        let sem = insert_memory_raw(&conn, "u1", "semantic", "domain", "it is known", 0.5, &[], &emb);

        let mut req = request("u1", "it");
        req.categories = Some(vec![MemoryCategory::Semantic]);
        let response = recall(&mut conn, &config, Deadline::unbounded(), &emb, &req).unwrap();

        assert_eq!(response.total_returned, 1);
        assert_eq!(response.memories[0].memory.memory_id, sem);
    }

    #[test]
    fn include_related_pulls_linked_memories() {
        let mut conn = test_conn();
        let config = test_config();

        let emb_a = spike_embedding(1);
        let emb_b = spike_embedding(2);
        let a = insert_memory_raw(&conn, "u1", "semantic", "project", "memory a", 0.5, &[], &emb_a);
        let b = insert_memory_raw(&conn, "u1", "semantic", "project", "memory b", 0.5, &[], &emb_b);
        conn.execute(
            "INSERT INTO memory_relationships \
             (relationship_id, source_id, target_id, user_id, relationship, strength, created_at, created_by) \
             VALUES ('r1', ?1, ?2, 'u1', 'related_to', 0.9, ?3, 'user')",
            params![a, b, now_rfc3339()],
        )
        .unwrap();

        let mut req = request("u1", "memory a");
        req.include_related = true;
        let response = recall(&mut conn, &config, Deadline::unbounded(), &emb_a, &req).unwrap();

        let primary = response
            .memories
            .iter()
            .find(|m| m.memory.memory_id == a)
            .unwrap();
        assert_eq!(primary.related.len(), 1);
        assert_eq!(primary.related[0].memory_id, b);
        assert_eq!(primary.related[0].relationship, "related_to");
    }

    #[test]
    fn empty_store_returns_empty() {
        let mut conn = test_conn();
        let config = test_config();
        let emb = spike_embedding(0);

        let response = recall(
            &mut conn,
            &config,
            Deadline::unbounded(),
            &emb,
            &request("nobody", "anything"),
        )
        .unwrap();
        assert_eq!(response.total_returned, 0);
        assert!(response.query_tokens > 0);
    }

    #[test]
    fn get_by_ids_preserves_order_and_ownership() {
        let conn = test_conn();
        let a = insert_memory_raw(&conn, "u1", "semantic", "domain", "first", 0.5, &[], &spike_embedding(1));
        let b = insert_memory_raw(&conn, "u1", "semantic", "domain", "second", 0.5, &[], &spike_embedding(2));
        let other = insert_memory_raw(&conn, "u2", "semantic", "domain", "foreign", 0.5, &[], &spike_embedding(3));

        let rows = get_by_ids(
            &conn,
            "u1",
            &[b.clone(), other.clone(), a.clone()],
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].memory_id, b);
        assert_eq!(rows[1].memory_id, a);
    }
}

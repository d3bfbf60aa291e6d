//! Context assembly: fill a token budget with the most relevant mix of
//! working memory and long-term memory for a query.
//!
//! The split across sources follows the intent's weight profile. Working
//! memory is taken in session order; long-term candidates are gathered per
//! `<category>.<subtype>` pool, scored as `importance × weight`, boosted for
//! focus-entity matches, and greedily selected. Items that would overflow
//! the budget are skipped whole, never truncated.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::EngramConfig;
use crate::db::vector;
use crate::error::{MemoryError, Result};
use crate::memory::recall::log_access;
use crate::memory::store::fetch_memory;
use crate::model::count_tokens;
use crate::taxonomy::{retrieval_weights, Intent, MemoryCategory, WORKING_MEMORY_KEY};

/// Candidates fetched per `<category>.<subtype>` pool.
const CANDIDATES_PER_POOL: usize = 5;
/// Pools with a sub-budget below this are skipped outright.
const MIN_POOL_BUDGET: i64 = 50;
/// Similarity floor for long-term candidates during assembly.
const ASSEMBLY_MIN_SIMILARITY: f64 = 0.5;

#[derive(Debug)]
pub struct ContextQuery {
    pub session_id: String,
    pub user_id: String,
    pub query_text: String,
    pub token_budget: i64,
    pub focus_entities: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ContextItem {
    /// `"working_memory"` or `"long_term"`.
    pub source: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_subtype: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    pub token_count: i64,
    pub score: f64,
    pub why_included: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RetrievalStats {
    pub working_memory_items: usize,
    pub long_term_items: usize,
    pub by_category: HashMap<String, usize>,
    pub by_subtype: HashMap<String, usize>,
    pub entity_boost_applied: bool,
}

#[derive(Debug, Serialize)]
pub struct ContextResponse {
    pub context_items: Vec<ContextItem>,
    pub total_tokens: i64,
    pub budget_used_pct: f64,
    pub detected_intent: Intent,
    pub retrieval_stats: RetrievalStats,
}

struct LongTermCandidate {
    memory_id: String,
    content: String,
    category: MemoryCategory,
    subtype: String,
    entities: Vec<String>,
    token_count: i64,
    similarity: f64,
    score: f64,
    entity_match: bool,
}

/// Assemble context for a resolved intent and a pre-computed query
/// embedding. One access-log row is appended per long-term item returned.
pub fn assemble(
    conn: &Connection,
    config: &EngramConfig,
    intent: Intent,
    query_embedding: &[f32],
    query: &ContextQuery,
) -> Result<ContextResponse> {
    if query.token_budget <= 0 {
        return Err(MemoryError::Validation(format!(
            "token_budget must be positive, got {}",
            query.token_budget
        )));
    }

    let weights = retrieval_weights(intent);
    let working_weight = weights
        .iter()
        .find(|(key, _)| *key == WORKING_MEMORY_KEY)
        .map(|(_, w)| *w)
        .unwrap_or(0.0);

    let mut items = Vec::new();
    let mut total_tokens = 0i64;
    let mut stats = RetrievalStats {
        entity_boost_applied: !query.focus_entities.is_empty(),
        ..RetrievalStats::default()
    };

    // Phase 1: working memory, in session order (pinned first, then newest).
    let working_budget = (query.token_budget as f64 * working_weight) as i64;
    for item in working_items(conn, &query.session_id)? {
        if total_tokens + item.token_count > working_budget {
            continue;
        }
        total_tokens += item.token_count;
        stats.working_memory_items += 1;
        items.push(ContextItem {
            source: "working_memory",
            why_included: format!("recent {} from current session", item.content_type),
            content: item.content,
            content_type: Some(item.content_type),
            memory_category: None,
            memory_subtype: None,
            entities: Vec::new(),
            token_count: item.token_count,
            score: item.relevance_score,
        });
    }

    // Phase 2: long-term candidates per weighted pool.
    let remaining = query.token_budget - total_tokens;
    let mut candidates: Vec<LongTermCandidate> = Vec::new();
    for (key, weight) in weights {
        if *key == WORKING_MEMORY_KEY || *weight <= 0.0 {
            continue;
        }
        let Some((category_str, subtype)) = key.split_once('.') else {
            continue;
        };
        let pool_budget = (remaining as f64 * weight) as i64;
        if pool_budget < MIN_POOL_BUDGET {
            continue;
        }
        let category: MemoryCategory = category_str
            .parse()
            .map_err(|e: String| MemoryError::Internal(e))?;

        let hits = vector::search(
            conn,
            query_embedding,
            &query.user_id,
            &vector::SearchFilters {
                categories: Some(vec![category]),
                subtypes: Some(vec![subtype.to_string()]),
                ..vector::SearchFilters::default()
            },
            ASSEMBLY_MIN_SIMILARITY,
            CANDIDATES_PER_POOL,
        )?;

        for hit in hits {
            let Some(memory) = fetch_memory(conn, &hit.memory_id, Some(&query.user_id), false)?
            else {
                continue;
            };
            candidates.push(LongTermCandidate {
                token_count: count_tokens(&memory.content),
                similarity: hit.similarity,
                score: memory.importance * weight,
                entity_match: false,
                memory_id: memory.memory_id,
                content: memory.content,
                category,
                subtype: subtype.to_string(),
                entities: memory.entities,
            });
        }
    }

    // Phase 3: focus-entity boost.
    if !query.focus_entities.is_empty() {
        let focus: HashSet<&str> = query.focus_entities.iter().map(String::as_str).collect();
        for candidate in &mut candidates {
            let matches = candidate
                .entities
                .iter()
                .filter(|e| focus.contains(e.as_str()))
                .count();
            if matches > 0 {
                candidate.score *= 1.0 + 0.3 * matches as f64;
                candidate.entity_match = true;
            }
        }
    }

    // Phase 4: greedy selection by score; overflowing items are skipped, and
    // near-duplicate contents collapse to the first occurrence.
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut seen_content: HashSet<u64> = HashSet::new();
    for candidate in candidates {
        if total_tokens + candidate.token_count > query.token_budget {
            continue;
        }
        if !seen_content.insert(content_hash(&candidate.content)) {
            continue;
        }

        total_tokens += candidate.token_count;
        stats.long_term_items += 1;
        *stats
            .by_category
            .entry(candidate.category.as_str().to_string())
            .or_insert(0) += 1;
        *stats
            .by_subtype
            .entry(candidate.subtype.clone())
            .or_insert(0) += 1;

        log_access(
            conn,
            &candidate.memory_id,
            &query.session_id,
            &query.user_id,
            &query.query_text,
            candidate.similarity,
        );

        let why_included = if candidate.entity_match {
            format!(
                "{}.{} (score {:.2}, entity match)",
                candidate.category, candidate.subtype, candidate.score
            )
        } else {
            format!(
                "{}.{} (score {:.2})",
                candidate.category, candidate.subtype, candidate.score
            )
        };
        items.push(ContextItem {
            source: "long_term",
            content: candidate.content,
            content_type: None,
            memory_category: Some(candidate.category.as_str().to_string()),
            memory_subtype: Some(candidate.subtype),
            entities: candidate.entities,
            token_count: candidate.token_count,
            score: candidate.score,
            why_included,
        });
    }

    let budget_used_pct =
        (total_tokens as f64 / query.token_budget as f64 * 10_000.0).round() / 100.0;

    Ok(ContextResponse {
        context_items: items,
        total_tokens,
        budget_used_pct,
        detected_intent: intent,
        retrieval_stats: stats,
    })
}

struct WorkingRow {
    content_type: String,
    content: String,
    token_count: i64,
    relevance_score: f64,
}

/// Session items ordered for assembly: pinned first, then newest by
/// sequence. A missing session simply contributes nothing.
fn working_items(conn: &Connection, session_id: &str) -> Result<Vec<WorkingRow>> {
    let mut stmt = conn.prepare(
        "SELECT content_type, content, token_count, relevance_score \
         FROM working_memory_items WHERE session_id = ?1 \
         ORDER BY pinned DESC, sequence_num DESC",
    )?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok(WorkingRow {
                content_type: row.get(0)?,
                content: row.get(1)?,
                token_count: row.get(2)?,
                relevance_score: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Near-duplicate detection keys on the first 200 characters.
fn content_hash(content: &str) -> u64 {
    let prefix: String = content.chars().take(200).collect();
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    hasher.finish()
}

//! Offline lifecycle maintenance: importance decay, contradiction detection,
//! and the per-user quality report.
//!
//! None of this runs implicitly during a recall; a maintenance client calls
//! these operations on its own schedule.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::EngramConfig;
use crate::db::retry::{with_write_retry, Deadline};
use crate::db::vector::bytes_to_embedding;
use crate::error::{MemoryError, Result};
use crate::memory::{now_rfc3339, truncate_preview};

#[derive(Debug, Serialize)]
pub struct DecayOutcome {
    pub affected: usize,
    pub rate: f64,
    pub inactive_days: i64,
}

/// Multiply importance by `rate` for every memory of `user_id` that has not
/// been accessed within `inactive_days`, clamped to the configured floor.
pub fn apply_decay(
    conn: &mut Connection,
    config: &EngramConfig,
    deadline: Deadline,
    user_id: &str,
    rate: Option<f64>,
    inactive_days: Option<i64>,
) -> Result<DecayOutcome> {
    let rate = rate.unwrap_or(config.decay.rate);
    let inactive_days = inactive_days.unwrap_or(config.decay.inactive_days);
    if !(0.0..=1.0).contains(&rate) {
        return Err(MemoryError::Validation(format!(
            "decay rate must be within [0.0, 1.0], got {rate}"
        )));
    }
    if inactive_days < 0 {
        return Err(MemoryError::Validation(format!(
            "inactive_days must be nonnegative, got {inactive_days}"
        )));
    }

    let floor = config.decay.importance_floor;
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(inactive_days)).to_rfc3339();
    let now = now_rfc3339();

    let affected = with_write_retry(deadline, || {
        conn.execute(
            "UPDATE long_term_memories \
             SET importance = MAX(importance * ?1, ?2), updated_at = ?3 \
             WHERE user_id = ?4 AND deleted_at IS NULL \
               AND COALESCE(last_accessed, created_at) < ?5",
            params![rate, floor, now, user_id, cutoff],
        )
    })?;

    tracing::info!(user = %user_id, affected, rate, "decay applied");
    Ok(DecayOutcome {
        affected,
        rate,
        inactive_days,
    })
}

/// A pair of memories that likely disagree: semantically close but lexically
/// divergent. The newer one is the candidate to supersede the older.
#[derive(Debug, Serialize)]
pub struct ContradictionCandidate {
    /// Candidate superseder (the newer memory).
    pub newer_id: String,
    pub older_id: String,
    pub similarity: f64,
    pub jaccard: f64,
    pub newer_preview: String,
    pub older_preview: String,
}

/// Scan a user's memories for contradiction candidates: cosine similarity at
/// or above `threshold` with token-set Jaccard below 0.5. Offline; pairwise
/// over the user's live rows.
pub fn find_contradictions(
    conn: &Connection,
    config: &EngramConfig,
    user_id: &str,
    threshold: Option<f64>,
    limit: usize,
) -> Result<Vec<ContradictionCandidate>> {
    let threshold = threshold.unwrap_or(config.retrieval.contradiction_threshold);

    struct Row {
        memory_id: String,
        content: String,
        created_at: String,
        embedding: Vec<f32>,
    }

    let rows: Vec<Row> = {
        let mut stmt = conn.prepare(
            "SELECT m.memory_id, m.content, m.created_at, v.embedding \
             FROM long_term_memories m \
             JOIN memories_vec v ON v.memory_id = m.memory_id \
             WHERE m.user_id = ?1 AND m.deleted_at IS NULL",
        )?;
        let collected = stmt
            .query_map(params![user_id], |row| {
                let bytes: Vec<u8> = row.get(3)?;
                Ok(Row {
                    memory_id: row.get(0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                    embedding: bytes_to_embedding(&bytes),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        collected
    };

    let mut candidates = Vec::new();
    for i in 0..rows.len() {
        for j in (i + 1)..rows.len() {
            let similarity = cosine(&rows[i].embedding, &rows[j].embedding);
            if similarity < threshold {
                continue;
            }
            let jaccard = token_jaccard(&rows[i].content, &rows[j].content);
            if jaccard >= 0.5 {
                continue;
            }
            let (older, newer) = if rows[i].created_at <= rows[j].created_at {
                (&rows[i], &rows[j])
            } else {
                (&rows[j], &rows[i])
            };
            candidates.push(ContradictionCandidate {
                newer_id: newer.memory_id.clone(),
                older_id: older.memory_id.clone(),
                similarity,
                jaccard,
                newer_preview: truncate_preview(&newer.content, 100),
                older_preview: truncate_preview(&older.content, 100),
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(limit);
    Ok(candidates)
}

#[derive(Debug, Serialize)]
pub struct CategoryStats {
    pub count: i64,
    pub avg_importance: f64,
    pub avg_access: f64,
}

#[derive(Debug, Serialize)]
pub struct StaleMemory {
    pub memory_id: String,
    pub content_preview: String,
    pub memory_category: String,
    pub importance: f64,
    pub access_count: i64,
}

#[derive(Debug, Serialize)]
pub struct QualityReport {
    pub user_id: String,
    pub generated_at: String,
    pub total_memories: i64,
    pub avg_importance: f64,
    pub avg_access_count: f64,
    pub never_accessed: i64,
    pub low_importance: i64,
    pub by_category: std::collections::HashMap<String, CategoryStats>,
    pub stale_memories: Vec<StaleMemory>,
    pub potential_contradictions: Vec<ContradictionCandidate>,
    pub health_score: u32,
    pub health_status: &'static str,
}

/// Analyze a user's memory health: distribution, staleness, contradictions,
/// and an aggregate 0-100 score.
pub fn quality_report(
    conn: &Connection,
    config: &EngramConfig,
    user_id: &str,
    include_contradictions: bool,
    include_stale: bool,
) -> Result<QualityReport> {
    let (total, avg_importance, avg_access, never_accessed, low_importance): (
        i64,
        f64,
        f64,
        i64,
        i64,
    ) = conn.query_row(
        "SELECT COUNT(*), COALESCE(AVG(importance), 0), COALESCE(AVG(access_count), 0), \
                COALESCE(SUM(CASE WHEN access_count = 0 THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN importance < 0.3 THEN 1 ELSE 0 END), 0) \
         FROM long_term_memories WHERE user_id = ?1 AND deleted_at IS NULL",
        params![user_id],
        |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        },
    )?;

    let mut by_category = std::collections::HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT memory_category, COUNT(*), AVG(importance), AVG(access_count) \
             FROM long_term_memories WHERE user_id = ?1 AND deleted_at IS NULL \
             GROUP BY memory_category",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                CategoryStats {
                    count: row.get(1)?,
                    avg_importance: row.get(2)?,
                    avg_access: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (category, stats) = row?;
            by_category.insert(category, stats);
        }
    }

    let stale_memories = if include_stale {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(30)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT memory_id, content, memory_category, importance, access_count \
             FROM long_term_memories \
             WHERE user_id = ?1 AND deleted_at IS NULL \
               AND COALESCE(last_accessed, created_at) < ?2 AND access_count < 2 \
             ORDER BY importance ASC LIMIT 5",
        )?;
        let result = stmt.query_map(params![user_id, cutoff], |row| {
            let content: String = row.get(1)?;
            Ok(StaleMemory {
                memory_id: row.get(0)?,
                content_preview: truncate_preview(&content, 100),
                memory_category: row.get(2)?,
                importance: row.get(3)?,
                access_count: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
        result
    } else {
        Vec::new()
    };

    let potential_contradictions = if include_contradictions {
        find_contradictions(conn, config, user_id, None, 5)?
    } else {
        Vec::new()
    };

    let health_score = health_score(
        total,
        never_accessed,
        low_importance,
        potential_contradictions.len(),
    );

    Ok(QualityReport {
        user_id: user_id.to_string(),
        generated_at: now_rfc3339(),
        total_memories: total,
        avg_importance,
        avg_access_count: avg_access,
        never_accessed,
        low_importance,
        by_category,
        stale_memories,
        potential_contradictions,
        health_score,
        health_status: health_status(health_score),
    })
}

fn health_score(total: i64, never_accessed: i64, low_importance: i64, contradictions: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    let mut score = 100.0;
    score -= 30.0 * never_accessed as f64 / total as f64;
    score -= 20.0 * low_importance as f64 / total as f64;
    score -= (5.0 * contradictions as f64).min(20.0);
    score.clamp(0.0, 100.0).round() as u32
}

fn health_status(score: u32) -> &'static str {
    match score {
        90..=100 => "excellent",
        70..=89 => "good",
        50..=69 => "fair",
        _ => "needs_attention",
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Jaccard similarity over lowercase alphanumeric token sets.
fn token_jaccard(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    };
    let set_a = tokens(a);
    let set_b = tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::{insert_memory_raw, spike_embedding, test_config, test_conn};

    fn backdate_access(conn: &Connection, memory_id: &str, days: i64) {
        let stamp = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        conn.execute(
            "UPDATE long_term_memories SET last_accessed = ?1 WHERE memory_id = ?2",
            params![stamp, memory_id],
        )
        .unwrap();
    }

    fn backdate_creation(conn: &Connection, memory_id: &str, days: i64) {
        let stamp = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        conn.execute(
            "UPDATE long_term_memories SET created_at = ?1 WHERE memory_id = ?2",
            params![stamp, memory_id],
        )
        .unwrap();
    }

    #[test]
    fn decay_hits_only_inactive_memories() {
        let mut conn = test_conn();
        let config = test_config();

        let stale = insert_memory_raw(&conn, "u1", "semantic", "domain", "stale", 0.8, &[], &spike_embedding(1));
        let fresh = insert_memory_raw(&conn, "u1", "semantic", "domain", "fresh", 0.8, &[], &spike_embedding(2));
        backdate_access(&conn, &stale, 30);
        backdate_access(&conn, &fresh, 1);

        let outcome = apply_decay(&mut conn, &config, Deadline::unbounded(), "u1", None, None)
            .unwrap();
        assert_eq!(outcome.affected, 1);

        let stale_importance: f64 = conn
            .query_row(
                "SELECT importance FROM long_term_memories WHERE memory_id = ?1",
                params![stale],
                |r| r.get(0),
            )
            .unwrap();
        assert!((stale_importance - 0.8 * 0.98).abs() < 1e-9);

        let fresh_importance: f64 = conn
            .query_row(
                "SELECT importance FROM long_term_memories WHERE memory_id = ?1",
                params![fresh],
                |r| r.get(0),
            )
            .unwrap();
        assert!((fresh_importance - 0.8).abs() < 1e-9);
    }

    #[test]
    fn decay_never_accessed_falls_back_to_creation_time() {
        let mut conn = test_conn();
        let config = test_config();

        let old = insert_memory_raw(&conn, "u1", "semantic", "domain", "never touched", 0.5, &[], &spike_embedding(1));
        backdate_creation(&conn, &old, 60);

        let outcome = apply_decay(&mut conn, &config, Deadline::unbounded(), "u1", None, None)
            .unwrap();
        assert_eq!(outcome.affected, 1);
    }

    #[test]
    fn decay_clamps_to_floor() {
        let mut conn = test_conn();
        let config = test_config();

        let id = insert_memory_raw(&conn, "u1", "semantic", "domain", "nearly gone", 0.1, &[], &spike_embedding(1));
        backdate_access(&conn, &id, 30);

        apply_decay(&mut conn, &config, Deadline::unbounded(), "u1", Some(0.5), None).unwrap();

        let importance: f64 = conn
            .query_row(
                "SELECT importance FROM long_term_memories WHERE memory_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert!((importance - 0.1).abs() < 1e-9, "floor not applied: {importance}");
    }

    #[test]
    fn decay_scoped_to_user() {
        let mut conn = test_conn();
        let config = test_config();

        let other = insert_memory_raw(&conn, "u2", "semantic", "domain", "other user", 0.8, &[], &spike_embedding(1));
        backdate_access(&conn, &other, 30);

        let outcome = apply_decay(&mut conn, &config, Deadline::unbounded(), "u1", None, None)
            .unwrap();
        assert_eq!(outcome.affected, 0);
    }

    #[test]
    fn decay_validates_rate() {
        let mut conn = test_conn();
        let config = test_config();
        let err = apply_decay(&mut conn, &config, Deadline::unbounded(), "u1", Some(1.5), None)
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn contradictions_flag_similar_but_divergent_pairs() {
        let conn = test_conn();
        let config = test_config();

        // Same embedding direction, very different wording.
        let emb = spike_embedding(1);
        let older = insert_memory_raw(&conn, "u1", "semantic", "project", "deploys happen every friday afternoon", 0.5, &[], &emb);
        let newer = insert_memory_raw(&conn, "u1", "semantic", "project", "release cadence moved to tuesday mornings", 0.5, &[], &emb);
        backdate_creation(&conn, &older, 10);

        // High lexical overlap pair: not a contradiction.
        let emb2 = spike_embedding(2);
        insert_memory_raw(&conn, "u1", "semantic", "domain", "the users table has a primary key", 0.5, &[], &emb2);
        insert_memory_raw(&conn, "u1", "semantic", "domain", "the users table has a primary key id", 0.5, &[], &emb2);

        let found = find_contradictions(&conn, &config, "u1", None, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].newer_id, newer);
        assert_eq!(found[0].older_id, older);
        assert!(found[0].similarity >= 0.75);
        assert!(found[0].jaccard < 0.5);
    }

    #[test]
    fn contradictions_ignore_other_users_and_deleted() {
        let conn = test_conn();
        let config = test_config();

        let emb = spike_embedding(1);
        insert_memory_raw(&conn, "u1", "semantic", "project", "fact from alice version one", 0.5, &[], &emb);
        insert_memory_raw(&conn, "u2", "semantic", "project", "completely different wording here", 0.5, &[], &emb);

        let found = find_contradictions(&conn, &config, "u1", None, 10).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn quality_report_aggregates() {
        let conn = test_conn();
        let config = test_config();

        let a = insert_memory_raw(&conn, "u1", "semantic", "domain", "accessed often", 0.9, &[], &spike_embedding(1));
        conn.execute(
            "UPDATE long_term_memories SET access_count = 12 WHERE memory_id = ?1",
            params![a],
        )
        .unwrap();
        let stale = insert_memory_raw(&conn, "u1", "episodic", "event", "old and ignored", 0.1, &[], &spike_embedding(2));
        backdate_creation(&conn, &stale, 90);

        let report = quality_report(&conn, &config, "u1", true, true).unwrap();
        assert_eq!(report.total_memories, 2);
        assert_eq!(report.never_accessed, 1);
        assert_eq!(report.low_importance, 1);
        assert_eq!(report.by_category.len(), 2);
        assert_eq!(report.stale_memories.len(), 1);
        assert_eq!(report.stale_memories[0].memory_id, stale);
        assert!(report.health_score < 100);
    }

    #[test]
    fn quality_report_empty_user_is_healthy() {
        let conn = test_conn();
        let config = test_config();
        let report = quality_report(&conn, &config, "ghost", true, true).unwrap();
        assert_eq!(report.total_memories, 0);
        assert_eq!(report.health_score, 100);
        assert_eq!(report.health_status, "excellent");
    }

    #[test]
    fn jaccard_basics() {
        assert!((token_jaccard("a b c", "a b c") - 1.0).abs() < 1e-9);
        assert_eq!(token_jaccard("a b", "c d"), 0.0);
        let half = token_jaccard("a b c d", "a b x y");
        assert!(half < 0.5);
    }
}

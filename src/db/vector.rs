//! Vector-search primitive over the `memories_vec` vec0 index.
//!
//! sqlite-vec KNN returns L2 distance; embeddings are L2-normalized by the
//! model gateway, so distance converts exactly to cosine similarity via
//! `sim = 1 − d²/2`. Callers always receive cosine similarity in [−1, 1].

use std::collections::HashSet;

use rusqlite::{params, Connection};

use crate::error::{MemoryError, Result};
use crate::taxonomy::MemoryCategory;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert raw bytes back to an f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Convert a cosine similarity threshold to an L2 distance threshold.
///
/// For L2-normalized vectors: `L2_dist = sqrt(2 * (1 - cosine_similarity))`.
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).max(0.0).sqrt()
}

/// Convert an L2 distance between normalized vectors to cosine similarity.
pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}

/// Optional post-filters applied to KNN candidates.
#[derive(Debug, Default, Clone)]
pub struct SearchFilters {
    pub categories: Option<Vec<MemoryCategory>>,
    pub subtypes: Option<Vec<String>>,
    /// Memory must share at least one entity with this set.
    pub entities: Option<Vec<String>>,
    /// RFC 3339 bounds on `event_time`.
    pub event_after: Option<String>,
    pub event_before: Option<String>,
    pub min_confidence: Option<f64>,
}

/// One KNN hit, annotated with cosine similarity.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub memory_id: String,
    pub similarity: f64,
}

struct CandidateRow {
    memory_id: String,
    category: String,
    subtype: String,
    entities: String,
    event_time: Option<String>,
    confidence: f64,
}

/// KNN search over a user's non-deleted memories.
///
/// Returns up to `limit` hits ordered by descending cosine similarity, each
/// at or above `min_similarity`. The query vector length must match the
/// index dimension.
pub fn search(
    conn: &Connection,
    query: &[f32],
    user_id: &str,
    filters: &SearchFilters,
    min_similarity: f64,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    check_dimension(conn, query.len())?;

    // Overfetch: ownership and filters are applied after the KNN pass.
    let knn_limit = (limit * 8).max(50);
    let max_distance = cosine_threshold_to_l2(min_similarity);
    let query_bytes = embedding_to_bytes(query);

    let mut stmt = conn.prepare(
        "SELECT memory_id, distance FROM memories_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let neighbors: Vec<(String, f64)> = stmt
        .query_map(params![query_bytes, knn_limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let entity_filter: Option<HashSet<&str>> = filters
        .entities
        .as_ref()
        .map(|e| e.iter().map(String::as_str).collect());

    let mut hits = Vec::new();
    for (memory_id, distance) in neighbors {
        // Ordered by distance; everything past the threshold is too far.
        if distance > max_distance {
            break;
        }

        let row = match fetch_candidate(conn, &memory_id, user_id)? {
            Some(row) => row,
            None => continue,
        };

        if let Some(categories) = &filters.categories {
            if !categories.iter().any(|c| c.as_str() == row.category) {
                continue;
            }
        }
        if let Some(subtypes) = &filters.subtypes {
            if !subtypes.iter().any(|s| s == &row.subtype) {
                continue;
            }
        }
        if let Some(wanted) = &entity_filter {
            let memory_entities: Vec<String> =
                serde_json::from_str(&row.entities).unwrap_or_default();
            if !memory_entities.iter().any(|e| wanted.contains(e.as_str())) {
                continue;
            }
        }
        if let Some(after) = &filters.event_after {
            match &row.event_time {
                Some(t) if t >= after => {}
                _ => continue,
            }
        }
        if let Some(before) = &filters.event_before {
            match &row.event_time {
                Some(t) if t <= before => {}
                _ => continue,
            }
        }
        if let Some(floor) = filters.min_confidence {
            if row.confidence < floor {
                continue;
            }
        }

        hits.push(SearchHit {
            memory_id: row.memory_id,
            similarity: l2_to_cosine(distance),
        });
        if hits.len() >= limit {
            break;
        }
    }

    Ok(hits)
}

/// Fetch the stored embedding for one memory.
pub fn get_embedding(conn: &Connection, memory_id: &str) -> Result<Vec<f32>> {
    let bytes: Vec<u8> = conn
        .query_row(
            "SELECT embedding FROM memories_vec WHERE memory_id = ?1",
            params![memory_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                MemoryError::NotFound(format!("embedding for memory {memory_id}"))
            }
            other => other.into(),
        })?;
    Ok(bytes_to_embedding(&bytes))
}

/// Reject query vectors whose length does not match the index dimension.
fn check_dimension(conn: &Connection, query_len: usize) -> Result<()> {
    let dim = crate::db::migrations::get_embedding_dim(conn)
        .map_err(MemoryError::from)?
        .ok_or_else(|| MemoryError::Internal("embedding_dim missing from schema_meta".into()))?;
    if query_len != dim {
        return Err(MemoryError::Validation(format!(
            "query vector has {query_len} components, index dimension is {dim}"
        )));
    }
    Ok(())
}

fn fetch_candidate(
    conn: &Connection,
    memory_id: &str,
    user_id: &str,
) -> Result<Option<CandidateRow>> {
    use rusqlite::OptionalExtension;
    let row = conn
        .query_row(
            "SELECT memory_id, memory_category, memory_subtype, entities, event_time, confidence \
             FROM long_term_memories \
             WHERE memory_id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
            params![memory_id, user_id],
            |row| {
                Ok(CandidateRow {
                    memory_id: row.get(0)?,
                    category: row.get(1)?,
                    subtype: row.get(2)?,
                    entities: row.get(3)?,
                    event_time: row.get(4)?,
                    confidence: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let original = vec![0.25f32, -1.5, 3.75, 0.0];
        let bytes = embedding_to_bytes(&original).to_vec();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }

    #[test]
    fn cosine_l2_conversions_are_inverse() {
        for sim in [0.0, 0.5, 0.75, 0.92, 0.95, 1.0] {
            let dist = cosine_threshold_to_l2(sim);
            assert!((l2_to_cosine(dist) - sim).abs() < 1e-9);
        }
    }

    #[test]
    fn identical_vectors_have_similarity_one() {
        assert!((l2_to_cosine(0.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        // Unit vectors at 90°: L2 distance sqrt(2)
        let dist = std::f64::consts::SQRT_2;
        assert!(l2_to_cosine(dist).abs() < 1e-9);
    }
}

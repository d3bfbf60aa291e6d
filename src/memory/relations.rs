//! The directed relationship graph between memories.
//!
//! Edges live in a relationship table (edge list), never in list-valued
//! columns, and may form cycles. Both endpoints must belong to the same
//! user. Symmetric kinds (`related_to`, `contradicts`) get a mirror edge
//! when linked bidirectionally.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::db::retry::{with_write_retry, Deadline};
use crate::db::vector;
use crate::error::{MemoryError, Result};
use crate::memory::store::fetch_memory;
use crate::memory::types::RelationshipKind;
use crate::memory::{now_rfc3339, truncate_preview};

#[derive(Debug, Serialize)]
pub struct LinkOutcome {
    pub relationship_id: String,
    /// `"created"` or `"updated"`.
    pub action: &'static str,
    pub mirrored: bool,
}

/// Create (or refresh) a directed edge between two memories of one user.
#[allow(clippy::too_many_arguments)]
pub fn link_memories(
    conn: &mut Connection,
    deadline: Deadline,
    user_id: &str,
    source_id: &str,
    target_id: &str,
    kind: RelationshipKind,
    strength: f64,
    context: Option<&str>,
    bidirectional: bool,
) -> Result<LinkOutcome> {
    if source_id == target_id {
        return Err(MemoryError::Validation(
            "a memory cannot relate to itself".into(),
        ));
    }
    if !(0.0..=1.0).contains(&strength) {
        return Err(MemoryError::Validation(format!(
            "strength must be within [0.0, 1.0], got {strength}"
        )));
    }
    fetch_memory(conn, source_id, Some(user_id), false)?
        .ok_or_else(|| MemoryError::NotFound(format!("source memory {source_id}")))?;
    fetch_memory(conn, target_id, Some(user_id), false)?
        .ok_or_else(|| MemoryError::NotFound(format!("target memory {target_id}")))?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT relationship_id FROM memory_relationships \
             WHERE source_id = ?1 AND target_id = ?2 AND user_id = ?3",
            params![source_id, target_id, user_id],
            |row| row.get(0),
        )
        .optional()?;

    let now = now_rfc3339();
    let mirror = bidirectional && kind.is_symmetric();

    let (relationship_id, action) = match existing {
        Some(id) => {
            with_write_retry(deadline, || {
                conn.execute(
                    "UPDATE memory_relationships SET relationship = ?1, strength = ?2, context = ?3 \
                     WHERE relationship_id = ?4",
                    params![kind.as_str(), strength, context, id],
                )
            })?;
            (id, "updated")
        }
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            with_write_retry(deadline, || {
                conn.execute(
                    "INSERT INTO memory_relationships \
                     (relationship_id, source_id, target_id, user_id, relationship, \
                      strength, context, created_at, created_by) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'user')",
                    params![id, source_id, target_id, user_id, kind.as_str(), strength, context, now],
                )
            })?;
            (id, "created")
        }
    };

    if mirror {
        let mirror_id = uuid::Uuid::new_v4().to_string();
        with_write_retry(deadline, || {
            conn.execute(
                "INSERT OR IGNORE INTO memory_relationships \
                 (relationship_id, source_id, target_id, user_id, relationship, \
                  strength, context, created_at, created_by) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'user')",
                params![mirror_id, target_id, source_id, user_id, kind.as_str(), strength, context, now],
            )
        })?;
    }

    Ok(LinkOutcome {
        relationship_id,
        action,
        mirrored: mirror,
    })
}

/// Remove an edge (and optionally its mirror).
pub fn unlink_memories(
    conn: &mut Connection,
    deadline: Deadline,
    user_id: &str,
    source_id: &str,
    target_id: &str,
    bidirectional: bool,
) -> Result<usize> {
    let mut removed = with_write_retry(deadline, || {
        conn.execute(
            "DELETE FROM memory_relationships \
             WHERE source_id = ?1 AND target_id = ?2 AND user_id = ?3",
            params![source_id, target_id, user_id],
        )
    })?;
    if bidirectional {
        removed += with_write_retry(deadline, || {
            conn.execute(
                "DELETE FROM memory_relationships \
                 WHERE source_id = ?1 AND target_id = ?2 AND user_id = ?3",
                params![target_id, source_id, user_id],
            )
        })?;
    }
    Ok(removed)
}

#[derive(Debug, Serialize)]
pub struct RelatedEntry {
    pub memory_id: String,
    pub relationship: String,
    /// `"outgoing"` or `"incoming"`.
    pub direction: &'static str,
    pub strength: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub content_preview: String,
    pub memory_category: String,
    pub memory_subtype: String,
}

/// All memories related to `memory_id`, strongest edges first.
pub fn related_for(
    conn: &Connection,
    user_id: &str,
    memory_id: &str,
    kinds: Option<&[RelationshipKind]>,
    include_reverse: bool,
    limit: usize,
) -> Result<Vec<RelatedEntry>> {
    fetch_memory(conn, memory_id, Some(user_id), false)?
        .ok_or_else(|| MemoryError::NotFound(format!("memory {memory_id}")))?;

    let kind_matches = |relationship: &str| {
        kinds.is_none_or(|ks| ks.iter().any(|k| k.as_str() == relationship))
    };

    let mut entries = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT r.target_id, r.relationship, r.strength, r.context, \
                m.content, m.memory_category, m.memory_subtype \
         FROM memory_relationships r \
         JOIN long_term_memories m ON m.memory_id = r.target_id \
         WHERE r.source_id = ?1 AND r.user_id = ?2 AND m.deleted_at IS NULL \
         ORDER BY r.strength DESC",
    )?;
    let outgoing = stmt
        .query_map(params![memory_id, user_id], |row| {
            let content: String = row.get(4)?;
            Ok(RelatedEntry {
                memory_id: row.get(0)?,
                relationship: row.get(1)?,
                direction: "outgoing",
                strength: row.get(2)?,
                context: row.get(3)?,
                content_preview: truncate_preview(&content, 100),
                memory_category: row.get(5)?,
                memory_subtype: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    entries.extend(outgoing.into_iter().filter(|e| kind_matches(&e.relationship)));

    if include_reverse {
        let mut stmt = conn.prepare(
            "SELECT r.source_id, r.relationship, r.strength, r.context, \
                    m.content, m.memory_category, m.memory_subtype \
             FROM memory_relationships r \
             JOIN long_term_memories m ON m.memory_id = r.source_id \
             WHERE r.target_id = ?1 AND r.user_id = ?2 AND m.deleted_at IS NULL \
             ORDER BY r.strength DESC",
        )?;
        let incoming = stmt
            .query_map(params![memory_id, user_id], |row| {
                let content: String = row.get(4)?;
                Ok(RelatedEntry {
                    memory_id: row.get(0)?,
                    relationship: row.get(1)?,
                    direction: "incoming",
                    strength: row.get(2)?,
                    context: row.get(3)?,
                    content_preview: truncate_preview(&content, 100),
                    memory_category: row.get(5)?,
                    memory_subtype: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for entry in incoming {
            if kind_matches(&entry.relationship)
                && !entries.iter().any(|e| e.memory_id == entry.memory_id)
            {
                entries.push(entry);
            }
        }
    }

    entries.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    entries.truncate(limit);
    Ok(entries)
}

#[derive(Debug, Serialize)]
pub struct AutoLinkOutcome {
    pub memory_id: String,
    pub links_created: usize,
}

/// Link a memory to its nearest same-category neighbors with `related_to`
/// edges. Uses the stored embedding; no model call involved.
pub fn auto_link_similar(
    conn: &mut Connection,
    deadline: Deadline,
    user_id: &str,
    memory_id: &str,
    similarity_threshold: f64,
    max_links: usize,
) -> Result<AutoLinkOutcome> {
    let memory = fetch_memory(conn, memory_id, Some(user_id), false)?
        .ok_or_else(|| MemoryError::NotFound(format!("memory {memory_id}")))?;
    let embedding = vector::get_embedding(conn, memory_id)?;

    let hits = vector::search(
        conn,
        &embedding,
        user_id,
        &vector::SearchFilters {
            categories: Some(vec![memory.memory_category]),
            ..vector::SearchFilters::default()
        },
        similarity_threshold,
        max_links * 2,
    )?;

    let mut created = 0usize;
    for hit in hits {
        if created >= max_links {
            break;
        }
        if hit.memory_id == memory_id {
            continue;
        }
        let outcome = link_memories(
            conn,
            deadline,
            user_id,
            memory_id,
            &hit.memory_id,
            RelationshipKind::RelatedTo,
            hit.similarity.clamp(0.0, 1.0),
            Some(&format!("auto-linked by similarity ({:.2})", hit.similarity)),
            true,
        )?;
        if outcome.action == "created" {
            created += 1;
        }
    }

    Ok(AutoLinkOutcome {
        memory_id: memory_id.to_string(),
        links_created: created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::{insert_memory_raw, spike_embedding, test_conn};

    fn link(
        conn: &mut Connection,
        user: &str,
        source: &str,
        target: &str,
        kind: RelationshipKind,
        bidirectional: bool,
    ) -> LinkOutcome {
        link_memories(
            conn,
            Deadline::unbounded(),
            user,
            source,
            target,
            kind,
            0.8,
            None,
            bidirectional,
        )
        .unwrap()
    }

    #[test]
    fn link_creates_edge_and_dedups() {
        let mut conn = test_conn();
        let a = insert_memory_raw(&conn, "u1", "semantic", "entity", "alpha", 0.5, &[], &spike_embedding(1));
        let b = insert_memory_raw(&conn, "u1", "semantic", "entity", "beta", 0.5, &[], &spike_embedding(2));

        let first = link(&mut conn, "u1", &a, &b, RelationshipKind::PartOf, false);
        assert_eq!(first.action, "created");
        assert!(!first.mirrored);

        // Same pair again updates in place
        let second = link(&mut conn, "u1", &a, &b, RelationshipKind::DependsOn, false);
        assert_eq!(second.action, "updated");
        assert_eq!(second.relationship_id, first.relationship_id);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_relationships", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn symmetric_kinds_mirror_bidirectionally() {
        let mut conn = test_conn();
        let a = insert_memory_raw(&conn, "u1", "semantic", "entity", "alpha", 0.5, &[], &spike_embedding(1));
        let b = insert_memory_raw(&conn, "u1", "semantic", "entity", "beta", 0.5, &[], &spike_embedding(2));

        let outcome = link(&mut conn, "u1", &a, &b, RelationshipKind::RelatedTo, true);
        assert!(outcome.mirrored);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_relationships", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        // part_of is directional even when bidirectional is requested
        let c = insert_memory_raw(&conn, "u1", "semantic", "entity", "gamma", 0.5, &[], &spike_embedding(3));
        let directional = link(&mut conn, "u1", &a, &c, RelationshipKind::PartOf, true);
        assert!(!directional.mirrored);
    }

    #[test]
    fn cycles_are_legal() {
        let mut conn = test_conn();
        let a = insert_memory_raw(&conn, "u1", "semantic", "entity", "alpha", 0.5, &[], &spike_embedding(1));
        let b = insert_memory_raw(&conn, "u1", "semantic", "entity", "beta", 0.5, &[], &spike_embedding(2));

        link(&mut conn, "u1", &a, &b, RelationshipKind::DependsOn, false);
        link(&mut conn, "u1", &b, &a, RelationshipKind::DependsOn, false);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_relationships", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn cross_user_links_rejected() {
        let mut conn = test_conn();
        let mine = insert_memory_raw(&conn, "u1", "semantic", "entity", "mine", 0.5, &[], &spike_embedding(1));
        let theirs = insert_memory_raw(&conn, "u2", "semantic", "entity", "theirs", 0.5, &[], &spike_embedding(2));

        let err = link_memories(
            &mut conn,
            Deadline::unbounded(),
            "u1",
            &mine,
            &theirs,
            RelationshipKind::RelatedTo,
            1.0,
            None,
            false,
        )
        .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn self_link_rejected() {
        let mut conn = test_conn();
        let a = insert_memory_raw(&conn, "u1", "semantic", "entity", "alpha", 0.5, &[], &spike_embedding(1));
        let err = link_memories(
            &mut conn,
            Deadline::unbounded(),
            "u1",
            &a,
            &a,
            RelationshipKind::RelatedTo,
            1.0,
            None,
            false,
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn related_for_merges_directions() {
        let mut conn = test_conn();
        let a = insert_memory_raw(&conn, "u1", "semantic", "entity", "hub", 0.5, &[], &spike_embedding(1));
        let b = insert_memory_raw(&conn, "u1", "semantic", "entity", "spoke out", 0.5, &[], &spike_embedding(2));
        let c = insert_memory_raw(&conn, "u1", "semantic", "entity", "spoke in", 0.5, &[], &spike_embedding(3));

        link(&mut conn, "u1", &a, &b, RelationshipKind::PartOf, false);
        link(&mut conn, "u1", &c, &a, RelationshipKind::DependsOn, false);

        let related = related_for(&conn, "u1", &a, None, true, 10).unwrap();
        assert_eq!(related.len(), 2);
        assert!(related.iter().any(|e| e.memory_id == b && e.direction == "outgoing"));
        assert!(related.iter().any(|e| e.memory_id == c && e.direction == "incoming"));

        // Kind filter
        let only_part_of = related_for(
            &conn,
            "u1",
            &a,
            Some(&[RelationshipKind::PartOf]),
            true,
            10,
        )
        .unwrap();
        assert_eq!(only_part_of.len(), 1);
        assert_eq!(only_part_of[0].memory_id, b);
    }

    #[test]
    fn unlink_removes_mirror_when_asked() {
        let mut conn = test_conn();
        let a = insert_memory_raw(&conn, "u1", "semantic", "entity", "alpha", 0.5, &[], &spike_embedding(1));
        let b = insert_memory_raw(&conn, "u1", "semantic", "entity", "beta", 0.5, &[], &spike_embedding(2));

        link(&mut conn, "u1", &a, &b, RelationshipKind::RelatedTo, true);
        let removed = unlink_memories(&mut conn, Deadline::unbounded(), "u1", &a, &b, true).unwrap();
        assert_eq!(removed, 2);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_relationships", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn auto_link_connects_same_category_neighbors() {
        let mut conn = test_conn();
        // Two memories share an embedding direction; the third is orthogonal.
        let base = spike_embedding(1);
        let a = insert_memory_raw(&conn, "u1", "semantic", "entity", "close a", 0.5, &[], &base);
        let b = insert_memory_raw(&conn, "u1", "semantic", "entity", "close b", 0.5, &[], &base);
        insert_memory_raw(&conn, "u1", "semantic", "entity", "far away", 0.5, &[], &spike_embedding(9));
        // Same embedding but different category: never auto-linked.
        insert_memory_raw(&conn, "u1", "episodic", "event", "close event", 0.5, &[], &base);

        let outcome =
            auto_link_similar(&mut conn, Deadline::unbounded(), "u1", &a, 0.75, 5).unwrap();
        assert_eq!(outcome.links_created, 1);

        let (target, relationship): (String, String) = conn
            .query_row(
                "SELECT target_id, relationship FROM memory_relationships WHERE source_id = ?1",
                params![a],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(target, b);
        assert_eq!(relationship, "related_to");
    }
}

//! Store-level statistics for the monitoring tools.

use std::collections::HashMap;

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::Result;
use crate::memory::truncate_preview;

#[derive(Debug, Serialize)]
pub struct TopMemory {
    pub memory_id: String,
    pub memory_category: String,
    pub access_count: i64,
    pub importance: f64,
}

/// Whole-store counts for `get_stats`.
#[derive(Debug, Serialize)]
pub struct StoreSnapshot {
    pub long_term_memories: i64,
    pub active_sessions: i64,
    pub working_memory_items: i64,
    pub working_memory_tokens: i64,
    pub access_log_entries: i64,
    pub by_category: HashMap<String, i64>,
    pub top_accessed: Vec<TopMemory>,
}

pub fn store_snapshot(conn: &Connection) -> Result<StoreSnapshot> {
    let count = |sql: &str| -> Result<i64> {
        Ok(conn.query_row(sql, [], |row| row.get(0))?)
    };

    let long_term_memories =
        count("SELECT COUNT(*) FROM long_term_memories WHERE deleted_at IS NULL")?;
    let active_sessions = count("SELECT COUNT(*) FROM sessions")?;
    let working_memory_items = count("SELECT COUNT(*) FROM working_memory_items")?;
    let working_memory_tokens =
        count("SELECT COALESCE(SUM(token_count), 0) FROM working_memory_items")?;
    let access_log_entries = count("SELECT COUNT(*) FROM memory_access_log")?;

    let mut by_category = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT memory_category, COUNT(*) FROM long_term_memories \
             WHERE deleted_at IS NULL GROUP BY memory_category",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (category, n) = row?;
            by_category.insert(category, n);
        }
    }

    let top_accessed = {
        let mut stmt = conn.prepare(
            "SELECT memory_id, memory_category, access_count, importance \
             FROM long_term_memories WHERE deleted_at IS NULL \
             ORDER BY access_count DESC LIMIT 5",
        )?;
        let result = stmt.query_map([], |row| {
            Ok(TopMemory {
                memory_id: row.get(0)?,
                memory_category: row.get(1)?,
                access_count: row.get(2)?,
                importance: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
        result
    };

    Ok(StoreSnapshot {
        long_term_memories,
        active_sessions,
        working_memory_items,
        working_memory_tokens,
        access_log_entries,
        by_category,
        top_accessed,
    })
}

#[derive(Debug, Serialize)]
pub struct RecentQuery {
    pub query_text: String,
    pub similarity_score: Option<f64>,
    pub accessed_at: String,
}

/// Per-user usage analytics for `get_memory_analytics`.
#[derive(Debug, Serialize)]
pub struct MemoryAnalytics {
    pub user_id: String,
    pub total_memories: i64,
    pub soft_deleted: i64,
    pub by_category: HashMap<String, i64>,
    pub by_subtype: HashMap<String, i64>,
    pub by_source_type: HashMap<String, i64>,
    pub avg_importance: f64,
    pub never_accessed: i64,
    pub accesses_last_7_days: i64,
    pub top_accessed: Vec<TopMemory>,
    pub recent_queries: Vec<RecentQuery>,
}

pub fn memory_analytics(conn: &Connection, user_id: &str) -> Result<MemoryAnalytics> {
    let (total, soft_deleted, avg_importance, never_accessed): (i64, i64, f64, i64) = conn
        .query_row(
            "SELECT \
                COALESCE(SUM(CASE WHEN deleted_at IS NULL THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0), \
                COALESCE(AVG(CASE WHEN deleted_at IS NULL THEN importance END), 0), \
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND access_count = 0 THEN 1 ELSE 0 END), 0) \
             FROM long_term_memories WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    let group_counts = |column: &str| -> Result<HashMap<String, i64>> {
        let mut map = HashMap::new();
        let mut stmt = conn.prepare(&format!(
            "SELECT {column}, COUNT(*) FROM long_term_memories \
             WHERE user_id = ?1 AND deleted_at IS NULL GROUP BY {column}"
        ))?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (key, n) = row?;
            map.insert(key, n);
        }
        Ok(map)
    };

    let week_ago = (chrono::Utc::now() - chrono::Duration::days(7)).to_rfc3339();
    let accesses_last_7_days: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memory_access_log WHERE user_id = ?1 AND accessed_at >= ?2",
        params![user_id, week_ago],
        |row| row.get(0),
    )?;

    let top_accessed = {
        let mut stmt = conn.prepare(
            "SELECT memory_id, memory_category, access_count, importance \
             FROM long_term_memories WHERE user_id = ?1 AND deleted_at IS NULL \
             ORDER BY access_count DESC LIMIT 5",
        )?;
        let result = stmt.query_map(params![user_id], |row| {
            Ok(TopMemory {
                memory_id: row.get(0)?,
                memory_category: row.get(1)?,
                access_count: row.get(2)?,
                importance: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
        result
    };

    let recent_queries = {
        let mut stmt = conn.prepare(
            "SELECT COALESCE(query_text, ''), similarity_score, accessed_at \
             FROM memory_access_log WHERE user_id = ?1 \
             ORDER BY accessed_at DESC LIMIT 10",
        )?;
        let result = stmt.query_map(params![user_id], |row| {
            let query: String = row.get(0)?;
            Ok(RecentQuery {
                query_text: truncate_preview(&query, 120),
                similarity_score: row.get(1)?,
                accessed_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
        result
    };

    Ok(MemoryAnalytics {
        user_id: user_id.to_string(),
        total_memories: total,
        soft_deleted,
        by_category: group_counts("memory_category")?,
        by_subtype: group_counts("memory_subtype")?,
        by_source_type: group_counts("source_type")?,
        avg_importance,
        never_accessed,
        accesses_last_7_days,
        top_accessed,
        recent_queries,
    })
}

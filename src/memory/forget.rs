//! Deletion: soft delete (default), hard delete, and the GDPR erasure path.
//!
//! Soft delete sets `deleted_at`; every retrieval path ignores such rows
//! from that moment on, and the row stays restorable until a hard delete
//! runs. Hard delete removes the row, its vector, and every relationship
//! referencing it.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::retry::{with_write_retry, Deadline};
use crate::error::{MemoryError, Result};
use crate::memory::now_rfc3339;
use crate::memory::store::fetch_memory;

/// Literal token required by [`forget_all_for_user`].
pub const DELETE_ALL_CONFIRMATION: &str = "CONFIRM_DELETE_ALL";

#[derive(Debug, Serialize)]
pub struct ForgetOutcome {
    pub memory_id: String,
    pub hard_deleted: bool,
}

/// Forget one memory. The caller must own it.
pub fn forget_memory(
    conn: &mut Connection,
    deadline: Deadline,
    memory_id: &str,
    user_id: &str,
    hard_delete: bool,
) -> Result<ForgetOutcome> {
    fetch_memory(conn, memory_id, Some(user_id), true)?
        .ok_or_else(|| MemoryError::NotFound(format!("memory {memory_id}")))?;

    if hard_delete {
        with_write_retry(deadline, || {
            let tx = conn.transaction()?;
            // Relationships referencing the row go with it.
            tx.execute(
                "DELETE FROM memory_relationships WHERE source_id = ?1 OR target_id = ?1",
                params![memory_id],
            )?;
            tx.execute(
                "DELETE FROM memories_vec WHERE memory_id = ?1",
                params![memory_id],
            )?;
            tx.execute(
                "DELETE FROM long_term_memories WHERE memory_id = ?1 AND user_id = ?2",
                params![memory_id, user_id],
            )?;
            tx.commit()
        })?;
        tracing::info!(memory_id = %memory_id, "memory hard-deleted");
    } else {
        let now = now_rfc3339();
        with_write_retry(deadline, || {
            conn.execute(
                "UPDATE long_term_memories SET deleted_at = ?1, updated_at = ?1 \
                 WHERE memory_id = ?2 AND user_id = ?3 AND deleted_at IS NULL",
                params![now, memory_id, user_id],
            )
        })?;
        tracing::info!(memory_id = %memory_id, "memory soft-deleted");
    }

    Ok(ForgetOutcome {
        memory_id: memory_id.to_string(),
        hard_deleted: hard_delete,
    })
}

#[derive(Debug, Serialize)]
pub struct PurgeOutcome {
    pub user_id: String,
    pub memories_deleted: i64,
    pub sessions_deleted: i64,
}

/// GDPR erasure: hard-delete every row owned by the user across all tables.
/// Requires the literal confirmation token [`DELETE_ALL_CONFIRMATION`].
pub fn forget_all_for_user(
    conn: &mut Connection,
    deadline: Deadline,
    user_id: &str,
    confirmation: &str,
) -> Result<PurgeOutcome> {
    if confirmation != DELETE_ALL_CONFIRMATION {
        return Err(MemoryError::Validation(format!(
            "confirmation required: set confirmation to '{DELETE_ALL_CONFIRMATION}'"
        )));
    }

    let memory_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM long_term_memories WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    let session_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;

    with_write_retry(deadline, || {
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM memory_access_log WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM memory_relationships WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM working_memory_items WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM memories_vec WHERE memory_id IN \
             (SELECT memory_id FROM long_term_memories WHERE user_id = ?1)",
            params![user_id],
        )?;
        tx.execute(
            "DELETE FROM long_term_memories WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        tx.commit()
    })?;

    tracing::info!(user = %user_id, memories = memory_count, sessions = session_count, "all user data erased");

    Ok(PurgeOutcome {
        user_id: user_id.to_string(),
        memories_deleted: memory_count,
        sessions_deleted: session_count,
    })
}

//! Store gateway: database lifecycle, schema, migrations, retry, and the
//! vector-search primitive.
//!
//! The underlying store serializes write transactions; the shared
//! `Arc<Mutex<Connection>>` held by the server is the process-wide write
//! lock. WAL mode keeps readers from blocking behind the writer.

pub mod migrations;
pub mod retry;
pub mod schema;
pub mod vector;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the Engram database at the given path, with all
/// extensions loaded and schema initialized for the configured embedding
/// dimension. Tables and the vector index exist before any insertion.
pub fn open_database(path: impl AsRef<Path>, embedding_dim: usize) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path).with_context(|| {
        format!(
            "failed to open database at {}. If the file is corrupt, restore \
             from a backup or delete it to start fresh.",
            path.display()
        )
    })?;

    // WAL so readers proceed in parallel with the single writer
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Wait up to 5 seconds for locks instead of failing immediately
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn, embedding_dim).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("database integrity check failed: {integrity}");
    }

    tracing::info!(path = %path.display(), dim = embedding_dim, "database initialized");
    Ok(conn)
}

/// Result of a full database health check.
pub struct HealthReport {
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<usize>,
    pub integrity_ok: bool,
    pub sqlite_vec_version: String,
    pub session_count: i64,
    pub working_item_count: i64,
    pub memory_count: i64,
    pub relationship_count: i64,
    pub access_log_count: i64,
}

/// Run a comprehensive health check on the database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version =
        migrations::get_schema_version(conn).context("failed to read schema version")?;
    let embedding_model =
        migrations::get_embedding_model(conn).context("failed to read embedding model")?;
    let embedding_dim =
        migrations::get_embedding_dim(conn).context("failed to read embedding dim")?;

    let integrity: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .context("failed to run integrity check")?;

    let sqlite_vec_version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .context("failed to get sqlite-vec version")?;

    let count = |table: &str| -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .unwrap_or(0)
    };

    Ok(HealthReport {
        schema_version,
        embedding_model,
        embedding_dim,
        integrity_ok: integrity == "ok",
        sqlite_vec_version,
        session_count: count("sessions"),
        working_item_count: count("working_memory_items"),
        memory_count: count("long_term_memories"),
        relationship_count: count("memory_relationships"),
        access_log_count: count("memory_access_log"),
    })
}

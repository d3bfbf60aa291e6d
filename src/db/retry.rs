//! Bounded retry with exponential backoff for the write path.
//!
//! SQLite serializes writers; a writer that loses the race sees
//! `SQLITE_BUSY`/`SQLITE_LOCKED`. Those conflicts are retried with backoff
//! (initial 50 ms, factor 2, cap 1 s, at most 5 attempts) before surfacing as
//! `transient_store`. The deadline is polled between attempts so cancellation
//! stays cooperative.

use std::time::{Duration, Instant};

use crate::error::{MemoryError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_CAP: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 5;

/// A cooperative per-operation deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
        }
    }

    /// A deadline far enough out to never fire; used by tests and offline
    /// maintenance paths.
    pub fn unbounded() -> Self {
        Self::after(Duration::from_secs(24 * 3600))
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Error out if the deadline has elapsed.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.expired() {
            Err(MemoryError::Timeout(format!("deadline elapsed during {what}")))
        } else {
            Ok(())
        }
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Run a write closure, retrying transient store conflicts with bounded
/// exponential backoff. Non-transient errors surface immediately.
pub fn with_write_retry<T>(
    deadline: Deadline,
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;

    for attempt in 1..=MAX_ATTEMPTS {
        deadline.check("store write")?;

        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, "store busy, retrying");
                last_err = Some(err);
                if attempt < MAX_ATTEMPTS {
                    std::thread::sleep(backoff);
                    backoff = (backoff * BACKOFF_FACTOR).min(BACKOFF_CAP);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(MemoryError::TransientStore(format!(
        "write conflict persisted after {MAX_ATTEMPTS} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

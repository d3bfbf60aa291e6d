//! In-process metrics ring buffer for model and store calls.
//!
//! Each gateway call records latency, success, and token estimates here.
//! Rows are additionally queued for a best-effort flush into the
//! `service_metrics` table — a flush failure never fails the user operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Ring buffer capacity per service.
const MAX_HISTORY: usize = 1_000;

/// A single recorded call.
#[derive(Debug, Clone, Serialize)]
pub struct CallMetric {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub operation: String,
    pub latency_ms: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ServiceTotals {
    pub calls: u64,
    pub errors: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Windowed statistics for one service.
#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub calls: usize,
    pub errors: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Default)]
struct Inner {
    calls: HashMap<String, VecDeque<CallMetric>>,
    totals: HashMap<String, ServiceTotals>,
    pending: Vec<CallMetric>,
    started_at: Option<DateTime<Utc>>,
}

/// Thread-safe metrics registry shared by the gateways.
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                started_at: Some(Utc::now()),
                ..Inner::default()
            }),
        }
    }

    /// Record one call. Never fails; a poisoned lock drops the sample.
    #[allow(clippy::too_many_arguments)]
    pub fn record_call(
        &self,
        service: &str,
        operation: &str,
        latency_ms: f64,
        tokens_in: u64,
        tokens_out: u64,
        success: bool,
        error: Option<String>,
    ) {
        let metric = CallMetric {
            timestamp: Utc::now(),
            service: service.to_string(),
            operation: operation.to_string(),
            latency_ms,
            tokens_in,
            tokens_out,
            success,
            error,
        };
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let ring = inner.calls.entry(service.to_string()).or_default();
        if ring.len() >= MAX_HISTORY {
            ring.pop_front();
        }
        ring.push_back(metric.clone());

        let totals = inner.totals.entry(service.to_string()).or_default();
        totals.calls += 1;
        if !success {
            totals.errors += 1;
        }
        totals.tokens_in += tokens_in;
        totals.tokens_out += tokens_out;

        inner.pending.push(metric);
        // Bound the persistence queue too, in case nothing ever flushes.
        let excess = inner.pending.len().saturating_sub(MAX_HISTORY);
        if excess > 0 {
            inner.pending.drain(..excess);
        }
    }

    /// Run `f`, recording its latency and outcome under `service`/`operation`.
    pub fn timed<T, E: std::fmt::Display>(
        &self,
        service: &str,
        operation: &str,
        tokens_in: u64,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let start = Instant::now();
        let result = f();
        let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
        match &result {
            Ok(_) => self.record_call(service, operation, latency_ms, tokens_in, 0, true, None),
            Err(e) => self.record_call(
                service,
                operation,
                latency_ms,
                tokens_in,
                0,
                false,
                Some(e.to_string()),
            ),
        }
        result
    }

    /// Windowed statistics per service for the last `window_minutes`.
    pub fn stats(&self, window_minutes: i64) -> HashMap<String, ServiceStats> {
        let cutoff = Utc::now() - chrono::Duration::minutes(window_minutes);
        let Ok(inner) = self.inner.lock() else {
            return HashMap::new();
        };
        inner
            .calls
            .iter()
            .map(|(service, ring)| {
                let recent: Vec<&CallMetric> =
                    ring.iter().filter(|m| m.timestamp >= cutoff).collect();
                let mut latencies: Vec<f64> = recent.iter().map(|m| m.latency_ms).collect();
                latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let avg = if latencies.is_empty() {
                    0.0
                } else {
                    latencies.iter().sum::<f64>() / latencies.len() as f64
                };
                let p95 = if latencies.is_empty() {
                    0.0
                } else {
                    latencies[(latencies.len() * 95 / 100).min(latencies.len() - 1)]
                };
                (
                    service.clone(),
                    ServiceStats {
                        calls: recent.len(),
                        errors: recent.iter().filter(|m| !m.success).count(),
                        avg_latency_ms: avg,
                        p95_latency_ms: p95,
                        tokens_in: recent.iter().map(|m| m.tokens_in).sum(),
                        tokens_out: recent.iter().map(|m| m.tokens_out).sum(),
                    },
                )
            })
            .collect()
    }

    /// Lifetime totals per service.
    pub fn totals(&self) -> HashMap<String, ServiceTotals> {
        self.inner
            .lock()
            .map(|inner| inner.totals.clone())
            .unwrap_or_default()
    }

    /// Most recent calls for one service, newest first.
    pub fn recent_calls(&self, service: &str, limit: usize) -> Vec<CallMetric> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .calls
            .get(service)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// When this registry was created (process start, in practice).
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().ok().and_then(|i| i.started_at)
    }

    /// Drain metrics queued for database persistence.
    pub fn drain_pending(&self) -> Vec<CallMetric> {
        self.inner
            .lock()
            .map(|mut inner| std::mem::take(&mut inner.pending))
            .unwrap_or_default()
    }
}

/// Flush queued metrics into the `service_metrics` table. Best-effort: a
/// failure is logged and the samples are dropped, never the operation.
pub fn persist_pending(conn: &rusqlite::Connection, registry: &MetricsRegistry) {
    let pending = registry.drain_pending();
    if pending.is_empty() {
        return;
    }
    let result: rusqlite::Result<()> = (|| {
        let mut stmt = conn.prepare(
            "INSERT INTO service_metrics \
             (service, operation, latency_ms, success, error_msg, tokens_in, tokens_out, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for m in &pending {
            stmt.execute(rusqlite::params![
                m.service,
                m.operation,
                m.latency_ms,
                m.success,
                m.error,
                m.tokens_in as i64,
                m.tokens_out as i64,
                m.timestamp.to_rfc3339(),
            ])?;
        }
        Ok(())
    })();
    if let Err(err) = result {
        tracing::warn!(error = %err, dropped = pending.len(), "service metrics flush failed");
    }
}

/// Append one row to the `tool_error_log` table. Best-effort; the error
/// message carries structural information only, never content.
pub fn log_tool_error(
    conn: &rusqlite::Connection,
    tool_name: &str,
    error_type: &str,
    error_message: &str,
    user_id: Option<&str>,
) {
    if let Err(err) = conn.execute(
        "INSERT INTO tool_error_log (tool_name, error_type, error_message, user_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            tool_name,
            error_type,
            error_message,
            user_id,
            Utc::now().to_rfc3339()
        ],
    ) {
        tracing::warn!(error = %err, "tool error log write failed");
    }
}

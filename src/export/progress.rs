use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::types::{CompletePayload, ProgressPayload};

/// Per-job metrics with a per-table breakdown.
///
/// The table map is guarded by one reader/writer lock; the hot-path counters
/// (rows and bytes written) are atomics so pipelines never contend on the
/// lock while exporting. Rates derive from wall-clock time since `new` (or
/// the last `reset`).
pub struct JobMetrics {
    transport_id: String,
    job_id: String,
    started_at: Mutex<Instant>,
    tables: RwLock<HashMap<String, Arc<TableCounters>>>,
}

struct TableCounters {
    rows_total: AtomicI64,
    rows: AtomicU64,
    bytes: AtomicU64,
}

impl JobMetrics {
    pub fn new(transport_id: &str, job_id: &str) -> Self {
        Self {
            transport_id: transport_id.to_string(),
            job_id: job_id.to_string(),
            started_at: Mutex::new(Instant::now()),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Register a table. `total_rows` is -1 when unknown.
    pub fn add_table(&self, name: &str, total_rows: i64) {
        let mut tables = self.tables.write().unwrap();
        tables.insert(
            name.to_string(),
            Arc::new(TableCounters {
                rows_total: AtomicI64::new(total_rows),
                rows: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
            }),
        );
    }

    /// Record running totals for a table. Counters only move forward; a stale
    /// update (smaller running total) is a no-op.
    pub fn update_progress(&self, name: &str, rows: u64, bytes: u64) {
        let counters = {
            let tables = self.tables.read().unwrap();
            match tables.get(name) {
                Some(c) => c.clone(),
                None => return,
            }
        };
        counters.rows.fetch_max(rows, Ordering::Relaxed);
        counters.bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Snapshot a progress event for one table; `None` for unknown tables.
    pub fn progress_event(&self, name: &str) -> Option<ProgressPayload> {
        let counters = {
            let tables = self.tables.read().unwrap();
            tables.get(name)?.clone()
        };

        let rows = counters.rows.load(Ordering::Relaxed);
        let bytes = counters.bytes.load(Ordering::Relaxed);
        let rows_total = counters.rows_total.load(Ordering::Relaxed);

        let progress_percent = if rows_total > 0 {
            (rows as f64 / rows_total as f64) * 100.0
        } else {
            0.0
        };

        Some(ProgressPayload {
            transport_id: self.transport_id.clone(),
            job_id: self.job_id.clone(),
            table: name.to_string(),
            rows_processed: rows,
            rows_total,
            rows_per_second: self.rate(rows),
            bytes_written: bytes,
            progress_percent,
        })
    }

    /// Build the terminal event from the current per-table totals.
    pub fn complete_event(&self) -> CompletePayload {
        let (total_rows, total_bytes, tables_count) = {
            let tables = self.tables.read().unwrap();
            let mut rows = 0u64;
            let mut bytes = 0u64;
            for counters in tables.values() {
                rows += counters.rows.load(Ordering::Relaxed);
                bytes += counters.bytes.load(Ordering::Relaxed);
            }
            (rows, bytes, tables.len())
        };

        CompletePayload {
            transport_id: self.transport_id.clone(),
            job_id: self.job_id.clone(),
            total_rows,
            total_bytes,
            duration_ms: self.duration().as_millis() as u64,
            tables_count,
            rows_per_second: self.rate(total_rows),
        }
    }

    pub fn duration(&self) -> Duration {
        self.started_at.lock().unwrap().elapsed()
    }

    /// Clear all counters and restart the clock.
    pub fn reset(&self) {
        self.tables.write().unwrap().clear();
        *self.started_at.lock().unwrap() = Instant::now();
    }

    fn rate(&self, rows: u64) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            rows as f64 / secs
        } else {
            0.0
        }
    }
}

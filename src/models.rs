use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BufferConfig;

/// Core job data model for tableflow exports
///
/// An export job moves a set of whole tables from the relational source into
/// the object store, one gzip-compressed NDJSON object per table. The plan is
/// the immutable input to a run; per-table and aggregate outcomes are
/// reported back through `TableResult` / `ExecutionResult`.
///
/// Immutable description of one export run.
///
/// `transport_id` groups related runs and is the key observers subscribe on;
/// `job_id` identifies this particular run; `job_version` is baked into the
/// destination object key so repeated runs of the same transport land at
/// distinct prefixes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub transport_id: String,
    pub job_id: String,
    /// Short version label (e.g. "v001") used in the destination object key
    pub job_version: String,
    /// Tables to export, in request order
    pub tables: Vec<String>,
    /// Schema owner of the tables
    pub owner: String,
    /// Requested worker count; values ≤ 0 fall back to the default and the
    /// effective value is clamped by the executor
    pub concurrency: i32,
    /// Optional tuning bundle; defaults are substituted when absent
    pub buffer_config: Option<BufferConfig>,
}

impl ExecutionPlan {
    /// Destination key for one table of this run:
    /// `{transport_id}/{job_version}/{table}.jsonl.gz`
    pub fn object_key(&self, table: &str) -> String {
        format!("{}/{}/{}.jsonl.gz", self.transport_id, self.job_version, table)
    }
}

/// Why a table export failed, in the stable `{code, message}` vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableFailure {
    pub code: String,
    pub message: String,
}

/// Outcome of one table pipeline.
///
/// `byte_count` is the compressed byte count actually written to the object
/// store. `error` is `None` exactly when the table exported successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableResult {
    pub table_name: String,
    pub row_count: u64,
    pub byte_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub object_key: String,
    pub error: Option<TableFailure>,
}

impl TableResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Rows per second over the pipeline's wall-clock duration; 0 when the
    /// duration is 0.
    pub fn rows_per_second(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.row_count as f64 / (self.duration_ms as f64 / 1000.0)
    }
}

/// Aggregate outcome of an export run.
///
/// `total_rows` / `total_bytes` sum over successful tables only, and
/// `successful_tables + failed_tables == table_results.len()`. The order of
/// `table_results` follows completion, not request order; correlate by
/// `table_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub transport_id: String,
    pub job_id: String,
    pub job_version: String,
    pub table_results: Vec<TableResult>,
    pub total_rows: u64,
    pub total_bytes: u64,
    pub successful_tables: usize,
    pub failed_tables: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn new(transport_id: &str, job_id: &str, job_version: &str) -> Self {
        let now = Utc::now();
        Self {
            transport_id: transport_id.to_string(),
            job_id: job_id.to_string(),
            job_version: job_version.to_string(),
            table_results: Vec::new(),
            total_rows: 0,
            total_bytes: 0,
            successful_tables: 0,
            failed_tables: 0,
            start_time: now,
            end_time: now,
        }
    }

    /// Fold one table outcome into the aggregate. Only successful tables
    /// contribute to the row/byte totals.
    pub fn absorb(&mut self, result: TableResult) {
        if result.success() {
            self.total_rows += result.row_count;
            self.total_bytes += result.byte_count;
            self.successful_tables += 1;
        } else {
            self.failed_tables += 1;
        }
        self.table_results.push(result);
    }

    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }

    pub fn rows_per_second(&self) -> f64 {
        let ms = self.duration_ms();
        if ms == 0 {
            return 0.0;
        }
        self.total_rows as f64 / (ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_result(name: &str, rows: u64, bytes: u64, error: Option<TableFailure>) -> TableResult {
        let now = Utc::now();
        TableResult {
            table_name: name.to_string(),
            row_count: rows,
            byte_count: bytes,
            start_time: now,
            end_time: now,
            duration_ms: 0,
            object_key: format!("t/v001/{}.jsonl.gz", name),
            error,
        }
    }

    #[test]
    fn object_key_layout() {
        let plan = ExecutionPlan {
            transport_id: "acme".to_string(),
            job_id: "job-1".to_string(),
            job_version: "v003".to_string(),
            tables: vec!["ORDERS".to_string()],
            owner: "APP".to_string(),
            concurrency: 0,
            buffer_config: None,
        };
        assert_eq!(plan.object_key("ORDERS"), "acme/v003/ORDERS.jsonl.gz");
    }

    #[test]
    fn absorb_counts_only_successes_in_totals() {
        let mut agg = ExecutionResult::new("acme", "job-1", "v001");
        agg.absorb(table_result("A", 10, 100, None));
        agg.absorb(table_result(
            "B",
            3,
            30,
            Some(TableFailure {
                code: "SOURCE_STREAM_ERROR".to_string(),
                message: "boom".to_string(),
            }),
        ));
        agg.absorb(table_result("C", 5, 50, None));

        assert_eq!(agg.total_rows, 15);
        assert_eq!(agg.total_bytes, 150);
        assert_eq!(agg.successful_tables, 2);
        assert_eq!(agg.failed_tables, 1);
        assert_eq!(agg.table_results.len(), 3);
    }

    #[test]
    fn rows_per_second_zero_duration() {
        let result = table_result("A", 100, 0, None);
        assert_eq!(result.rows_per_second(), 0.0);
    }
}

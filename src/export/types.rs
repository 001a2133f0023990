use chrono::{DateTime, Utc};
use serde::Serialize;

/// Sampled progress for one table of one job. Progress events are advisory;
/// consumers reconcile against `status` and `complete`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressPayload {
    pub transport_id: String,
    pub job_id: String,
    pub table: String,
    pub rows_processed: u64,
    /// -1 when the total is unknown
    pub rows_total: i64,
    pub rows_per_second: f64,
    pub bytes_written: u64,
    /// 0 when `rows_total` ≤ 0
    pub progress_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// Per-table (or per-job) state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub transport_id: String,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub status: JobStatus,
    pub message: String,
}

/// A table-level failure, with the stable error code vocabulary.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub transport_id: String,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal event for a job; emitted exactly once, after every per-table
/// status/error event.
#[derive(Debug, Clone, Serialize)]
pub struct CompletePayload {
    pub transport_id: String,
    pub job_id: String,
    pub total_rows: u64,
    pub total_bytes: u64,
    pub duration_ms: u64,
    pub tables_count: usize,
    pub rows_per_second: f64,
}

/// Event pushed through the broadcaster to subscribed observers.
#[derive(Debug, Clone)]
pub enum ExportEvent {
    Progress(ProgressPayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    Complete(CompletePayload),
}

impl ExportEvent {
    /// Wire name of the event kind (used as the SSE event field).
    pub fn kind(&self) -> &'static str {
        match self {
            ExportEvent::Progress(_) => "progress",
            ExportEvent::Status(_) => "status",
            ExportEvent::Error(_) => "error",
            ExportEvent::Complete(_) => "complete",
        }
    }

    /// Transport the event belongs to; the broadcaster filters on this.
    pub fn transport_id(&self) -> &str {
        match self {
            ExportEvent::Progress(p) => &p.transport_id,
            ExportEvent::Status(p) => &p.transport_id,
            ExportEvent::Error(p) => &p.transport_id,
            ExportEvent::Complete(p) => &p.transport_id,
        }
    }

    /// JSON payload for the wire (the payload only, not the kind tag).
    pub fn data_json(&self) -> String {
        let result = match self {
            ExportEvent::Progress(p) => serde_json::to_string(p),
            ExportEvent::Status(p) => serde_json::to_string(p),
            ExportEvent::Error(p) => serde_json::to_string(p),
            ExportEvent::Complete(p) => serde_json::to_string(p),
        };
        // All payload fields are plain serializable data
        result.unwrap_or_else(|_| "{}".to_string())
    }
}

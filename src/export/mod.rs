// # Export Module
//
// The parallel extraction and streaming upload core:
//
// - **TablePipeline**: source chunks → NDJSON → gzip → object store, one table
// - **WorkerPool**: bounded-concurrency executor of table pipelines
// - **ParallelExecutor**: plans a job across tables and aggregates outcomes
// - **EventBroadcaster**: fans progress/status/error/complete events out to
//   subscribed observers, filtered by transport id
// - **JobMetrics**: per-job running totals with per-table breakdown

mod broadcaster;
mod compress;
mod encoder;
mod executor;
mod pipeline;
mod progress;
mod types;
mod worker_pool;

// Public API exports
pub use broadcaster::{EventBroadcaster, Subscriber, SUBSCRIBER_INBOX_CAPACITY};
pub use compress::{GzipLevel, GzipStage};
pub use encoder::{EncodeError, NdjsonEncoder};
pub use executor::{ExecuteError, ParallelExecutor};
pub use pipeline::{PipelineError, TablePipeline, PROGRESS_INTERVAL};
pub use progress::JobMetrics;
pub use types::{
    CompletePayload, ErrorPayload, ExportEvent, JobStatus, ProgressPayload, StatusPayload,
};
pub use worker_pool::{TableTask, TaskOutcome, WorkerPool};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BufferConfig;
use crate::error::codes;
use crate::models::{ExecutionPlan, TableFailure, TableResult};
use crate::source::{RowSource, SourceError, StreamOptions};
use crate::storage::{ObjectStore, ObjectWriter, StorageError};

use super::broadcaster::EventBroadcaster;
use super::compress::{GzipLevel, GzipStage};
use super::encoder::{EncodeError, NdjsonEncoder};
use super::progress::JobMetrics;

/// Minimum time between progress samples for one table.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("gzip error: {0}")]
    Compress(#[from] std::io::Error),
    #[error(transparent)]
    Upload(#[from] StorageError),
    #[error("table export cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Source(e) => e.code(),
            PipelineError::Encode(_) => codes::ENCODE_ERROR,
            PipelineError::Compress(_) => codes::COMPRESS_ERROR,
            PipelineError::Upload(e) => e.code(),
            PipelineError::Cancelled => codes::CANCELLED,
        }
    }
}

/// Streams one table end to end: source chunks → NDJSON → gzip → object store.
///
/// A pipeline owns its stage chain for the duration of `run` and releases it
/// on every exit path; a failed table never affects its siblings. Retries do
/// not happen here; a decorator above this layer owns that policy.
pub struct TablePipeline {
    source: Arc<dyn RowSource>,
    store: Arc<dyn ObjectStore>,
    broadcaster: EventBroadcaster,
    metrics: Arc<JobMetrics>,
    buffers: BufferConfig,
    gzip_level: GzipLevel,
}

impl TablePipeline {
    pub fn new(
        source: Arc<dyn RowSource>,
        store: Arc<dyn ObjectStore>,
        broadcaster: EventBroadcaster,
        metrics: Arc<JobMetrics>,
        buffers: BufferConfig,
        gzip_level: GzipLevel,
    ) -> Self {
        Self {
            source,
            store,
            broadcaster,
            metrics,
            buffers,
            gzip_level,
        }
    }

    /// Export one table and report the outcome. Never panics and never
    /// returns early without tearing the writer down.
    pub async fn run(
        &self,
        ctx: CancellationToken,
        plan: &ExecutionPlan,
        table: &str,
    ) -> TableResult {
        let object_key = plan.object_key(table);
        let start_time = Utc::now();
        let started = Instant::now();

        debug!(table, key = %object_key, "table pipeline starting");
        let outcome = self.export_table(&ctx, plan, table, &object_key).await;

        let end_time = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((row_count, byte_count)) => {
                info!(
                    table,
                    rows = row_count,
                    bytes = byte_count,
                    duration_ms,
                    "table exported"
                );
                TableResult {
                    table_name: table.to_string(),
                    row_count,
                    byte_count,
                    start_time,
                    end_time,
                    duration_ms,
                    object_key,
                    error: None,
                }
            }
            Err(e) => {
                warn!(table, code = e.code(), error = %e, duration_ms, "table export failed");
                TableResult {
                    table_name: table.to_string(),
                    row_count: 0,
                    byte_count: 0,
                    start_time,
                    end_time,
                    duration_ms,
                    object_key,
                    error: Some(TableFailure {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    async fn export_table(
        &self,
        ctx: &CancellationToken,
        plan: &ExecutionPlan,
        table: &str,
        object_key: &str,
    ) -> Result<(u64, u64), PipelineError> {
        let mut writer = self.store.new_writer(object_key).await?;

        match self.stream_into(ctx, plan, table, writer.as_mut()).await {
            Ok(counts) => Ok(counts),
            Err(e) => {
                // Best-effort teardown: the original error is the one worth
                // reporting, not a secondary abort failure.
                if let Err(abort_err) = writer.abort().await {
                    debug!(table, error = %abort_err, "writer abort after failure also failed");
                }
                Err(e)
            }
        }
    }

    async fn stream_into(
        &self,
        ctx: &CancellationToken,
        plan: &ExecutionPlan,
        table: &str,
        writer: &mut dyn ObjectWriter,
    ) -> Result<(u64, u64), PipelineError> {
        let mut encoder = NdjsonEncoder::new(self.buffers.jsonl_buffer_size);
        let mut gzip = GzipStage::new(self.gzip_level, self.buffers.gzip_buffer_size);

        let options = StreamOptions {
            chunk_size: self.buffers.chunk_size,
            fetch_array_size: self.buffers.fetch_array_size,
        };
        let mut chunks = self
            .source
            .stream(ctx.clone(), &plan.owner, table, options)
            .await?;

        let mut rows_written: u64 = 0;
        let mut last_sample = Instant::now();

        while let Some(next) = chunks.recv().await {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let chunk = next?;

            for row in &chunk.rows {
                if ctx.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }

                encoder.encode(row)?;
                rows_written += 1;

                if encoder.is_full() {
                    gzip.write(&encoder.take_buffer())?;
                }
                if let Some(ready) = gzip.take_ready() {
                    if ctx.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    writer.write(&ready).await?;
                    if ctx.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                }

                if last_sample.elapsed() >= PROGRESS_INTERVAL {
                    self.metrics
                        .update_progress(table, rows_written, gzip.bytes_out());
                    if let Some(event) = self.metrics.progress_event(table) {
                        self.broadcaster.broadcast_progress(event);
                    }
                    last_sample = Instant::now();
                }
            }

            if chunk.is_last_chunk {
                break;
            }
        }

        // Flush the remaining NDJSON through gzip, then seal the gzip frame.
        gzip.write(&encoder.take_buffer())?;
        let (tail, _bytes_in, bytes_out) = gzip.finish()?;

        if ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        writer.write(&tail).await?;
        writer.finish().await?;

        self.metrics.update_progress(table, rows_written, bytes_out);

        Ok((rows_written, bytes_out))
    }
}

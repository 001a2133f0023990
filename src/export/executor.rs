use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BufferConfig, DEFAULT_PARALLELISM, MAX_PARALLELISM};
use crate::error::codes;
use crate::models::{ExecutionPlan, ExecutionResult};
use crate::source::RowSource;
use crate::storage::ObjectStore;

use super::broadcaster::EventBroadcaster;
use super::compress::GzipLevel;
use super::pipeline::TablePipeline;
use super::progress::JobMetrics;
use super::types::{CompletePayload, ErrorPayload, JobStatus, StatusPayload};
use super::worker_pool::{TableTask, WorkerPool};

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("invalid execution plan: {0}")]
    InvalidPlan(String),
    /// The job's context was cancelled mid-flight. The partial aggregate is
    /// attached for inspection.
    #[error("export cancelled")]
    Cancelled { result: Box<ExecutionResult> },
    /// One or more tables failed; the full aggregate (including the failures)
    /// is attached for inspection.
    #[error("{failed} of {total} tables failed")]
    TablesFailed {
        failed: usize,
        total: usize,
        result: Box<ExecutionResult>,
    },
    #[error("executor error: {0}")]
    Internal(String),
}

impl ExecuteError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecuteError::InvalidPlan(_) => codes::VALIDATION_ERROR,
            ExecuteError::Cancelled { .. } => codes::CANCELLED,
            ExecuteError::TablesFailed { .. } => codes::EXPORT_FAILED,
            ExecuteError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }
}

/// Plans and orchestrates one export job across tables.
///
/// Each requested table becomes one pipeline task in a worker pool sized by
/// the plan's clamped concurrency. Table failures are isolated; the executor
/// aggregates every outcome, publishes per-table status/error events while
/// results arrive, and publishes the job's `complete` event after the last
/// pipeline has reported.
pub struct ParallelExecutor {
    source: Arc<dyn RowSource>,
    store: Arc<dyn ObjectStore>,
    broadcaster: EventBroadcaster,
    /// Process-wide cap on workers per job
    pool_cap: usize,
    default_buffers: BufferConfig,
    gzip_level: GzipLevel,
}

impl ParallelExecutor {
    pub fn new(
        source: Arc<dyn RowSource>,
        store: Arc<dyn ObjectStore>,
        broadcaster: EventBroadcaster,
        pool_cap: usize,
        default_buffers: BufferConfig,
    ) -> Self {
        Self {
            source,
            store,
            broadcaster,
            pool_cap: pool_cap.max(1),
            default_buffers,
            gzip_level: GzipLevel::default(),
        }
    }

    pub fn with_gzip_level(mut self, level: GzipLevel) -> Self {
        self.gzip_level = level;
        self
    }

    /// Worker count actually used for a requested concurrency: requests ≤ 0
    /// fall back to the default, and the result is clamped by both the global
    /// maximum and this executor's own cap.
    pub fn effective_concurrency(&self, requested: i32) -> usize {
        let cap = self.pool_cap.min(MAX_PARALLELISM).max(1);
        let requested = if requested <= 0 {
            DEFAULT_PARALLELISM
        } else {
            requested as usize
        };
        requested.clamp(1, cap)
    }

    /// Run the plan to completion (or cancellation) and return the aggregate.
    pub async fn execute(
        &self,
        ctx: CancellationToken,
        plan: ExecutionPlan,
    ) -> Result<ExecutionResult, ExecuteError> {
        if plan.transport_id.trim().is_empty() {
            return Err(ExecuteError::InvalidPlan(
                "transport_id must not be empty".to_string(),
            ));
        }
        if plan.tables.is_empty() {
            return Err(ExecuteError::InvalidPlan(
                "tables must not be empty".to_string(),
            ));
        }

        let buffers = plan
            .buffer_config
            .unwrap_or(self.default_buffers)
            .clamped();
        let workers = self.effective_concurrency(plan.concurrency);

        info!(
            transport_id = %plan.transport_id,
            job_id = %plan.job_id,
            tables = plan.tables.len(),
            workers,
            "export job starting"
        );

        let metrics = Arc::new(JobMetrics::new(&plan.transport_id, &plan.job_id));
        for table in &plan.tables {
            metrics.add_table(table, -1);
        }

        let mut pool = WorkerPool::new(workers);
        pool.start(ctx.clone());

        let mut aggregate =
            ExecutionResult::new(&plan.transport_id, &plan.job_id, &plan.job_version);
        aggregate.start_time = Utc::now();

        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let plan = Arc::new(plan);

        for (idx, table) in plan.tables.iter().enumerate() {
            let pipeline = TablePipeline::new(
                self.source.clone(),
                self.store.clone(),
                self.broadcaster.clone(),
                metrics.clone(),
                buffers,
                self.gzip_level,
            );
            let ctx = ctx.clone();
            let plan = plan.clone();
            let table_name = table.clone();
            let results_tx = results_tx.clone();

            let submitted = pool.submit(TableTask {
                id: idx as u64 + 1,
                table: table.clone(),
                work: Box::pin(async move {
                    let result = pipeline.run(ctx, &plan, &table_name).await;
                    let error = result.error.as_ref().map(|f| f.message.clone());
                    let _ = results_tx.send(result);
                    match error {
                        Some(message) => Err(message),
                        None => Ok(()),
                    }
                }),
            });
            if let Err(e) = submitted {
                return Err(ExecuteError::Internal(e));
            }
        }
        // The pool tasks hold the remaining senders; the channel closes once
        // the last pipeline has reported.
        drop(results_tx);

        let drain = tokio::spawn(async move { pool.wait().await });

        while let Some(result) = results_rx.recv().await {
            match &result.error {
                None => self.broadcaster.broadcast_status(StatusPayload {
                    transport_id: plan.transport_id.clone(),
                    job_id: plan.job_id.clone(),
                    table: Some(result.table_name.clone()),
                    status: JobStatus::Completed,
                    message: format!("table {} completed", result.table_name),
                }),
                Some(failure) => self.broadcaster.broadcast_error(ErrorPayload {
                    transport_id: plan.transport_id.clone(),
                    job_id: plan.job_id.clone(),
                    table: Some(result.table_name.clone()),
                    code: failure.code.clone(),
                    message: failure.message.clone(),
                    timestamp: Utc::now(),
                }),
            }
            aggregate.absorb(result);
        }

        let outcomes = drain
            .await
            .map_err(|e| ExecuteError::Internal(format!("pool drain failed: {}", e)))?;
        debug!(tasks = outcomes.len(), "worker pool drained");

        aggregate.end_time = Utc::now();

        self.broadcaster.broadcast_complete(CompletePayload {
            transport_id: plan.transport_id.clone(),
            job_id: plan.job_id.clone(),
            total_rows: aggregate.total_rows,
            total_bytes: aggregate.total_bytes,
            duration_ms: aggregate.duration_ms(),
            tables_count: aggregate.table_results.len(),
            rows_per_second: aggregate.rows_per_second(),
        });

        if ctx.is_cancelled() {
            warn!(job_id = %plan.job_id, "export cancelled mid-flight");
            return Err(ExecuteError::Cancelled {
                result: Box::new(aggregate),
            });
        }
        if aggregate.failed_tables > 0 {
            warn!(
                job_id = %plan.job_id,
                failed = aggregate.failed_tables,
                "export finished with table failures"
            );
            let failed = aggregate.failed_tables;
            let total = aggregate.table_results.len();
            return Err(ExecuteError::TablesFailed {
                failed,
                total,
                result: Box::new(aggregate),
            });
        }

        info!(
            job_id = %plan.job_id,
            rows = aggregate.total_rows,
            bytes = aggregate.total_bytes,
            duration_ms = aggregate.duration_ms(),
            "export job completed"
        );
        Ok(aggregate)
    }
}

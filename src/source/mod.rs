// # Row Source
//
// The relational side of an export. A source streams whole tables as ordered
// chunks of JSON-ready rows and exposes light introspection for the API
// surface. The production implementation is Postgres; tests use the
// in-memory double from `test_support`.

mod postgres;

pub use postgres::PostgresRowSource;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::codes;

/// One decoded row: column name → JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Capacity of the chunk channel between a source producer and the consuming
/// pipeline; this bound is what gives the extract side backpressure.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 4;

/// Tuning for one `stream` call.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Upper bound on rows per emitted chunk
    pub chunk_size: usize,
    /// Rows fetched from the source per round-trip
    pub fetch_array_size: usize,
}

/// A bounded batch of rows pulled from the source.
///
/// For a given table, chunks arrive with strictly increasing 1-based
/// `chunk_number`; exactly one chunk has `is_last_chunk = true` and it is the
/// final one. An empty table yields a single chunk with `row_count = 0` and
/// `is_last_chunk = true`.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub table_name: String,
    pub chunk_number: u64,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub is_last_chunk: bool,
    /// Running row total for this table, including this chunk
    pub total_rows_sent: u64,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source connection error: {0}")]
    Connection(String),
    #[error("source stream error: {0}")]
    Stream(String),
    #[error("stream cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::Connection(_) => codes::SOURCE_CONNECTION_ERROR,
            SourceError::Stream(_) => codes::SOURCE_STREAM_ERROR,
            SourceError::Cancelled => codes::CANCELLED,
        }
    }
}

/// Point-in-time source health.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub connected: bool,
    pub message: String,
}

/// Column metadata from introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A streaming row source.
///
/// `stream` hands back the receiving end of a bounded chunk channel fed by a
/// producer task. Chunks for one call arrive in order; dropping the receiver
/// stops the producer. Only `stream` is on the hot path; the introspection
/// methods back the HTTP surface.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Start streaming `owner.table` and return the chunk channel.
    ///
    /// The producer checks `ctx` between fetch batches and between rows and
    /// emits `SourceError::Cancelled` into the channel when it trips.
    async fn stream(
        &self,
        ctx: CancellationToken,
        owner: &str,
        table: &str,
        options: StreamOptions,
    ) -> Result<mpsc::Receiver<Result<ChunkResult, SourceError>>, SourceError>;

    async fn get_status(&self) -> SourceStatus;

    async fn get_tables(&self, owner: &str) -> Result<Vec<String>, SourceError>;

    async fn get_table_columns(
        &self,
        owner: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, SourceError>;

    async fn get_sample_data(
        &self,
        owner: &str,
        table: &str,
        limit: i64,
    ) -> Result<Vec<Row>, SourceError>;

    async fn ping(&self) -> Result<(), SourceError>;

    async fn close(&self);
}

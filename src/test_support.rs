// Test support utilities for both unit and integration tests
//
// In-memory doubles for the two external collaborators: the relational
// source and the object store. Everything here runs without external
// services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::source::{
    ChunkResult, ColumnInfo, Row, RowSource, SourceError, SourceStatus, StreamOptions,
    CHUNK_CHANNEL_CAPACITY,
};
use crate::storage::{ObjectStore, ObjectWriter, StorageError};

/// Build `count` sample rows shaped like `{"id": n, "name": "row-n"}`.
pub fn sample_rows(count: usize) -> Vec<Row> {
    (1..=count)
        .map(|i| {
            let mut row = Row::new();
            row.insert("id".to_string(), json!(i));
            row.insert("name".to_string(), json!(format!("row-{}", i)));
            row
        })
        .collect()
}

/// Build one chunk with explicit numbering and running total.
pub fn chunk(
    table: &str,
    chunk_number: u64,
    rows: Vec<Row>,
    is_last_chunk: bool,
    total_rows_sent: u64,
) -> ChunkResult {
    let row_count = rows.len();
    ChunkResult {
        table_name: table.to_string(),
        chunk_number,
        rows,
        row_count,
        is_last_chunk,
        total_rows_sent,
    }
}

/// A whole table as a single final chunk of `rows` sample rows.
pub fn single_chunk_table(table: &str, rows: usize) -> Vec<ChunkResult> {
    let data = sample_rows(rows);
    let total = data.len() as u64;
    vec![chunk(table, 1, data, true, total)]
}

enum TableFixture {
    Chunks(Vec<ChunkResult>),
    Fails(String),
}

/// Mock row source serving pre-built chunk sequences from memory.
///
/// Tracks how many streams run concurrently (and the maximum ever observed)
/// so tests can assert the worker-pool bound.
pub struct MockRowSource {
    tables: HashMap<String, TableFixture>,
    chunk_delay: Option<Duration>,
    active_streams: Arc<AtomicUsize>,
    max_active_streams: Arc<AtomicUsize>,
}

impl Default for MockRowSource {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            chunk_delay: None,
            active_streams: Arc::new(AtomicUsize::new(0)),
            max_active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, chunks: Vec<ChunkResult>) -> Self {
        self.tables
            .insert(table.to_string(), TableFixture::Chunks(chunks));
        self
    }

    pub fn with_failing_table(mut self, table: &str, message: &str) -> Self {
        self.tables
            .insert(table.to_string(), TableFixture::Fails(message.to_string()));
        self
    }

    /// Sleep this long before every chunk, to keep streams in flight long
    /// enough for concurrency observations.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Highest number of concurrently active streams observed so far.
    pub fn max_active_streams(&self) -> usize {
        self.max_active_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RowSource for MockRowSource {
    async fn stream(
        &self,
        ctx: CancellationToken,
        _owner: &str,
        table: &str,
        _options: StreamOptions,
    ) -> Result<mpsc::Receiver<Result<ChunkResult, SourceError>>, SourceError> {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let fixture = match self.tables.get(table) {
            Some(TableFixture::Chunks(chunks)) => Ok(chunks.clone()),
            Some(TableFixture::Fails(message)) => Err(message.clone()),
            None => {
                return Err(SourceError::Stream(format!("unknown table: {}", table)));
            }
        };

        let delay = self.chunk_delay;
        let active = self.active_streams.clone();
        let max_active = self.max_active_streams.clone();

        tokio::spawn(async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);

            match fixture {
                Err(message) => {
                    let _ = tx.send(Err(SourceError::Stream(message))).await;
                }
                Ok(chunks) => {
                    for chunk in chunks {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        if ctx.is_cancelled() {
                            let _ = tx.send(Err(SourceError::Cancelled)).await;
                            break;
                        }
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            active.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(rx)
    }

    async fn get_status(&self) -> SourceStatus {
        SourceStatus {
            connected: true,
            message: "mock".to_string(),
        }
    }

    async fn get_tables(&self, _owner: &str) -> Result<Vec<String>, SourceError> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get_table_columns(
        &self,
        _owner: &str,
        _table: &str,
    ) -> Result<Vec<ColumnInfo>, SourceError> {
        Ok(vec![
            ColumnInfo {
                name: "id".to_string(),
                data_type: "integer".to_string(),
                nullable: false,
            },
            ColumnInfo {
                name: "name".to_string(),
                data_type: "text".to_string(),
                nullable: true,
            },
        ])
    }

    async fn get_sample_data(
        &self,
        _owner: &str,
        table: &str,
        limit: i64,
    ) -> Result<Vec<Row>, SourceError> {
        match self.tables.get(table) {
            Some(TableFixture::Chunks(chunks)) => Ok(chunks
                .iter()
                .flat_map(|c| c.rows.iter().cloned())
                .take(limit.max(0) as usize)
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn close(&self) {}
}

/// In-memory object store: finished objects land in a shared map, aborted
/// writes leave the key untouched.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_finish_for: Option<String>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `finish` fail for any key containing `fragment`, to exercise the
    /// upload-failure path.
    pub fn failing_finish_for(fragment: &str) -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            fail_finish_for: Some(fragment.to_string()),
        }
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn new_writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        Ok(Box::new(MemoryObjectWriter {
            key: key.to_string(),
            buf: Vec::new(),
            objects: self.objects.clone(),
            fail_finish: self
                .fail_finish_for
                .as_ref()
                .is_some_and(|fragment| key.contains(fragment)),
            finished: false,
        }))
    }
}

struct MemoryObjectWriter {
    key: String,
    buf: Vec<u8>,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_finish: bool,
    finished: bool,
}

#[async_trait]
impl ObjectWriter for MemoryObjectWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64, StorageError> {
        if self.fail_finish {
            return Err(StorageError::Upload(format!(
                "simulated finish failure for {}",
                self.key
            )));
        }
        let data = std::mem::take(&mut self.buf);
        let len = data.len() as u64;
        self.objects.lock().unwrap().insert(self.key.clone(), data);
        self.finished = true;
        Ok(len)
    }

    async fn abort(&mut self) -> Result<(), StorageError> {
        self.buf.clear();
        Ok(())
    }
}

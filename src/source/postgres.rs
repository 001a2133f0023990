use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as SqlxRow, TypeInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ChunkResult, ColumnInfo, Row, RowSource, SourceError, SourceStatus, StreamOptions,
    CHUNK_CHANNEL_CAPACITY,
};

/// Production row source backed by PostgreSQL.
///
/// Streaming uses a server-side cursor (`DECLARE` / `FETCH n`) inside a
/// read-only transaction, so the fetch batch size maps directly onto the
/// wire round-trip and rows never accumulate beyond one batch plus one
/// pending chunk.
pub struct PostgresRowSource {
    pool: PgPool,
}

impl PostgresRowSource {
    pub async fn connect(database_url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowSource for PostgresRowSource {
    async fn stream(
        &self,
        ctx: CancellationToken,
        owner: &str,
        table: &str,
        options: StreamOptions,
    ) -> Result<mpsc::Receiver<Result<ChunkResult, SourceError>>, SourceError> {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        let pool = self.pool.clone();
        let owner = owner.to_string();
        let table = table.to_string();
        tokio::spawn(stream_table_chunks(pool, ctx, owner, table, options, chunk_tx));

        Ok(chunk_rx)
    }

    async fn get_status(&self) -> SourceStatus {
        match self.ping().await {
            Ok(()) => SourceStatus {
                connected: true,
                message: "connected".to_string(),
            },
            Err(e) => SourceStatus {
                connected: false,
                message: e.to_string(),
            },
        }
    }

    async fn get_tables(&self, owner: &str) -> Result<Vec<String>, SourceError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SourceError::Stream(e.to_string()))?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn get_table_columns(
        &self,
        owner: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, SourceError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(owner)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SourceError::Stream(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable)| ColumnInfo {
                name,
                data_type,
                nullable: is_nullable == "YES",
            })
            .collect())
    }

    async fn get_sample_data(
        &self,
        owner: &str,
        table: &str,
        limit: i64,
    ) -> Result<Vec<Row>, SourceError> {
        let sql = format!(
            "SELECT * FROM {}.{} LIMIT $1",
            quote_ident(owner),
            quote_ident(table)
        );
        let rows = sqlx::query(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SourceError::Stream(e.to_string()))?;

        rows.iter().map(row_to_json).collect()
    }

    async fn ping(&self) -> Result<(), SourceError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| SourceError::Connection(e.to_string()))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Producer task: walk the table with a server-side cursor and emit chunks.
///
/// Chunks are held back by one step so that only the final chunk carries
/// `is_last_chunk = true`, including the single empty chunk
/// an empty table produces.
async fn stream_table_chunks(
    pool: PgPool,
    ctx: CancellationToken,
    owner: String,
    table: String,
    options: StreamOptions,
    chunk_tx: mpsc::Sender<Result<ChunkResult, SourceError>>,
) {
    let mut txn = match pool.begin().await {
        Ok(txn) => txn,
        Err(e) => {
            let _ = chunk_tx
                .send(Err(SourceError::Connection(e.to_string())))
                .await;
            return;
        }
    };

    let declare = format!(
        "DECLARE tableflow_cursor NO SCROLL CURSOR FOR SELECT * FROM {}.{}",
        quote_ident(&owner),
        quote_ident(&table)
    );
    if let Err(e) = sqlx::query(&declare).execute(&mut *txn).await {
        let _ = chunk_tx.send(Err(SourceError::Stream(e.to_string()))).await;
        return;
    }

    let fetch = format!("FETCH {} FROM tableflow_cursor", options.fetch_array_size.max(1));

    let mut chunk_number: u64 = 0;
    let mut total_rows_sent: u64 = 0;
    let mut pending_rows: Vec<Row> = Vec::with_capacity(options.chunk_size);
    // One finished chunk waiting until we know whether more data follows.
    let mut ready: Option<ChunkResult> = None;

    loop {
        if ctx.is_cancelled() {
            let _ = chunk_tx.send(Err(SourceError::Cancelled)).await;
            return;
        }

        let batch = match sqlx::query(&fetch).fetch_all(&mut *txn).await {
            Ok(batch) => batch,
            Err(e) => {
                let _ = chunk_tx.send(Err(SourceError::Stream(e.to_string()))).await;
                return;
            }
        };
        let exhausted = batch.len() < options.fetch_array_size.max(1);

        for pg_row in &batch {
            if ctx.is_cancelled() {
                let _ = chunk_tx.send(Err(SourceError::Cancelled)).await;
                return;
            }

            match row_to_json(pg_row) {
                Ok(row) => pending_rows.push(row),
                Err(e) => {
                    let _ = chunk_tx.send(Err(e)).await;
                    return;
                }
            }

            if pending_rows.len() >= options.chunk_size {
                let rows = std::mem::replace(
                    &mut pending_rows,
                    Vec::with_capacity(options.chunk_size),
                );
                chunk_number += 1;
                total_rows_sent += rows.len() as u64;
                let chunk = make_chunk(&table, chunk_number, rows, false, total_rows_sent);
                if let Some(prev) = ready.replace(chunk) {
                    if chunk_tx.send(Ok(prev)).await.is_err() {
                        // Receiver dropped, stop streaming
                        return;
                    }
                }
            }
        }

        if exhausted {
            break;
        }
    }

    // Final flush: whatever is pending becomes the last chunk. When the table
    // size is an exact multiple of the chunk size, the held-back chunk is
    // promoted instead; an empty table yields one empty last chunk.
    let last = if !pending_rows.is_empty() || ready.is_none() {
        if let Some(prev) = ready.take() {
            if chunk_tx.send(Ok(prev)).await.is_err() {
                return;
            }
        }
        chunk_number += 1;
        total_rows_sent += pending_rows.len() as u64;
        make_chunk(&table, chunk_number, pending_rows, true, total_rows_sent)
    } else {
        let mut chunk = ready.take().expect("ready chunk present");
        chunk.is_last_chunk = true;
        chunk
    };
    if chunk_tx.send(Ok(last)).await.is_err() {
        return;
    }

    debug!(table = %table, rows = total_rows_sent, chunks = chunk_number, "table stream finished");

    if let Err(e) = sqlx::query("CLOSE tableflow_cursor").execute(&mut *txn).await {
        warn!(table = %table, error = %e, "failed to close export cursor");
    }
    let _ = txn.commit().await;
}

fn make_chunk(
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

/// Quote a SQL identifier, doubling embedded quotes.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Decode one Postgres row into a JSON object keyed by column name.
///
/// Scalar normalization: integers and floats stay numeric, NUMERIC becomes a
/// decimal string (precision-preserving), timestamps render as RFC3339 UTC,
/// BYTEA as lowercase hex, json/jsonb pass through, NULL is a JSON null.
fn row_to_json(row: &PgRow) -> Result<Row, SourceError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_info().name())
            .map_err(|e| SourceError::Stream(format!("column {}: {}", column.name(), e)))?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(|v| Value::from(v as f64)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::from),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::from),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|v| Value::String(hex::encode(v))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(idx)?.map(|v| {
            Value::String(DateTime::<Utc>::from_naive_utc_and_offset(v, Utc).to_rfc3339())
        }),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx)?,
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx)?.map(Value::String)
        }
        other => {
            // Unknown type: fall back to a textual rendering when the driver
            // can give us one, otherwise null.
            match row.try_get::<Option<String>, _>(idx) {
                Ok(v) => v.map(Value::String),
                Err(_) => {
                    debug!(pg_type = other, "no decoder for column type, emitting null");
                    None
                }
            }
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}

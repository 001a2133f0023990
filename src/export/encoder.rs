use thiserror::Error;

use crate::source::Row;

#[derive(Error, Debug)]
#[error("row encode error: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// NDJSON encoder: one JSON object per row, LF-terminated.
///
/// Rows accumulate in an internal buffer until the caller drains it with
/// `take_buffer` (typically when `is_full` reports the configured buffer size
/// has been reached). Counts both rows and uncompressed bytes produced.
pub struct NdjsonEncoder {
    buf: Vec<u8>,
    buffer_size: usize,
    rows_encoded: u64,
    bytes_written: u64,
}

impl NdjsonEncoder {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(buffer_size),
            buffer_size,
            rows_encoded: 0,
            bytes_written: 0,
        }
    }

    /// Append one row as a JSON line.
    pub fn encode(&mut self, row: &Row) -> Result<(), EncodeError> {
        let before = self.buf.len();
        serde_json::to_writer(&mut self.buf, row)?;
        self.buf.push(b'\n');
        self.rows_encoded += 1;
        self.bytes_written += (self.buf.len() - before) as u64;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.buffer_size
    }

    /// Drain the internal buffer, leaving a fresh one behind.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.buf, Vec::with_capacity(self.buffer_size))
    }

    pub fn rows_encoded(&self) -> u64 {
        self.rows_encoded
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

/// Gzip compression level. `Balanced` is the default; the extremes exist for
/// benchmarking CPU-vs-size trade-offs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GzipLevel {
    Fast,
    Balanced,
    Best,
}

impl GzipLevel {
    fn compression(self) -> Compression {
        match self {
            GzipLevel::Fast => Compression::new(1),
            GzipLevel::Balanced => Compression::new(6),
            GzipLevel::Best => Compression::new(9),
        }
    }
}

impl Default for GzipLevel {
    fn default() -> Self {
        GzipLevel::Balanced
    }
}

/// Gzip stage of the table pipeline (RFC 1952 framing via flate2).
///
/// Compressed output accumulates in an internal buffer; `take_ready` hands
/// back a full buffer once it crosses the configured threshold so the caller
/// controls when the downstream writer is hit. `finish` writes the gzip
/// trailer; an upload whose stage was never finished is not a valid object.
pub struct GzipStage {
    encoder: GzEncoder<Vec<u8>>,
    flush_threshold: usize,
    bytes_in: u64,
    bytes_out: u64,
}

impl GzipStage {
    pub fn new(level: GzipLevel, flush_threshold: usize) -> Self {
        Self {
            encoder: GzEncoder::new(
                Vec::with_capacity(flush_threshold),
                level.compression(),
            ),
            flush_threshold,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.encoder.write_all(data)?;
        self.bytes_in += data.len() as u64;
        Ok(())
    }

    /// Take the accumulated compressed bytes if they have reached the flush
    /// threshold. Returns `None` while the buffer is still filling.
    pub fn take_ready(&mut self) -> Option<Vec<u8>> {
        if self.encoder.get_ref().len() < self.flush_threshold {
            return None;
        }
        let out = std::mem::take(self.encoder.get_mut());
        self.bytes_out += out.len() as u64;
        Some(out)
    }

    /// Write the gzip trailer and return `(tail, bytes_in, bytes_out)`.
    /// `tail` is whatever compressed output had not been drained yet.
    pub fn finish(mut self) -> std::io::Result<(Vec<u8>, u64, u64)> {
        let tail = self.encoder.finish()?;
        self.bytes_out += tail.len() as u64;
        Ok((tail, self.bytes_in, self.bytes_out))
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn roundtrip_preserves_bytes_and_counts() {
        let payload = b"{\"id\":1}\n{\"id\":2}\n".repeat(100);

        let mut stage = GzipStage::new(GzipLevel::Balanced, 64);
        stage.write(&payload).unwrap();
        let mut compressed = Vec::new();
        while let Some(ready) = stage.take_ready() {
            compressed.extend_from_slice(&ready);
        }
        let (tail, bytes_in, bytes_out) = stage.finish().unwrap();
        compressed.extend_from_slice(&tail);

        assert_eq!(bytes_in, payload.len() as u64);
        assert_eq!(bytes_out, compressed.len() as u64);

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn empty_input_still_produces_valid_gzip() {
        let stage = GzipStage::new(GzipLevel::Balanced, 1024);
        let (tail, bytes_in, _) = stage.finish().unwrap();
        assert_eq!(bytes_in, 0);

        let mut decoder = GzDecoder::new(tail.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert!(decompressed.is_empty());
    }

    #[test]
    fn take_ready_respects_threshold() {
        let mut stage = GzipStage::new(GzipLevel::Fast, 1024 * 1024);
        stage.write(b"tiny").unwrap();
        // Nothing drained below the threshold.
        assert!(stage.take_ready().is_none());
    }
}

use serde::{Deserialize, Serialize};

use crate::storage::S3Config;

/// Executor-wide defaults. The effective worker count for a job is clamped
/// into `[1, MAX_PARALLELISM]`, further capped by the executor's own pool cap.
pub const DEFAULT_PARALLELISM: usize = 4;
pub const MAX_PARALLELISM: usize = 16;

/// S3 multipart uploads reject parts below 5 MiB (except the last one), so
/// the configured part size is clamped to this floor.
pub const MIN_UPLOAD_PART_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_FETCH_ARRAY_SIZE: usize = 1000;
const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_JSONL_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_GZIP_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_UPLOAD_PART_SIZE: usize = 16 * 1024 * 1024;

/// Per-job buffer tuning.
///
/// - `fetch_array_size`: batch size pulled from the source per round-trip
/// - `chunk_size`: upper bound on rows per in-memory chunk
/// - `jsonl_buffer_size`: encoder write buffer, bytes
/// - `gzip_buffer_size`: compressed-output buffer drained to the writer, bytes
/// - `upload_part_size`: multipart upload part size, bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub fetch_array_size: usize,
    pub chunk_size: usize,
    pub jsonl_buffer_size: usize,
    pub gzip_buffer_size: usize,
    pub upload_part_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            fetch_array_size: DEFAULT_FETCH_ARRAY_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            jsonl_buffer_size: DEFAULT_JSONL_BUFFER_SIZE,
            gzip_buffer_size: DEFAULT_GZIP_BUFFER_SIZE,
            upload_part_size: DEFAULT_UPLOAD_PART_SIZE,
        }
    }
}

impl BufferConfig {
    /// Larger batches and buffers; trades memory for throughput.
    pub fn high_performance() -> Self {
        Self {
            fetch_array_size: 5000,
            chunk_size: 5000,
            jsonl_buffer_size: 256 * 1024,
            gzip_buffer_size: 256 * 1024,
            upload_part_size: 64 * 1024 * 1024,
        }
    }

    /// Small batches and buffers for constrained environments.
    pub fn low_memory() -> Self {
        Self {
            fetch_array_size: 200,
            chunk_size: 200,
            jsonl_buffer_size: 16 * 1024,
            gzip_buffer_size: 16 * 1024,
            upload_part_size: MIN_UPLOAD_PART_SIZE,
        }
    }

    /// Look up a named profile: "default", "high-performance" or "low-memory".
    pub fn profile(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "high-performance" => Some(Self::high_performance()),
            "low-memory" => Some(Self::low_memory()),
            _ => None,
        }
    }

    /// Clamp every field into its usable range. Zero row counts become 1;
    /// the upload part size is raised to the multipart minimum.
    pub fn clamped(mut self) -> Self {
        self.fetch_array_size = self.fetch_array_size.max(1);
        self.chunk_size = self.chunk_size.max(1);
        self.jsonl_buffer_size = self.jsonl_buffer_size.max(1024);
        self.gzip_buffer_size = self.gzip_buffer_size.max(1024);
        self.upload_part_size = self.upload_part_size.max(MIN_UPLOAD_PART_SIZE);
        self
    }
}

/// Application configuration, loaded from environment variables
/// (with `.env` support in dev via dotenvy).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub s3_config: S3Config,
    pub bind_addr: String,
    /// Hard cap on workers per job for this process
    pub max_parallelism: usize,
    pub buffers: BufferConfig,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Required: `TABLEFLOW_DATABASE_URL`, `TABLEFLOW_S3_BUCKET`,
    /// `TABLEFLOW_S3_REGION`, `TABLEFLOW_S3_ACCESS_KEY`,
    /// `TABLEFLOW_S3_SECRET_KEY`.
    /// Optional: `TABLEFLOW_S3_ENDPOINT`, `TABLEFLOW_BIND_ADDR`,
    /// `TABLEFLOW_MAX_PARALLELISM`, `TABLEFLOW_BUFFER_PROFILE`.
    pub fn load() -> Self {
        if dotenvy::dotenv().is_ok() {
            tracing::info!("loaded .env file");
        }

        let database_url = std::env::var("TABLEFLOW_DATABASE_URL")
            .expect("TABLEFLOW_DATABASE_URL must be set");

        let bucket_name =
            std::env::var("TABLEFLOW_S3_BUCKET").expect("TABLEFLOW_S3_BUCKET must be set");
        let region =
            std::env::var("TABLEFLOW_S3_REGION").expect("TABLEFLOW_S3_REGION must be set");
        let access_key_id =
            std::env::var("TABLEFLOW_S3_ACCESS_KEY").expect("TABLEFLOW_S3_ACCESS_KEY must be set");
        let secret_access_key =
            std::env::var("TABLEFLOW_S3_SECRET_KEY").expect("TABLEFLOW_S3_SECRET_KEY must be set");
        let endpoint_url = std::env::var("TABLEFLOW_S3_ENDPOINT").ok();

        let s3_config = S3Config {
            bucket_name,
            region,
            access_key_id,
            secret_access_key,
            endpoint_url,
        };

        let bind_addr = std::env::var("TABLEFLOW_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let max_parallelism = std::env::var("TABLEFLOW_MAX_PARALLELISM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(MAX_PARALLELISM)
            .clamp(1, MAX_PARALLELISM);

        let buffers = std::env::var("TABLEFLOW_BUFFER_PROFILE")
            .ok()
            .and_then(|name| BufferConfig::profile(&name))
            .unwrap_or_default()
            .clamped();

        Self {
            database_url,
            s3_config,
            bind_addr,
            max_parallelism,
            buffers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_resolve_by_name() {
        assert_eq!(BufferConfig::profile("default"), Some(BufferConfig::default()));
        assert_eq!(
            BufferConfig::profile("high-performance"),
            Some(BufferConfig::high_performance())
        );
        assert_eq!(
            BufferConfig::profile("low-memory"),
            Some(BufferConfig::low_memory())
        );
        assert_eq!(BufferConfig::profile("turbo"), None);
    }

    #[test]
    fn clamp_raises_part_size_to_multipart_minimum() {
        let cfg = BufferConfig {
            fetch_array_size: 0,
            chunk_size: 0,
            jsonl_buffer_size: 0,
            gzip_buffer_size: 0,
            upload_part_size: 256 * 1024,
        }
        .clamped();

        assert_eq!(cfg.fetch_array_size, 1);
        assert_eq!(cfg.chunk_size, 1);
        assert_eq!(cfg.upload_part_size, MIN_UPLOAD_PART_SIZE);
    }

    #[test]
    fn named_profiles_are_internally_consistent() {
        for profile in [
            BufferConfig::default(),
            BufferConfig::high_performance(),
            BufferConfig::low_memory(),
        ] {
            // Every shipped profile already satisfies its own clamp.
            assert_eq!(profile, profile.clamped());
        }
    }
}

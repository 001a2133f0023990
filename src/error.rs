use serde::Serialize;

/// Stable error-code vocabulary surfaced to API clients and event consumers.
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CANCELLED: &str = "CANCELLED";
    pub const SOURCE_CONNECTION_ERROR: &str = "SOURCE_CONNECTION_ERROR";
    pub const SOURCE_STREAM_ERROR: &str = "SOURCE_STREAM_ERROR";
    pub const ENCODE_ERROR: &str = "ENCODE_ERROR";
    pub const COMPRESS_ERROR: &str = "COMPRESS_ERROR";
    pub const S3_UPLOAD_ERROR: &str = "S3_UPLOAD_ERROR";
    pub const EXPORT_FAILED: &str = "EXPORT_FAILED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// User-visible error record: stable code plus human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
            trace_id: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

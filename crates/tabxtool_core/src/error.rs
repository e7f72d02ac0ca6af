use thiserror::Error;

/// Failures raised by the chunk packer.
///
/// Configuration errors are reported before any record is looked at, so a
/// failed run never leaves partial output behind.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("chunk ceiling must be a positive byte count, got {0}")]
    InvalidCeiling(i64),
    #[error("batch size must be a positive record count, got {0}")]
    InvalidBatchSize(i64),
    #[error("failed to serialize record {uid}: {message}")]
    Serialization { uid: String, message: String },
    #[error("failed to serialize chunk: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised while turning raw JSON objects into records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("input is not a JSON array of records: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("record #{index} ({uid}) has unknown field `{field}`")]
    UnknownField {
        index: usize,
        uid: String,
        field: String,
    },
    #[error("record #{index} ({uid}) field `{field}` must be a string or null")]
    NonStringText {
        index: usize,
        uid: String,
        field: String,
    },
    #[error("record #{index} has an empty uid")]
    EmptyUid { index: usize },
}

use thiserror::Error;

/// Why a single event was not ingested.
///
/// Skips are expected during normal operation (bad readout, a detector
/// missing from one event) and never abort the worker loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SkipReason {
    #[error("malformed event record: {0}")]
    Malformed(String),

    #[error("missing data for {0}")]
    MissingData(String),

    #[error("field {0} is not a numeric scalar")]
    NotScalar(String),

    #[error("{0} evaluates to a non-finite number")]
    NonFinite(String),
}

/// Protocol violations found while building or merging a batch.
///
/// These are handled at the smallest granularity possible: the
/// offending key is dropped from that one batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    #[error("key {key} has {found} values, batch holds {expected} events")]
    LengthMismatch {
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("key {key} mixes value shapes within one batch")]
    ShapeMismatch { key: String },

    #[error("key {key} holds NaN or infinite values")]
    NonFinite { key: String },

    #[error("key {key} holds a tensor whose data does not fill its shape")]
    MalformedTensor { key: String },
}

impl BatchError {
    pub fn key(&self) -> &str {
        match self {
            BatchError::LengthMismatch { key, .. } => key,
            BatchError::ShapeMismatch { key } => key,
            BatchError::NonFinite { key } => key,
            BatchError::MalformedTensor { key } => key,
        }
    }
}

/// Failures turning a WebSocket frame into a message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid compressed payload: {0}")]
    Compression(#[from] std::io::Error),

    #[error("unsupported frame type")]
    UnsupportedFrame,
}

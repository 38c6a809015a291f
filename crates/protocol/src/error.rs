//! Error types for the FlowFile protocol layer.

/// Errors produced while encoding, decoding or reading FlowFiles.
#[derive(Debug, thiserror::Error)]
pub enum FlowFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no NiFiFF3 header found")]
    NoHeader,

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("file cannot be reset: source is a one-shot stream")]
    NotResettable,

    #[error("file source does not support random access")]
    NotSeekable,

    #[error("unknown checksum type: {0:?}")]
    UnknownChecksum(String),

    #[error("mismatching checksum")]
    ChecksumMismatch,

    #[error("missing checksum")]
    ChecksumMissing,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid file {path:?}: {reason}")]
    InvalidFile { path: String, reason: String },
}

impl FlowFileError {
    /// Returns `true` for errors caused by a bad local setup rather than by
    /// the bytes on the wire or the transport.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::NotResettable | Self::NotSeekable | Self::UnknownChecksum(_)
        )
    }

    /// Returns `true` for checksum verification failures.
    pub fn is_checksum(&self) -> bool {
        matches!(self, Self::ChecksumMismatch | Self::ChecksumMissing)
    }
}

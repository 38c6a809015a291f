use flowfile_protocol::FlowFileError;

/// Errors produced by the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    FlowFile(#[from] FlowFileError),

    /// The peer is reachable but not a compatible FlowFile receiver.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// Retries were requested but a file in the batch cannot be re-read.
    #[error("retry requires resettable files; file #{index} is a one-shot stream")]
    NotResettable { index: usize },

    #[error("POST body closed before all data was sent")]
    WriterClosed,

    #[error("request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl HttpError {
    /// Returns `true` for transport-class failures that a retry with a
    /// fresh handshake may fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Client(err) => !err.is_builder(),
            Self::Io(_) | Self::Status { .. } | Self::WriterClosed => true,
            Self::FlowFile(FlowFileError::Io(_)) => true,
            Self::FlowFile(_) | Self::Handshake(_) | Self::NotResettable { .. } | Self::Task(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(!HttpError::Handshake("version 2".into()).is_retryable());
        assert!(!HttpError::NotResettable { index: 0 }.is_retryable());
        assert!(!HttpError::FlowFile(FlowFileError::NotSeekable).is_retryable());
    }

    #[test]
    fn transport_errors_are_retryable() {
        let status = HttpError::Status {
            status: 503,
            url: "http://localhost/".into(),
        };
        assert!(status.is_retryable());
        assert!(HttpError::WriterClosed.is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(HttpError::FlowFile(FlowFileError::Io(io)).is_retryable());
    }
}

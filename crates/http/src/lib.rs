//! FlowFile v3 over HTTP.
//!
//! The sending side is an [`HttpTransaction`]: a `HEAD` handshake that
//! checks the peer speaks flowfile-v3 protocol version 3, followed by
//! chunked `POST` requests whose bodies are back-to-back records. Each POST
//! is driven by an [`HttpPostWriter`], which buffers record bytes and
//! flushes them to a background request task when its buffer fills or a
//! flush interval elapses.
//!
//! The receiving side is an [`HttpReceiver`]: an axum router that answers
//! the handshake and hands every record of a POST body to a
//! [`FileHandler`] while the body is still streaming in.

mod error;
mod handler;
mod metrics;
mod receiver;
mod transaction;
mod writer;

#[cfg(test)]
mod test_support;

pub use error::HttpError;
pub use handler::{FileHandler, HandlerError, HandlerFuture, RequestInfo};
pub use metrics::{MetricsSnapshot, TransferMetrics};
pub use receiver::{HttpReceiver, ReceiverConfig};
pub use transaction::{HttpTransaction, TransactionConfig};
pub use writer::{HttpPostWriter, WriterOptions};

/// Media type of a FlowFile v3 request body.
pub const CONTENT_TYPE: &str = flowfile_protocol::CONTENT_TYPE;

/// `Accept` value advertised by receivers.
pub const ACCEPT: &str = "application/flowfile-v3,*/*;q=0.8";

/// The only transfer protocol version spoken here.
pub const PROTOCOL_VERSION: &str = "3";

pub const HEADER_TRANSACTION_ID: &str = "x-nifi-transaction-id";
pub const HEADER_PROTOCOL_VERSION: &str = "x-nifi-transfer-protocol-version";
pub const HEADER_MAX_PARTITION_SIZE: &str = "max-partition-size";

/// Older spelling of [`HEADER_MAX_PARTITION_SIZE`], still read and sent.
pub const HEADER_MAX_PARTITION_SIZE_LEGACY: &str = "x-ff-max-partition-size";

/// Default `User-Agent` for outgoing requests.
pub const USER_AGENT: &str = "NiFi FlowFile Client (flowfile-rs)";

/// Default path the receiver listens on.
pub const DEFAULT_LISTEN_PATH: &str = "/contentListener";

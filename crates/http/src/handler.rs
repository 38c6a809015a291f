//! Handler trait for records arriving at an [`HttpReceiver`](crate::HttpReceiver).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::{HeaderMap, Method, Uri};
use flowfile_protocol::StreamingFile;

/// Error type handlers may return. Any error turns into a 500 response.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// The request a record arrived on.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestInfo {
    /// The `x-nifi-transaction-id` the sender attached, if any.
    pub fn transaction_id(&self) -> Option<&str> {
        self.headers
            .get(crate::HEADER_TRANSACTION_ID)
            .and_then(|v| v.to_str().ok())
    }
}

/// Receives each record of a POST body in order.
///
/// The record's content is still streaming from the client when `handle`
/// runs. Whatever the handler leaves unread is discarded before the next
/// record is decoded.
pub trait FileHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        file: &'a mut StreamingFile,
        request: &'a RequestInfo,
    ) -> HandlerFuture<'a>;
}

impl<H: FileHandler> FileHandler for Arc<H> {
    fn handle<'a>(
        &'a self,
        file: &'a mut StreamingFile,
        request: &'a RequestInfo,
    ) -> HandlerFuture<'a> {
        (**self).handle(file, request)
    }
}

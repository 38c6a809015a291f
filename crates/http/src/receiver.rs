//! axum endpoint accepting FlowFile POSTs.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::head;
use flowfile_protocol::{CustodyHop, Scanner, StreamingFile};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::handler::{FileHandler, HandlerError, RequestInfo};
use crate::metrics::TransferMetrics;
use crate::{
    HEADER_MAX_PARTITION_SIZE, HEADER_MAX_PARTITION_SIZE_LEGACY, HEADER_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Route the HEAD and POST handlers are mounted on.
    pub path: String,
    /// `Server` header value; omitted when `None`.
    pub server: Option<String>,
    /// Advertised record size limit; 0 advertises nothing.
    pub max_partition_size: u64,
    /// Shift the custody chain and record this hop on every record.
    pub custody_chain: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            path: crate::DEFAULT_LISTEN_PATH.to_string(),
            server: Some(format!("flowfile-rs/{}", env!("CARGO_PKG_VERSION"))),
            max_partition_size: 0,
            custody_chain: false,
        }
    }
}

struct ReceiverState<H> {
    config: ReceiverConfig,
    handler: H,
    metrics: Arc<TransferMetrics>,
}

/// Answers the handshake and feeds every received record to a handler.
pub struct HttpReceiver<H> {
    state: Arc<ReceiverState<H>>,
}

impl<H> Clone for HttpReceiver<H> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<H: FileHandler> HttpReceiver<H> {
    pub fn new(config: ReceiverConfig, handler: H) -> Self {
        Self {
            state: Arc::new(ReceiverState {
                config,
                handler,
                metrics: Arc::new(TransferMetrics::new()),
            }),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.state.config
    }

    /// Size counters of every record received so far.
    pub fn metrics(&self) -> Arc<TransferMetrics> {
        Arc::clone(&self.state.metrics)
    }

    /// HEAD and POST routes on the configured path.
    pub fn router(&self) -> Router {
        Router::new()
            .route(
                &self.state.config.path,
                head(handshake::<H>).post(receive::<H>),
            )
            .with_state(Arc::clone(&self.state))
    }

    /// Serves the router on `listener` until `cancel` fires.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = %self.state.config.path, "receiver listening");
        }
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    }
}

async fn handshake<H: FileHandler>(State(state): State<Arc<ReceiverState<H>>>) -> Response {
    let mut headers = base_headers(&state.config);
    headers.insert(ACCEPT, HeaderValue::from_static(crate::ACCEPT));
    headers.insert(
        HeaderName::from_static(HEADER_PROTOCOL_VERSION),
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    if state.config.max_partition_size > 0 {
        let size = HeaderValue::from(state.config.max_partition_size);
        headers.insert(HeaderName::from_static(HEADER_MAX_PARTITION_SIZE), size.clone());
        headers.insert(HeaderName::from_static(HEADER_MAX_PARTITION_SIZE_LEGACY), size);
    }
    (StatusCode::OK, headers).into_response()
}

async fn receive<H: FileHandler>(
    State(state): State<Arc<ReceiverState<H>>>,
    request: Request,
) -> Response {
    let info = RequestInfo {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: request.headers().clone(),
        remote_addr: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr),
    };
    let body = StreamReader::new(
        request
            .into_body()
            .into_data_stream()
            .map_err(io::Error::other),
    );

    let is_flowfile = info
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with(crate::CONTENT_TYPE));

    let result = if is_flowfile {
        receive_records(&state, Scanner::new(body), &info).await
    } else {
        let Some(size) = info
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
        else {
            return respond(&state.config, StatusCode::LENGTH_REQUIRED, "Content-Length required");
        };
        receive_single(&state, StreamingFile::from_reader(body, size), &info).await
    };

    match result {
        Ok(records) => {
            debug!(
                records,
                remote = ?info.remote_addr,
                txid = info.transaction_id().unwrap_or("-"),
                "POST received"
            );
            respond(&state.config, StatusCode::OK, "")
        }
        Err(err) => {
            error!(
                remote = ?info.remote_addr,
                txid = info.transaction_id().unwrap_or("-"),
                error = %err,
                "POST failed"
            );
            respond(
                &state.config,
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Error {err}"),
            )
        }
    }
}

async fn receive_records<H: FileHandler>(
    state: &ReceiverState<H>,
    mut scanner: Scanner,
    info: &RequestInfo,
) -> Result<u64, HandlerError> {
    while scanner.scan().await {
        let Some(file) = scanner.file() else {
            break;
        };
        prepare(state, file, info);
        state.handler.handle(file, info).await?;
    }
    Ok(scanner.finish().await?)
}

async fn receive_single<H: FileHandler>(
    state: &ReceiverState<H>,
    mut file: StreamingFile,
    info: &RequestInfo,
) -> Result<u64, HandlerError> {
    prepare(state, &mut file, info);
    state.handler.handle(&mut file, info).await?;
    file.close().await?;
    Ok(1)
}

fn prepare<H>(state: &ReceiverState<H>, file: &mut StreamingFile, info: &RequestInfo) {
    file.init_checksum();
    state.metrics.observe(file.size());
    if state.config.custody_chain {
        let attrs = file.attrs_mut();
        attrs.custody_chain_shift();
        attrs.custody_chain_add_hop(&CustodyHop {
            request_uri: Some(info.uri.to_string()),
            remote_addr: info.remote_addr,
            tls: None,
        });
    }
}

fn base_headers(config: &ReceiverConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(server) = config
        .server
        .as_deref()
        .and_then(|s| HeaderValue::from_str(s).ok())
    {
        headers.insert(SERVER, server);
    }
    headers
}

fn respond(config: &ReceiverConfig, status: StatusCode, message: &str) -> Response {
    let mut headers = base_headers(config);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    (status, headers, message.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use flowfile_protocol::{StreamingFile, attributes, write_files};

    use super::*;
    use crate::test_support::{Collect, config, spawn};

    fn record(name: &str, content: &[u8]) -> StreamingFile {
        let mut file = StreamingFile::from_bytes(content.to_vec());
        file.attrs_mut().set(attributes::FILENAME, name);
        file
    }

    async fn encode(files: &mut [StreamingFile]) -> Vec<u8> {
        let mut body = Vec::new();
        write_files(&mut body, files).await.unwrap();
        body
    }

    #[tokio::test]
    async fn head_advertises_capabilities() {
        let receiver = HttpReceiver::new(
            ReceiverConfig {
                max_partition_size: 1024,
                ..config()
            },
            Collect::default(),
        );
        let url = spawn(&receiver).await;

        let res = reqwest::Client::new().head(&url).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let header = |name: &str| res.headers().get(name).unwrap().to_str().unwrap().to_string();
        assert_eq!(header("accept"), crate::ACCEPT);
        assert_eq!(header(HEADER_PROTOCOL_VERSION), "3");
        assert_eq!(header(HEADER_MAX_PARTITION_SIZE), "1024");
        assert_eq!(header(HEADER_MAX_PARTITION_SIZE_LEGACY), "1024");
        assert_eq!(header("server"), "test-receiver/1");
    }

    #[tokio::test]
    async fn records_reach_handler_in_order() {
        let collect = Arc::new(Collect::default());
        let receiver = HttpReceiver::new(
            ReceiverConfig {
                custody_chain: true,
                ..config()
            },
            Arc::clone(&collect),
        );
        let url = spawn(&receiver).await;
        let body = encode(&mut [record("a.txt", b"first"), record("b.txt", b"")]).await;

        let res = reqwest::Client::new()
            .post(&url)
            .header("content-type", crate::CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "text/plain");

        let seen = collect.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].attrs.get(attributes::FILENAME), Some("a.txt"));
        assert_eq!(seen[0].content, b"first");
        assert_eq!(seen[1].attrs.get(attributes::FILENAME), Some("b.txt"));
        assert!(seen[1].content.is_empty());
        assert_eq!(
            seen[0].attrs.get("custodyChain.0.source.host"),
            Some("127.0.0.1")
        );
        assert_eq!(
            seen[0].attrs.get("custodyChain.0.request.uri"),
            Some(crate::DEFAULT_LISTEN_PATH)
        );
        assert_eq!(receiver.metrics().count(), 2);
    }

    #[tokio::test]
    async fn unread_content_is_skipped_between_records() {
        struct HeadersOnly(std::sync::Mutex<Vec<String>>);
        impl FileHandler for HeadersOnly {
            fn handle<'a>(
                &'a self,
                file: &'a mut StreamingFile,
                _request: &'a RequestInfo,
            ) -> crate::HandlerFuture<'a> {
                let name = file.attrs().get(attributes::FILENAME).unwrap_or_default().to_string();
                self.0.lock().unwrap().push(name);
                Box::pin(async { Ok::<_, crate::HandlerError>(()) })
            }
        }

        let handler = Arc::new(HeadersOnly(Default::default()));
        let receiver = HttpReceiver::new(config(), Arc::clone(&handler));
        let url = spawn(&receiver).await;
        let body = encode(&mut [record("x", &[7u8; 5000]), record("y", b"tail")]).await;

        let res = reqwest::Client::new()
            .post(&url)
            .header("content-type", crate::CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(*handler.0.lock().unwrap(), ["x", "y"]);
    }

    #[tokio::test]
    async fn other_content_types_are_one_record() {
        let collect = Arc::new(Collect::default());
        let receiver = HttpReceiver::new(config(), Arc::clone(&collect));
        let url = spawn(&receiver).await;

        let res = reqwest::Client::new()
            .post(&url)
            .header("content-type", "text/plain")
            .body("hello")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let seen = collect.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].content, b"hello");
        assert!(seen[0].attrs.is_empty());
    }

    #[tokio::test]
    async fn missing_length_is_rejected() {
        let receiver = HttpReceiver::new(config(), Collect::default());
        let url = spawn(&receiver).await;
        let chunks = futures_util::stream::iter(vec![Ok::<_, io::Error>(b"abc".to_vec())]);

        let res = reqwest::Client::new()
            .post(&url)
            .header("content-type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(chunks))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn handler_error_becomes_500() {
        let receiver = HttpReceiver::new(config(), Collect::failing(1));
        let url = spawn(&receiver).await;
        let body = encode(&mut [record("a", b"abc")]).await;

        let res = reqwest::Client::new()
            .post(&url)
            .header("content-type", crate::CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.headers()["server"], "test-receiver/1");
        let text = res.text().await.unwrap();
        assert!(text.starts_with("Error "), "{text}");
    }

    #[tokio::test]
    async fn truncated_body_becomes_500() {
        let receiver = HttpReceiver::new(config(), Collect::default());
        let url = spawn(&receiver).await;
        let mut body = encode(&mut [record("a", b"0123456789")]).await;
        body.truncate(body.len() - 4);

        let res = reqwest::Client::new()
            .post(&url)
            .header("content-type", crate::CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

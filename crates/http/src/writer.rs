//! Streaming body of one FlowFile POST.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flowfile_protocol::{StreamingFile, encode_header};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::HttpError;

type Chunk = Result<Vec<u8>, io::Error>;

const COPY_CHUNK: usize = 32 * 1024;

/// Buffering and flushing knobs for an [`HttpPostWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// Bytes accumulated before a chunk is handed to the request.
    pub buffer_size: usize,
    /// Upper bound on how long written bytes may sit in the buffer.
    /// Zero disables timed flushing.
    pub flush_interval: Duration,
    /// Chunks in flight between the writer and the request task.
    pub channel_depth: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            flush_interval: Duration::from_millis(100),
            channel_depth: 4,
        }
    }
}

struct Pending {
    buf: Vec<u8>,
    tx: Option<mpsc::Sender<Chunk>>,
}

impl Pending {
    async fn flush(&mut self) -> Result<(), HttpError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let tx = self.tx.as_ref().ok_or(HttpError::WriterClosed)?;
        let chunk = std::mem::take(&mut self.buf);
        tx.send(Ok(chunk)).await.map_err(|_| HttpError::WriterClosed)
    }
}

/// One open chunked POST whose body is produced by [`write`](Self::write).
///
/// The request runs on a background task. Written bytes are collected in a
/// buffer and handed to that task whenever the buffer fills, whenever the
/// flush interval ticks, and on [`close`](Self::close). A writer dropped
/// without `close` aborts the request, so a half-written body is never
/// mistaken for a complete one.
pub struct HttpPostWriter {
    pending: Arc<Mutex<Pending>>,
    write_lock: Mutex<()>,
    options: WriterOptions,
    url: String,
    written: AtomicU64,
    cancel: CancellationToken,
    flusher: Option<JoinHandle<()>>,
    response: Option<JoinHandle<reqwest::Result<Response>>>,
}

impl HttpPostWriter {
    /// Starts `request` with a streamed body and returns the writer feeding it.
    pub fn start(request: RequestBuilder, url: impl Into<String>, options: WriterOptions) -> Self {
        let (tx, rx) = mpsc::channel::<Chunk>(options.channel_depth.max(1));
        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        let response = tokio::spawn(request.body(reqwest::Body::wrap_stream(body)).send());

        let pending = Arc::new(Mutex::new(Pending {
            buf: Vec::with_capacity(options.buffer_size),
            tx: Some(tx),
        }));
        let cancel = CancellationToken::new();
        let flusher = (!options.flush_interval.is_zero()).then(|| {
            tokio::spawn(flush_loop(
                Arc::clone(&pending),
                options.flush_interval,
                cancel.clone(),
            ))
        });

        Self {
            pending,
            write_lock: Mutex::new(()),
            options,
            url: url.into(),
            written: AtomicU64::new(0),
            cancel,
            flusher,
            response: Some(response),
        }
    }

    /// Frames `file` onto the body. Returns the number of bytes written,
    /// header included.
    ///
    /// Writes are serialized: a concurrent caller waits for the record in
    /// progress to finish.
    pub async fn write(&self, file: &mut StreamingFile) -> Result<u64, HttpError> {
        let _guard = self.write_lock.lock().await;

        if file.position() != 0 {
            file.reset()?;
        }
        let mut header = Vec::new();
        encode_header(file.attrs(), file.size(), &mut header)?;
        self.push(&header).await?;

        let mut chunk = vec![0u8; COPY_CHUNK.min(self.options.buffer_size.max(1))];
        let mut copied = 0u64;
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.push(&chunk[..n]).await?;
            copied += n as u64;
        }
        if copied != file.size() {
            return Err(HttpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("record content ended after {copied} of {} bytes", file.size()),
            )));
        }

        let total = header.len() as u64 + copied;
        self.written.fetch_add(total, Ordering::Relaxed);
        Ok(total)
    }

    /// Bytes framed onto the body so far.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Flushes buffered bytes to the request without waiting for the timer.
    pub async fn flush(&self) -> Result<(), HttpError> {
        self.pending.lock().await.flush().await
    }

    /// Flushes, ends the body and waits for the response. Anything but
    /// `200 OK` is an error.
    pub async fn close(mut self) -> Result<(), HttpError> {
        self.stop_flusher().await;

        let flushed = {
            let mut pending = self.pending.lock().await;
            let flushed = pending.flush().await;
            pending.tx = None;
            flushed
        };

        let Some(response) = self.response.take() else {
            return Err(HttpError::WriterClosed);
        };
        let response = response.await??;
        if response.status() != StatusCode::OK {
            return Err(self.rejected(response).await);
        }
        flushed?;

        debug!(url = %self.url, bytes = self.bytes_written(), "POST complete");
        Ok(())
    }

    /// Aborts the request with `reason` so the receiver sees a failed body
    /// rather than a clean end of stream.
    pub async fn terminate(mut self, reason: impl std::fmt::Display) {
        self.stop_flusher().await;

        {
            let mut pending = self.pending.lock().await;
            pending.buf.clear();
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Err(io::Error::other(reason.to_string()))).await;
            }
        }
        if let Some(response) = self.response.take() {
            match response.await {
                Ok(Ok(res)) => debug!(url = %self.url, status = %res.status(), "terminated POST answered"),
                Ok(Err(err)) => debug!(url = %self.url, error = %err, "terminated POST failed"),
                Err(err) => debug!(url = %self.url, error = %err, "terminated POST task failed"),
            }
        }
    }

    /// Ends the request after a failed [`write`](Self::write) and returns the
    /// error worth reporting.
    ///
    /// [`HttpError::WriterClosed`] means the request stopped taking chunks,
    /// usually because the receiver already answered. In that case the body
    /// is ended and the answer is reported instead. Any other error
    /// terminates the body.
    pub async fn fail(mut self, err: HttpError) -> HttpError {
        if !matches!(err, HttpError::WriterClosed) {
            self.terminate(&err).await;
            return err;
        }
        self.stop_flusher().await;
        {
            let mut pending = self.pending.lock().await;
            pending.buf.clear();
            pending.tx = None;
        }
        let Some(response) = self.response.take() else {
            return err;
        };
        match response.await {
            Ok(Ok(res)) if res.status() != StatusCode::OK => self.rejected(res).await,
            Ok(Err(client)) => HttpError::Client(client),
            _ => err,
        }
    }

    async fn rejected(&self, response: Response) -> HttpError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(url = %self.url, %status, body = %body.trim(), "POST rejected");
        HttpError::Status {
            status: status.as_u16(),
            url: self.url.clone(),
        }
    }

    async fn push(&self, data: &[u8]) -> Result<(), HttpError> {
        let mut pending = self.pending.lock().await;
        pending.buf.extend_from_slice(data);
        if pending.buf.len() >= self.options.buffer_size {
            pending.flush().await?;
        }
        Ok(())
    }

    async fn stop_flusher(&mut self) {
        self.cancel.cancel();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.await;
        }
    }
}

impl Drop for HttpPostWriter {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.response.is_none() {
            return;
        }
        if let Ok(mut pending) = self.pending.try_lock() {
            if let Some(tx) = pending.tx.take() {
                let _ = tx.try_send(Err(io::Error::other("POST writer dropped before close")));
            }
        }
        if let Some(response) = self.response.take() {
            response.abort();
        }
    }
}

impl std::fmt::Debug for HttpPostWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPostWriter")
            .field("url", &self.url)
            .field("options", &self.options)
            .field("written", &self.bytes_written())
            .finish()
    }
}

async fn flush_loop(pending: Arc<Mutex<Pending>>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = pending.lock().await.flush().await {
                    debug!(error = %err, "timed flush stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flowfile_protocol::attributes;
    use reqwest::Client;

    use crate::test_support::{Collect, config, spawn};
    use crate::{HttpReceiver, HttpTransaction, TransactionConfig};

    use super::*;

    async fn transaction(collect: &Arc<Collect>, settings: TransactionConfig) -> HttpTransaction {
        let receiver = HttpReceiver::new(config(), Arc::clone(collect));
        let url = spawn(&receiver).await;
        HttpTransaction::new(&url, Client::new(), settings).await.unwrap()
    }

    fn named(name: &str, content: &[u8]) -> StreamingFile {
        let mut file = StreamingFile::from_bytes(content.to_vec());
        file.attrs_mut().set(attributes::FILENAME, name);
        file
    }

    #[tokio::test]
    async fn buffered_bytes_are_flushed_on_interval() {
        let collect = Arc::new(Collect::default());
        let tx = transaction(
            &collect,
            TransactionConfig {
                buffer_size: 1 << 20,
                flush_interval_ms: 20,
                ..TransactionConfig::default()
            },
        )
        .await;

        let writer = tx.post_writer();
        writer.write(&mut named("early", b"visible before close")).await.unwrap();

        let mut delivered = false;
        for _ in 0..100 {
            if !collect.seen().is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered, "record not delivered while POST was open");

        writer.close().await.unwrap();
        assert_eq!(collect.seen()[0].content, b"visible before close");
    }

    #[tokio::test]
    async fn full_buffer_is_flushed_without_timer() {
        let collect = Arc::new(Collect::default());
        let tx = transaction(
            &collect,
            TransactionConfig {
                buffer_size: 256,
                flush_interval_ms: 0,
                ..TransactionConfig::default()
            },
        )
        .await;

        let writer = tx.post_writer();
        let mut files = vec![named("a", &[1u8; 1000]), named("b", &[2u8; 10])];
        let mut total = 0;
        for file in files.iter_mut() {
            total += writer.write(file).await.unwrap();
        }
        assert_eq!(writer.bytes_written(), total);
        writer.close().await.unwrap();

        let seen = collect.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].content, vec![1u8; 1000]);
        assert_eq!(seen[1].content, vec![2u8; 10]);
    }

    #[tokio::test]
    async fn terminated_post_does_not_complete_records() {
        let collect = Arc::new(Collect::default());
        let tx = transaction(
            &collect,
            TransactionConfig {
                buffer_size: 16,
                flush_interval_ms: 0,
                ..TransactionConfig::default()
            },
        )
        .await;

        // Declares 100 bytes but only 40 exist, so part of the record goes out.
        let writer = tx.post_writer();
        let mut file = StreamingFile::from_reader(std::io::Cursor::new(vec![5u8; 40]), 100);
        file.attrs_mut().set(attributes::FILENAME, "partial");
        assert!(writer.write(&mut file).await.is_err());
        assert_eq!(writer.bytes_written(), 0);

        let mut started = false;
        for _ in 0..100 {
            if collect.calls.load(std::sync::atomic::Ordering::SeqCst) > 0 {
                started = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(started, "receiver never saw the record header");

        writer.terminate("producer gave up").await;
        assert!(collect.seen().is_empty());
    }

    #[tokio::test]
    async fn fail_reports_status_of_early_answer() {
        use axum::{Router, http::StatusCode, routing::post};

        let app = Router::new().route("/", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let writer = HttpPostWriter::start(Client::new().post(&url), &url, WriterOptions::default());
        writer.write(&mut named("x", b"abc")).await.unwrap();
        let err = writer.fail(HttpError::WriterClosed).await;
        assert!(matches!(err, HttpError::Status { status: 500, .. }), "{err}");
    }

    #[tokio::test]
    async fn close_reports_rejection() {
        let collect = Arc::new(Collect::failing(1));
        let tx = transaction(&collect, TransactionConfig::default()).await;

        let writer = tx.post_writer();
        writer.write(&mut named("x", b"abc")).await.unwrap();
        let err = writer.close().await.unwrap_err();
        assert!(matches!(err, HttpError::Status { status: 500, .. }), "{err}");
    }
}

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use flowfile_protocol::{
    ChecksumAlgorithm, ChecksumEngine, StreamingFile, attributes, segment_by_size,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE, SERVER, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::writer::{HttpPostWriter, WriterOptions};
use crate::{
    HEADER_MAX_PARTITION_SIZE, HEADER_MAX_PARTITION_SIZE_LEGACY, HEADER_PROTOCOL_VERSION,
    HEADER_TRANSACTION_ID, HttpError, PROTOCOL_VERSION,
};

/// Client-side settings of an [`HttpTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Algorithm stamped onto unchecksummed files before sending. `None`
    /// sends files as they are.
    pub checksum: Option<ChecksumAlgorithm>,
    /// Additional attempts after a failed send. Requires resettable files.
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Longest time written bytes may wait in the POST buffer. Zero
    /// flushes only when the buffer is full.
    pub flush_interval_ms: u64,
    pub buffer_size: usize,
    pub channel_depth: usize,
    pub user_agent: String,
    /// Extra headers sent with every POST.
    pub headers: BTreeMap<String, String>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        let writer = WriterOptions::default();
        Self {
            checksum: Some(ChecksumAlgorithm::Sha256),
            retries: 0,
            retry_delay_ms: 5000,
            flush_interval_ms: writer.flush_interval.as_millis() as u64,
            buffer_size: writer.buffer_size,
            channel_depth: writer.channel_depth,
            user_agent: crate::USER_AGENT.to_string(),
            headers: BTreeMap::new(),
        }
    }
}

impl TransactionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            buffer_size: self.buffer_size.max(1),
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            channel_depth: self.channel_depth.max(1),
        }
    }
}

/// What the last successful handshake negotiated.
#[derive(Debug, Clone)]
struct Session {
    url: Url,
    transaction_id: String,
    server: Option<String>,
    max_partition_size: u64,
}

/// A negotiated FlowFile session with one HTTP receiver.
///
/// Construction performs the handshake. Session fields are swapped as a
/// whole on every re-handshake, so concurrent senders always see a
/// matching url and transaction id.
#[derive(Debug)]
pub struct HttpTransaction {
    client: Client,
    origin: Url,
    config: TransactionConfig,
    engine: ChecksumEngine,
    session: RwLock<Session>,
}

impl HttpTransaction {
    /// Handshakes with the receiver at `url`.
    pub async fn new(url: &str, client: Client, config: TransactionConfig) -> Result<Self, HttpError> {
        let origin = Url::parse(url)
            .map_err(|e| HttpError::Handshake(format!("invalid url {url:?}: {e}")))?;
        let session = probe(&client, &origin, &config).await?;
        Ok(Self {
            client,
            origin,
            config,
            engine: ChecksumEngine::default(),
            session: RwLock::new(session),
        })
    }

    /// Uses `engine` when stamping checksums before a send.
    pub fn with_engine(mut self, engine: ChecksumEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Repeats the handshake with a fresh transaction id.
    pub async fn handshake(&self) -> Result<(), HttpError> {
        let session = probe(&self.client, &self.origin, &self.config).await?;
        *self.session.write().unwrap() = session;
        Ok(())
    }

    /// Final url of the receiver after redirects.
    pub fn url(&self) -> Url {
        self.session.read().unwrap().url.clone()
    }

    pub fn transaction_id(&self) -> String {
        self.session.read().unwrap().transaction_id.clone()
    }

    pub fn server(&self) -> Option<String> {
        self.session.read().unwrap().server.clone()
    }

    /// Largest record the receiver accepts; 0 when unbounded.
    pub fn max_partition_size(&self) -> u64 {
        self.session.read().unwrap().max_partition_size
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Opens a POST to the receiver. Records written to it travel in one
    /// request body.
    pub fn post_writer(&self) -> HttpPostWriter {
        let session = self.session.read().unwrap().clone();
        let mut request = self
            .client
            .post(session.url.clone())
            .header(CONTENT_TYPE, crate::CONTENT_TYPE)
            .header(HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION)
            .header(HEADER_TRANSACTION_ID, session.transaction_id.as_str())
            .header(USER_AGENT, self.config.user_agent.as_str());
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        HttpPostWriter::start(request, session.url.to_string(), self.config.writer_options())
    }

    pub async fn send(&self, file: &mut StreamingFile) -> Result<(), HttpError> {
        self.send_all(std::slice::from_mut(file)).await
    }

    /// Sends `files` in order in a single POST.
    ///
    /// With retries configured every file must be resettable; otherwise the
    /// call fails before touching the network. A failed attempt is followed
    /// by a new handshake, a rewind of every file and the configured delay.
    pub async fn send_all(&self, files: &mut [StreamingFile]) -> Result<(), HttpError> {
        self.stamp_checksums(files)?;

        let retries = self.config.retries;
        if retries > 0 {
            if let Some(index) = files.iter().position(|f| !f.can_reset()) {
                return Err(HttpError::NotResettable { index });
            }
        }

        let mut attempt = 0u32;
        loop {
            let err = match self.attempt(files, attempt).await {
                Ok(bytes) => {
                    debug!(files = files.len(), bytes, attempt, "send complete");
                    return Ok(());
                }
                Err(err) => err,
            };
            if attempt >= retries || !err.is_retryable() {
                return Err(err);
            }
            attempt += 1;
            warn!(attempt, retries, error = %err, "send failed, retrying");
        }
    }

    /// Sends `file`, splitting it into fragments first when it exceeds the
    /// receiver's advertised partition size.
    pub async fn send_partitioned(&self, file: &mut StreamingFile) -> Result<(), HttpError> {
        let max = self.max_partition_size();
        if max == 0 || file.size() <= max || !file.can_read_at() {
            return self.send(file).await;
        }

        self.stamp_checksums(std::slice::from_mut(file))?;
        let mut fragments = segment_by_size(file, max)?;
        info!(size = file.size(), max, fragments = fragments.len(), "sending in fragments");
        self.send_all(&mut fragments).await
    }

    async fn attempt(&self, files: &mut [StreamingFile], attempt: u32) -> Result<u64, HttpError> {
        if attempt > 0 {
            self.handshake().await?;
            reset_all(files)?;
            tokio::time::sleep(self.config.retry_delay()).await;
        } else if self.config.retries > 0 {
            reset_all(files)?;
        }

        let writer = self.post_writer();
        let mut bytes = 0u64;
        for file in files.iter_mut() {
            match writer.write(file).await {
                Ok(n) => bytes += n,
                Err(err) => return Err(writer.fail(err).await),
            }
        }
        writer.close().await?;
        Ok(bytes)
    }

    fn stamp_checksums(&self, files: &mut [StreamingFile]) -> Result<(), HttpError> {
        let Some(algorithm) = self.config.checksum else {
            return Ok(());
        };
        for file in files.iter_mut() {
            if file.size() > 0 && file.can_read_at() && !file.attrs().contains(attributes::CHECKSUM) {
                self.engine.add_checksum(file, algorithm)?;
            }
        }
        Ok(())
    }
}

fn reset_all(files: &mut [StreamingFile]) -> Result<(), HttpError> {
    for file in files.iter_mut() {
        file.reset()?;
    }
    Ok(())
}

async fn probe(client: &Client, url: &Url, config: &TransactionConfig) -> Result<Session, HttpError> {
    let transaction_id = uuid::Uuid::new_v4().to_string();
    let response = client
        .head(url.clone())
        .header(HEADER_TRANSACTION_ID, transaction_id.as_str())
        .header(USER_AGENT, config.user_agent.as_str())
        .send()
        .await?;

    if response.status() != StatusCode::OK {
        return Err(HttpError::Handshake(format!(
            "{url} answered {}",
            response.status()
        )));
    }

    let headers = response.headers();
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let accept = header(ACCEPT.as_str()).unwrap_or_default();
    if !accept
        .split(',')
        .any(|media| media.trim().starts_with(crate::CONTENT_TYPE))
    {
        return Err(HttpError::Handshake(format!(
            "{url} does not accept {}",
            crate::CONTENT_TYPE
        )));
    }

    let version = header(HEADER_PROTOCOL_VERSION).unwrap_or_default();
    if version != PROTOCOL_VERSION {
        return Err(HttpError::Handshake(format!(
            "{url} speaks protocol version {version:?}, need {PROTOCOL_VERSION}"
        )));
    }

    let max_partition_size = header(HEADER_MAX_PARTITION_SIZE)
        .or_else(|| header(HEADER_MAX_PARTITION_SIZE_LEGACY))
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let server = header(SERVER.as_str()).map(str::to_string);

    let session = Session {
        url: response.url().clone(),
        transaction_id,
        server,
        max_partition_size,
    };
    info!(
        url = %session.url,
        txid = %session.transaction_id,
        server = session.server.as_deref().unwrap_or("-"),
        max_partition_size,
        "handshake complete"
    );
    Ok(session)
}

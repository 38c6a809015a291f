//! Wires the receiver to a save or forward handler and runs until SIGINT.

use anyhow::Context;
use flowfile_http::{
    FileHandler, HandlerError, HandlerFuture, HttpReceiver, HttpTransaction, ReceiverConfig, RequestInfo,
};
use flowfile_protocol::{StreamingFile, attributes};
use flowfile_transfer::{Reassembler, SaveOutcome};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{Mode, RelayConfig};

/// Writes every record under the output directory.
pub struct SaveHandler {
    reassembler: Reassembler,
}

impl FileHandler for SaveHandler {
    fn handle<'a>(&'a self, file: &'a mut StreamingFile, request: &'a RequestInfo) -> HandlerFuture<'a> {
        Box::pin(async move {
            let outcome = self.reassembler.save(file).await?;
            match &outcome {
                SaveOutcome::Saved(path) | SaveOutcome::Reassembled(path) => tracing::info!(
                    path = %path.display(),
                    size = file.size(),
                    txid = request.transaction_id().unwrap_or("-"),
                    "record saved"
                ),
                SaveOutcome::Partial { path, received, expected } => tracing::debug!(
                    path = %path.display(),
                    received,
                    expected,
                    "fragment saved"
                ),
            }
            Ok::<_, HandlerError>(())
        })
    }
}

/// Sends every record on to another receiver.
pub struct ForwardHandler {
    transaction: HttpTransaction,
    partition: bool,
}

impl FileHandler for ForwardHandler {
    fn handle<'a>(&'a self, file: &'a mut StreamingFile, _request: &'a RequestInfo) -> HandlerFuture<'a> {
        Box::pin(async move {
            if self.transaction.config().retries > 0 {
                file.buffer().await?;
            }
            if self.partition {
                self.transaction.send_partitioned(file).await?;
            } else {
                self.transaction.send(file).await?;
            }
            tracing::debug!(
                filename = file.attrs().get(attributes::FILENAME).unwrap_or("-"),
                size = file.size(),
                url = %self.transaction.url(),
                "record forwarded"
            );
            Ok::<_, HandlerError>(())
        })
    }
}

/// Runs the relay described by `config` until interrupted.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    match config.mode {
        Mode::Save => {
            tokio::fs::create_dir_all(&config.output_dir)
                .await
                .with_context(|| format!("creating {}", config.output_dir.display()))?;
            tracing::info!(dir = %config.output_dir.display(), "saving received records");
            let handler = SaveHandler {
                reassembler: Reassembler::new(&config.output_dir, config.reassembly.clone()),
            };
            serve(config.receiver, listener, handler).await
        }
        Mode::Forward => {
            let url = config
                .forward_url
                .as_deref()
                .context("forward mode requires forward_url")?;
            let transaction =
                HttpTransaction::new(url, reqwest::Client::new(), config.transaction.clone())
                    .await
                    .with_context(|| format!("handshake with {url}"))?;
            tracing::info!(url = %transaction.url(), "forwarding received records");
            let handler = ForwardHandler {
                transaction,
                partition: config.partition,
            };
            serve(config.receiver, listener, handler).await
        }
    }
}

async fn serve<H: FileHandler>(
    config: ReceiverConfig,
    listener: TcpListener,
    handler: H,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let receiver = HttpReceiver::new(config, handler);
    let metrics = receiver.metrics();

    let mut server = {
        let receiver = receiver.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { receiver.serve(listener, cancel).await })
    };

    tokio::select! {
        result = &mut server => {
            result??;
            tracing::warn!("receiver stopped on its own");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    cancel.cancel();
    server.await??;

    let snapshot = metrics.snapshot();
    tracing::info!(
        records = snapshot.count,
        bytes = snapshot.sum,
        since = %snapshot.started,
        "receiver stopped"
    );
    Ok(())
}

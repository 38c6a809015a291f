use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use flowfile_protocol::{Attributes, StreamingFile};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{FileHandler, HandlerError, HandlerFuture, HttpReceiver, ReceiverConfig, RequestInfo};

#[derive(Debug, Clone)]
pub struct Received {
    pub attrs: Attributes,
    pub content: Vec<u8>,
    pub verified: bool,
    pub txid: Option<String>,
}

/// Records every file it sees. The first `fail_first` calls fail instead.
#[derive(Debug, Default)]
pub struct Collect {
    pub seen: Mutex<Vec<Received>>,
    pub calls: AtomicUsize,
    pub fail_first: usize,
}

impl Collect {
    pub fn failing(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<Received> {
        self.seen.lock().unwrap().clone()
    }
}

impl FileHandler for Collect {
    fn handle<'a>(
        &'a self,
        file: &'a mut StreamingFile,
        request: &'a RequestInfo,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(format!("refusing call {call}").into());
            }
            let mut content = Vec::new();
            file.read_to_end(&mut content).await?;
            let verified = file.verify().is_ok();
            self.seen.lock().unwrap().push(Received {
                attrs: file.attrs().clone(),
                content,
                verified,
                txid: request.transaction_id().map(str::to_string),
            });
            Ok::<_, HandlerError>(())
        })
    }
}

/// Serves `receiver` on a loopback port and returns its url.
pub async fn spawn<H: FileHandler>(receiver: &HttpReceiver<H>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!(
        "http://{}{}",
        listener.local_addr().unwrap(),
        receiver.config().path
    );
    let receiver = receiver.clone();
    tokio::spawn(async move { receiver.serve(listener, CancellationToken::new()).await });
    url
}

pub fn config() -> ReceiverConfig {
    ReceiverConfig {
        server: Some("test-receiver/1".into()),
        ..ReceiverConfig::default()
    }
}

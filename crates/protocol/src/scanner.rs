//! Iterates the records of a FlowFile stream.
//!
//! ```no_run
//! # async fn demo(body: tokio::net::TcpStream) -> Result<(), flowfile_protocol::FlowFileError> {
//! use flowfile_protocol::Scanner;
//!
//! let mut scanner = Scanner::new(body);
//! while scanner.scan().await {
//!     if let Some(file) = scanner.file() {
//!         println!("{:?}", file.attrs());
//!     }
//! }
//! if let Some(err) = scanner.take_err() {
//!     return Err(err);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, trace};

use crate::codec;
use crate::error::FlowFileError;
use crate::file::{BoxedReader, ReadAt, StreamingFile};

/// Lifecycle of a [`Scanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    HaveRecord,
    Exhausted,
    Errored,
}

enum Input {
    /// The stream is parked here between records, and inside the current
    /// record while one is active.
    Sequential(Option<BoxedReader>),
    RandomAccess { source: Arc<dyn ReadAt>, next: u64 },
}

/// Yields one [`StreamingFile`] at a time from a stream of records.
///
/// Advancing closes the previous record, which drains whatever the caller
/// left unread so the stream is positioned at the next header.
pub struct Scanner {
    input: Input,
    current: Option<StreamingFile>,
    state: ScanState,
    err: Option<FlowFileError>,
    records: u64,
}

impl Scanner {
    pub fn new<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        Self::with_input(Input::Sequential(Some(Box::new(reader))))
    }

    /// Scans records laid out in a random-access source from `offset` on.
    /// Files produced this way can be reset.
    pub fn from_random_access(source: Arc<dyn ReadAt>, offset: u64) -> Self {
        Self::with_input(Input::RandomAccess {
            source,
            next: offset,
        })
    }

    fn with_input(input: Input) -> Self {
        Self {
            input,
            current: None,
            state: ScanState::Idle,
            err: None,
            records: 0,
        }
    }

    /// Advances to the next record. Returns `false` at end of stream or on
    /// error; check [`err`](Self::err) to tell them apart.
    pub async fn scan(&mut self) -> bool {
        if matches!(self.state, ScanState::Exhausted | ScanState::Errored) {
            return false;
        }
        match self.advance().await {
            Ok(Some(file)) => {
                self.records += 1;
                trace!(record = self.records, size = file.size(), "scanned flowfile");
                self.current = Some(file);
                self.state = ScanState::HaveRecord;
                true
            }
            Ok(None) => {
                debug!(records = self.records, "flowfile stream exhausted");
                self.state = ScanState::Exhausted;
                false
            }
            Err(err) => {
                debug!(records = self.records, error = %err, "flowfile stream failed");
                self.err = Some(err);
                self.state = ScanState::Errored;
                false
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<StreamingFile>, FlowFileError> {
        if let Some(mut prev) = self.current.take() {
            prev.close().await?;
            if let Input::Sequential(slot) = &mut self.input {
                *slot = prev.into_reader();
            }
        }

        match &mut self.input {
            Input::Sequential(slot) => match slot.take() {
                Some(reader) => codec::read_boxed(reader).await,
                None => Ok(None),
            },
            Input::RandomAccess { source, next } => {
                let file = codec::read_file_at(Arc::clone(source), *next).await?;
                if let Some(file) = &file {
                    let (start, size) = file.window();
                    *next = start.saturating_add(size);
                }
                Ok(file)
            }
        }
    }

    /// The current record, only while one is active.
    pub fn file(&mut self) -> Option<&mut StreamingFile> {
        if self.state == ScanState::HaveRecord {
            self.current.as_mut()
        } else {
            None
        }
    }

    pub fn err(&self) -> Option<&FlowFileError> {
        self.err.as_ref()
    }

    pub fn take_err(&mut self) -> Option<FlowFileError> {
        self.err.take()
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Number of records yielded so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Closes the current record and reports the terminal error, if any.
    pub async fn finish(mut self) -> Result<u64, FlowFileError> {
        if let Some(mut file) = self.current.take() {
            file.close().await?;
        }
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(self.records),
        }
    }
}

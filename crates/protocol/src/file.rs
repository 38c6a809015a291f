//! The streaming FlowFile.
//!
//! A [`StreamingFile`] is one record in flight: an attribute set plus a
//! window of `size` content bytes. The bytes come from exactly one of:
//!
//! - a **sequential** source: a one-shot `AsyncRead`, typically shared with
//!   the records that follow it on the same stream. Cannot be reset.
//! - a **random-access** source: anything implementing [`ReadAt`]. The file
//!   reads a `(start, size)` window of it and can be reset any number of
//!   times.
//! - a **deferred path**: a file on disk that is opened on first use.
//!   Behaves like a random-access source once opened.
//!
//! Reading feeds a running checksum when the `checksumType` attribute names
//! a known algorithm (see [`crate::checksum`]). [`StreamingFile::close`]
//! drains unread bytes from a sequential source so the stream stays aligned
//! on the next record.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::attributes::{self, Attributes};
use crate::checksum::{ChecksumStatus, RunningChecksum};
use crate::error::FlowFileError;

/// A one-shot byte stream owned by a sequential file.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Positional reads that leave no cursor behind.
pub trait ReadAt: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns 0 at end of source.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        slice_read_at(self, buf, offset)
    }
}

impl ReadAt for Box<[u8]> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        slice_read_at(self, buf, offset)
    }
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

fn slice_read_at(data: &[u8], buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let Ok(start) = usize::try_from(offset) else {
        return Ok(0);
    };
    if start >= data.len() {
        return Ok(0);
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    Ok(n)
}

/// `AsyncRead` view over a [`ReadAt`] source starting at some offset.
pub(crate) struct ReadAtCursor {
    source: Arc<dyn ReadAt>,
    pos: u64,
}

impl ReadAtCursor {
    pub(crate) fn new(source: Arc<dyn ReadAt>, pos: u64) -> Self {
        Self { source, pos }
    }

    pub(crate) fn position(&self) -> u64 {
        self.pos
    }
}

impl AsyncRead for ReadAtCursor {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let n = this.source.read_at(buf.initialize_unfilled(), this.pos)?;
        buf.advance(n);
        this.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

enum Backing {
    Sequential(Option<BoxedReader>),
    RandomAccess(Arc<dyn ReadAt>),
    Path {
        path: PathBuf,
        handle: Option<Arc<dyn ReadAt>>,
    },
}

/// One FlowFile record: attributes plus a lazily read content window.
pub struct StreamingFile {
    attrs: Attributes,
    size: u64,
    start: u64,
    position: u64,
    remaining: u64,
    backing: Backing,
    /// Stream that followed a sequential record which has since been buffered.
    parent: Option<BoxedReader>,
    closed: bool,
    checksum: RunningChecksum,
}

impl StreamingFile {
    fn with_backing(backing: Backing, start: u64, size: u64) -> Self {
        Self {
            attrs: Attributes::new(),
            size,
            start,
            position: start,
            remaining: size,
            backing,
            parent: None,
            closed: false,
            checksum: RunningChecksum::new(),
        }
    }

    /// Wraps a one-shot stream that will yield exactly `size` content bytes.
    pub fn from_reader<R: AsyncRead + Send + Unpin + 'static>(reader: R, size: u64) -> Self {
        Self::from_boxed(Box::new(reader), size)
    }

    pub(crate) fn from_boxed(reader: BoxedReader, size: u64) -> Self {
        Self::with_backing(Backing::Sequential(Some(reader)), 0, size)
    }

    /// Reads the window `[offset, offset + size)` of a random-access source.
    pub fn from_random_access(source: Arc<dyn ReadAt>, offset: u64, size: u64) -> Self {
        Self::with_backing(Backing::RandomAccess(source), offset, size)
    }

    /// In-memory content.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        let size = data.len() as u64;
        Self::from_random_access(Arc::new(data), 0, size)
    }

    /// Describes a filesystem entry without opening it.
    ///
    /// Sets `path`, `filename`, `file.lastModifiedTime`, `file.creationTime`
    /// and a fresh `uuid`. Regular files also get `file.permissions` and
    /// their size; directories get `kind=dir`; symlinks get `kind=link` and
    /// `target`, with absolute targets rewritten relative to the link's
    /// directory when they live under it.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, FlowFileError> {
        let path = path.as_ref();
        let meta = tokio::fs::symlink_metadata(path).await?;

        let full = path.to_string_lossy();
        let (dir, name) = match full.rfind('/') {
            Some(i) => (full[..=i].to_string(), full[i + 1..].to_string()),
            None => ("./".to_string(), full.to_string()),
        };

        let mut attrs = Attributes::new();
        attrs.set(attributes::PATH, dir.clone());
        attrs.set(attributes::FILENAME, name);
        let modified = meta.modified().ok().map(rfc3339);
        if let Some(mt) = &modified {
            attrs.set(attributes::LAST_MODIFIED_TIME, mt.clone());
        }
        if let Some(ct) = meta.created().ok().map(rfc3339).or(modified) {
            attrs.set(attributes::CREATION_TIME, ct);
        }
        attrs.generate_uuid();

        let file_type = meta.file_type();
        let size = if file_type.is_file() {
            attrs.set(attributes::PERMISSIONS, permission_string(&meta));
            meta.len()
        } else if file_type.is_dir() {
            attrs.set(attributes::KIND, "dir");
            0
        } else if file_type.is_symlink() {
            let mut target = tokio::fs::read_link(path).await?;
            if target.is_absolute() {
                let mut cur = PathBuf::from(&dir);
                if cur.is_relative() {
                    cur = std::env::current_dir()?.join(cur);
                }
                if let Ok(rel) = target.strip_prefix(&cur) {
                    target = rel.to_path_buf();
                }
            }
            attrs.set(attributes::KIND, "link");
            attrs.set(attributes::TARGET, target.to_string_lossy());
            0
        } else {
            return Err(FlowFileError::InvalidFile {
                path: full.into_owned(),
                reason: "not a regular file, directory or symlink".into(),
            });
        };

        let backing = Backing::Path {
            path: path.to_path_buf(),
            handle: None,
        };
        Ok(Self::with_backing(backing, 0, size).with_attributes(attrs))
    }

    /// Replaces the attribute set.
    pub fn with_attributes(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    /// Mutable attributes. Changes made after the first read do not affect
    /// checksum selection for the current pass.
    pub fn attrs_mut(&mut self) -> &mut Attributes {
        &mut self.attrs
    }

    /// Declared content length.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Content bytes not yet read in this pass.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Content bytes already read in this pass.
    pub fn position(&self) -> u64 {
        self.position - self.start
    }

    /// `(offset, length)` of the content window within its source.
    pub fn window(&self) -> (u64, u64) {
        (self.start, self.size)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Path on disk, for files created with [`from_path`](Self::from_path).
    pub fn file_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Path { path, .. } => Some(path),
            _ => None,
        }
    }

    /// `true` when the content can be rewound and read again.
    pub fn can_reset(&self) -> bool {
        self.size == 0 || self.can_read_at()
    }

    /// `true` when the content can be read at arbitrary offsets.
    pub fn can_read_at(&self) -> bool {
        !matches!(self.backing, Backing::Sequential(_))
    }

    pub fn checksum_status(&self) -> ChecksumStatus {
        self.checksum.status()
    }

    /// Rewinds to the start of the content window.
    ///
    /// Fails with [`FlowFileError::NotResettable`] for sequential sources.
    /// A closed random-access file becomes readable again.
    pub fn reset(&mut self) -> Result<(), FlowFileError> {
        if self.size != 0 && !self.can_read_at() {
            return Err(FlowFileError::NotResettable);
        }
        self.position = self.start;
        self.remaining = self.size;
        self.closed = false;
        self.checksum.restart();
        Ok(())
    }

    /// Finishes with the content.
    ///
    /// Unread bytes of a sequential source are read and discarded; a path
    /// source releases its file handle. Calling `close` again is a no-op.
    pub async fn close(&mut self) -> Result<(), FlowFileError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let unread = self.remaining;
        self.position = self.position.saturating_add(unread);
        self.remaining = 0;

        match &mut self.backing {
            Backing::Sequential(Some(reader)) if unread > 0 => {
                let mut limited = reader.take(unread);
                let drained = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
                if drained != unread {
                    return Err(FlowFileError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended after skipping {drained} of {unread} bytes"),
                    )));
                }
            }
            Backing::Path { handle, .. } => *handle = None,
            _ => {}
        }
        Ok(())
    }

    /// Checks the digest computed while reading against the `checksum`
    /// attribute.
    ///
    /// Zero-length files always pass.
    pub fn verify(&mut self) -> Result<(), FlowFileError> {
        if self.size == 0 {
            return Ok(());
        }
        let expected = self.attrs.get(attributes::CHECKSUM).map(str::to_owned);
        self.checksum.finish(expected.as_deref())
    }

    /// Starts the running checksum if it has not been started yet.
    pub fn init_checksum(&mut self) {
        if self.checksum.status() == ChecksumStatus::Uninitialized {
            self.checksum.init(&self.attrs);
        }
    }

    /// Loads an unread sequential payload into memory so the file can be
    /// reset. A no-op for random-access and path sources.
    pub async fn buffer(&mut self) -> Result<(), FlowFileError> {
        if self.can_read_at() {
            return Ok(());
        }
        if self.remaining != self.size || self.closed {
            return Err(FlowFileError::InvalidArgument(
                "file already started being read, cannot unread bytes".into(),
            ));
        }

        let mut data = Vec::with_capacity(self.size.min(1 << 20) as usize);
        AsyncReadExt::read_to_end(self, &mut data).await?;

        let parent = match std::mem::replace(&mut self.backing, Backing::Sequential(None)) {
            Backing::Sequential(reader) => reader,
            _ => None,
        };
        self.parent = parent;
        self.backing = Backing::RandomAccess(Arc::new(data));
        self.start = 0;
        self.position = 0;
        self.remaining = self.size;
        self.checksum.restart();
        Ok(())
    }

    /// Reads content at `offset` bytes into the window without moving the
    /// read cursor.
    pub fn read_window_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, FlowFileError> {
        if offset >= self.size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.size - offset) as usize;
        let source = self.random_access_source()?;
        Ok(source.read_at(&mut buf[..want], self.start + offset)?)
    }

    /// Shared handle to the underlying random-access source, opening a
    /// deferred path if needed.
    pub fn random_access_source(&mut self) -> Result<Arc<dyn ReadAt>, FlowFileError> {
        match &mut self.backing {
            Backing::Sequential(_) => Err(FlowFileError::NotSeekable),
            Backing::RandomAccess(source) => Ok(Arc::clone(source)),
            Backing::Path { path, handle } => Ok(Arc::clone(open_handle(path, handle)?)),
        }
    }

    /// Marks the content as consumed without reading it.
    pub(crate) fn exhaust(&mut self) {
        self.position = self.start.saturating_add(self.size);
        self.remaining = 0;
    }

    /// Gives back the stream positioned after this record, if there is one.
    pub(crate) fn into_reader(self) -> Option<BoxedReader> {
        match self.backing {
            Backing::Sequential(reader) => reader,
            _ => self.parent,
        }
    }
}

impl AsyncRead for StreamingFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed || this.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        this.init_checksum();

        let want = (buf.remaining() as u64).min(this.remaining) as usize;
        let filled_before = buf.filled().len();
        let dst = buf.initialize_unfilled_to(want);
        let n = match &mut this.backing {
            Backing::Sequential(Some(reader)) => {
                let mut inner = ReadBuf::new(dst);
                ready!(Pin::new(reader).poll_read(cx, &mut inner))?;
                inner.filled().len()
            }
            Backing::Sequential(None) => {
                return Poll::Ready(Err(io::Error::other("missing underlying reader")));
            }
            Backing::RandomAccess(source) => source.read_at(dst, this.position)?,
            Backing::Path { path, handle } => open_handle(path, handle)?.read_at(dst, this.position)?,
        };

        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "content ended with {} of {} bytes unread",
                    this.remaining, this.size
                ),
            )));
        }

        buf.advance(n);
        this.checksum.update(&buf.filled()[filled_before..]);
        this.remaining -= n as u64;
        this.position += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for StreamingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.backing {
            Backing::Sequential(_) => "sequential",
            Backing::RandomAccess(_) => "random-access",
            Backing::Path { .. } => "path",
        };
        f.debug_struct("StreamingFile")
            .field("attrs", &self.attrs)
            .field("size", &self.size)
            .field("start", &self.start)
            .field("remaining", &self.remaining)
            .field("backing", &backing)
            .field("closed", &self.closed)
            .field("checksum", &self.checksum.status())
            .finish()
    }
}

fn open_handle<'a>(
    path: &Path,
    handle: &'a mut Option<Arc<dyn ReadAt>>,
) -> io::Result<&'a Arc<dyn ReadAt>> {
    if handle.is_none() {
        let file = std::fs::File::open(path)?;
        *handle = Some(Arc::new(file));
    }
    handle
        .as_ref()
        .ok_or_else(|| io::Error::other("file handle unavailable"))
}

fn rfc3339(t: std::time::SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(unix)]
fn permission_string(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let mode = meta.permissions().mode();
    let mut out = String::with_capacity(10);
    out.push('-');
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
fn permission_string(meta: &std::fs::Metadata) -> String {
    if meta.permissions().readonly() {
        "-r--r--r--".into()
    } else {
        "-rw-rw-rw-".into()
    }
}

//! Record framing: attribute header, 8-byte big-endian content length, then
//! exactly that many content bytes.
//!
//! ```text
//! [attribute header]       see crate::attributes
//! [8 bytes BE: content length]
//! [content length bytes: content]
//! ```

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::attributes::Attributes;
use crate::error::FlowFileError;
use crate::file::{BoxedReader, ReadAt, ReadAtCursor, StreamingFile};

/// Appends the attribute header and content length for a record.
pub fn encode_header(attrs: &Attributes, size: u64, out: &mut Vec<u8>) -> Result<(), FlowFileError> {
    attrs.encode(out)?;
    out.extend_from_slice(&size.to_be_bytes());
    Ok(())
}

/// Writes one record. Returns the total number of bytes written.
///
/// A file that has already been partially read is reset first, so this
/// fails with [`FlowFileError::NotResettable`] for a sequential file that
/// is no longer at its start.
pub async fn write_file<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    file: &mut StreamingFile,
) -> Result<u64, FlowFileError> {
    if file.position() != 0 {
        file.reset()?;
    }

    let mut header = Vec::with_capacity(64);
    encode_header(file.attrs(), file.size(), &mut header)?;
    writer.write_all(&header).await?;

    let copied = tokio::io::copy(&mut *file, &mut *writer).await?;
    if copied != file.size() {
        return Err(FlowFileError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("wrote {copied} of {} content bytes", file.size()),
        )));
    }
    trace!(size = file.size(), "wrote flowfile record");
    Ok(header.len() as u64 + copied)
}

/// Writes several records back to back and flushes.
pub async fn write_files<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    files: &mut [StreamingFile],
) -> Result<u64, FlowFileError> {
    let mut total = 0;
    for file in files.iter_mut() {
        total += write_file(writer, file).await?;
    }
    writer.flush().await?;
    Ok(total)
}

/// Decodes the next record header from a one-shot stream.
///
/// Returns `Ok(None)` at a clean end of stream. The returned file owns the
/// stream and reads its content lazily; see [`crate::Scanner`] for reading
/// several records from the same stream.
pub async fn read_file<R: AsyncRead + Send + Unpin + 'static>(
    reader: R,
) -> Result<Option<StreamingFile>, FlowFileError> {
    read_boxed(Box::new(reader)).await
}

pub(crate) async fn read_boxed(mut reader: BoxedReader) -> Result<Option<StreamingFile>, FlowFileError> {
    let Some(attrs) = Attributes::read_from(&mut reader).await? else {
        return Ok(None);
    };
    let size = reader.read_u64().await.map_err(truncated_length)?;
    Ok(Some(StreamingFile::from_boxed(reader, size).with_attributes(attrs)))
}

/// Decodes the record header at `offset` of a random-access source.
///
/// The returned file reads its content directly from `source`, so it can be
/// reset and re-read.
pub async fn read_file_at(
    source: Arc<dyn ReadAt>,
    offset: u64,
) -> Result<Option<StreamingFile>, FlowFileError> {
    let mut cursor = ReadAtCursor::new(Arc::clone(&source), offset);
    let Some(attrs) = Attributes::read_from(&mut cursor).await? else {
        return Ok(None);
    };
    let size = cursor.read_u64().await.map_err(truncated_length)?;
    let start = cursor.position();
    if start.checked_add(size).is_none() {
        return Err(FlowFileError::Malformed("content length overflows source".into()));
    }
    Ok(Some(
        StreamingFile::from_random_access(source, start, size).with_attributes(attrs),
    ))
}

fn truncated_length(err: io::Error) -> FlowFileError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FlowFileError::Malformed("truncated content length".into())
    } else {
        FlowFileError::Io(err)
    }
}

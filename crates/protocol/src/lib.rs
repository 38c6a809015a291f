//! FlowFile v3 records: attributes, streaming content and the wire codec.
//!
//! A FlowFile is an ordered set of string attributes plus an opaque
//! payload. Records are framed back to back on a byte stream and are read
//! lazily: decoding a header does not touch the payload, and the payload
//! of each record is only pulled from the stream when the caller reads it
//! or advances past it.
//!
//! # Wire format
//!
//! See [`attributes`] for the header and [`codec`] for record framing.

pub mod attributes;
pub mod checksum;
pub mod codec;
pub mod custody;
pub mod error;
pub mod file;
pub mod pool;
pub mod scanner;
pub mod segment;

pub use attributes::{Attribute, Attributes};
pub use checksum::{ChecksumAlgorithm, ChecksumEngine, ChecksumStatus};
pub use codec::{encode_header, read_file, read_file_at, write_file, write_files};
pub use custody::{CustodyHop, TlsDetails};
pub use error::FlowFileError;
pub use file::{ReadAt, StreamingFile};
pub use pool::BufferPool;
pub use scanner::{ScanState, Scanner};
pub use segment::{segment, segment_by_size};

/// MIME type of a FlowFile v3 stream.
pub const CONTENT_TYPE: &str = "application/flowfile-v3";

//! Writes received FlowFiles to disk.
//!
//! [`save`] maps the `path`, `filename` and `kind` attributes onto a
//! directory tree under a base directory. Fragments produced by the
//! segmenter are written at their byte offset into a pre-sized target, and
//! a [`Reassembler`] tracks which fragments of each original have landed so
//! the completed file can be checked against the original checksum.

mod reassembly;
mod save;
mod validation;

pub use reassembly::{Reassembler, SaveOutcome};
pub use save::{ReassemblyPolicy, save};
pub use validation::{clean_relative_dir, link_stays_inside};

use std::path::PathBuf;

use flowfile_protocol::FlowFileError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("unknown kind {0:?}")]
    UnknownKind(String),

    #[error("invalid attribute {name}: {value:?}")]
    InvalidAttribute { name: &'static str, value: String },

    #[error("timed out waiting for {path:?} to reach {expected} bytes (found {found})")]
    ReassemblyTimeout {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    FlowFile(#[from] FlowFileError),
}

impl TransferError {
    /// Returns `true` when the content did not match its checksum.
    pub fn is_checksum(&self) -> bool {
        matches!(self, Self::FlowFile(err) if err.is_checksum())
    }
}

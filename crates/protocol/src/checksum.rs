//! Content checksums.
//!
//! Algorithms are looked up by the name carried in the `checksumType`
//! attribute. A [`ChecksumEngine`] stamps digests onto random-access files
//! and verifies reassembled originals; per-file verification of bytes as
//! they stream past lives on [`StreamingFile`] itself.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::digest::DynDigest;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::attributes::{self, Attributes};
use crate::error::FlowFileError;
use crate::file::StreamingFile;
use crate::pool::BufferPool;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 6] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    /// Canonical attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA1",
            Self::Sha224 => "SHA224",
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
        }
    }

    /// A fresh incremental hasher.
    pub fn hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::new(md5::Md5::default()),
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha224 => Box::new(sha2::Sha224::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
            Self::Sha384 => Box::new(sha2::Sha384::default()),
            Self::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    /// Lowercase hex digest of `data`.
    pub fn digest_hex(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = FlowFileError;

    /// Case-insensitive. `SHA` is accepted as SHA-1.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA" | "SHA1" => Ok(Self::Sha1),
            "SHA224" => Ok(Self::Sha224),
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(FlowFileError::UnknownChecksum(s.to_string())),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChecksumAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChecksumAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a file is in its checksum lifecycle.
///
/// ```text
/// Uninitialized ──► Computing ──► Passed | Failed
///        └────────► Unverified
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Nothing has been read yet.
    Uninitialized,
    /// A digest is being accumulated.
    Computing,
    Passed,
    Failed,
    /// No usable `checksumType` was present when reading started.
    Unverified,
}

impl ChecksumStatus {
    pub fn can_transition_to(self, next: ChecksumStatus) -> bool {
        use ChecksumStatus::*;
        matches!(
            (self, next),
            (Uninitialized, Computing)
                | (Uninitialized, Unverified)
                | (Computing, Passed)
                | (Computing, Failed)
        )
    }
}

/// Digest accumulated while a file's content streams past.
pub(crate) struct RunningChecksum {
    status: ChecksumStatus,
    algorithm: Option<ChecksumAlgorithm>,
    hasher: Option<Box<dyn DynDigest + Send>>,
}

impl RunningChecksum {
    pub(crate) fn new() -> Self {
        Self {
            status: ChecksumStatus::Uninitialized,
            algorithm: None,
            hasher: None,
        }
    }

    pub(crate) fn status(&self) -> ChecksumStatus {
        self.status
    }

    fn transition(&mut self, next: ChecksumStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal checksum transition {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
    }

    pub(crate) fn init(&mut self, attrs: &Attributes) {
        if self.status != ChecksumStatus::Uninitialized {
            return;
        }
        match attrs.get(attributes::CHECKSUM_TYPE).map(str::parse::<ChecksumAlgorithm>) {
            Some(Ok(algorithm)) => {
                self.algorithm = Some(algorithm);
                self.hasher = Some(algorithm.hasher());
                self.transition(ChecksumStatus::Computing);
            }
            Some(Err(err)) => {
                debug!(error = %err, "content will not be verified");
                self.transition(ChecksumStatus::Unverified);
            }
            None => self.transition(ChecksumStatus::Unverified),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(data);
        }
    }

    /// Discards accumulated bytes so a re-read starts a clean digest.
    pub(crate) fn restart(&mut self) {
        if self.status == ChecksumStatus::Computing {
            self.hasher = self.algorithm.map(|a| a.hasher());
        }
    }

    pub(crate) fn finish(&mut self, expected: Option<&str>) -> Result<(), FlowFileError> {
        match self.status {
            ChecksumStatus::Uninitialized | ChecksumStatus::Unverified => {
                Err(FlowFileError::ChecksumMissing)
            }
            ChecksumStatus::Passed => Ok(()),
            ChecksumStatus::Failed => Err(FlowFileError::ChecksumMismatch),
            ChecksumStatus::Computing => {
                let digest = self
                    .hasher
                    .take()
                    .map(|h| hex::encode(h.finalize()))
                    .unwrap_or_default();
                match expected {
                    Some(want) if want.trim().eq_ignore_ascii_case(&digest) => {
                        self.transition(ChecksumStatus::Passed);
                        Ok(())
                    }
                    Some(_) => {
                        self.transition(ChecksumStatus::Failed);
                        Err(FlowFileError::ChecksumMismatch)
                    }
                    None => {
                        self.transition(ChecksumStatus::Failed);
                        Err(FlowFileError::ChecksumMissing)
                    }
                }
            }
        }
    }
}

/// Computes digests over whole files using pooled scratch buffers.
#[derive(Debug, Clone, Default)]
pub struct ChecksumEngine {
    pool: BufferPool,
}

impl ChecksumEngine {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Hashes the whole content window of `file` and records the result in
    /// its `checksumType` and `checksum` attributes.
    ///
    /// The read cursor is left where it was. Sequential files are rejected
    /// with [`FlowFileError::NotSeekable`].
    pub fn add_checksum(
        &self,
        file: &mut StreamingFile,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, FlowFileError> {
        if !file.can_read_at() {
            return Err(FlowFileError::NotSeekable);
        }
        let mut buf = self.pool.acquire();
        let result = digest_window(file, algorithm, &mut buf);
        self.pool.release(buf);
        let digest = result?;

        file.attrs_mut()
            .set(attributes::CHECKSUM_TYPE, algorithm.as_str())
            .set(attributes::CHECKSUM, digest.clone());
        Ok(digest)
    }

    /// Hashes a file on disk.
    pub async fn digest_path(
        &self,
        path: &Path,
        algorithm: ChecksumAlgorithm,
    ) -> Result<String, FlowFileError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = algorithm.hasher();
        let mut buf = self.pool.acquire();
        let result = loop {
            match file.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => hasher.update(&buf[..n]),
                Err(e) => break Err(e),
            }
        };
        self.pool.release(buf);
        result?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Checks a reassembled file against the `segment.original.checksum`
    /// carried by any of its fragments.
    pub async fn verify_parent(&self, path: &Path, attrs: &Attributes) -> Result<(), FlowFileError> {
        let (Some(kind), Some(expected)) = (
            attrs.get(attributes::SEGMENT_ORIGINAL_CHECKSUM_TYPE),
            attrs.get(attributes::SEGMENT_ORIGINAL_CHECKSUM),
        ) else {
            return Err(FlowFileError::ChecksumMissing);
        };
        let algorithm: ChecksumAlgorithm = kind.parse()?;
        let digest = self.digest_path(path, algorithm).await?;
        if digest.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(FlowFileError::ChecksumMismatch)
        }
    }
}

fn digest_window(
    file: &mut StreamingFile,
    algorithm: ChecksumAlgorithm,
    buf: &mut [u8],
) -> Result<String, FlowFileError> {
    let mut hasher = algorithm.hasher();
    let size = file.size();
    let mut offset = 0u64;
    while offset < size {
        let want = (size - offset).min(buf.len() as u64) as usize;
        let n = file.read_window_at(&mut buf[..want], offset)?;
        if n == 0 {
            return Err(FlowFileError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended at {offset} of {size} bytes"),
            )));
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flowfile_protocol::{ChecksumStatus, FlowFileError, StreamingFile, attributes};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::TransferError;
use crate::validation::{clean_relative_dir, link_stays_inside};

/// How long a fragment writer waits for its target to be pre-sized by a
/// sibling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReassemblyPolicy {
    /// Size checks before giving up.
    pub poll_attempts: u32,
    /// Delay between size checks, in milliseconds.
    pub poll_delay_ms: u64,
    /// Seconds after its latest fragment that an incomplete original is
    /// forgotten.
    pub pending_ttl_secs: u64,
}

impl Default for ReassemblyPolicy {
    fn default() -> Self {
        Self {
            poll_attempts: 10,
            poll_delay_ms: 3_000,
            pending_ttl_secs: 3_600,
        }
    }
}

impl ReassemblyPolicy {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

/// Writes `file` under `base_dir` and returns the path it was written to.
///
/// The `path` attribute selects the directory (escapes above `base_dir` are
/// rejected) and `kind` selects what is created:
///
/// - `file` or absent: the content, verified against `checksum` when a
///   `checksumType` is present. Fragments are written at `fragment.offset`
///   into a file pre-sized to `segment.original.size`.
/// - `dir`: a directory.
/// - `link`: a relative symlink to `target`, only if it resolves inside the
///   tree. Failing to create the link is logged and ignored.
///
/// `file.lastModifiedTime` is applied to everything but links.
pub async fn save(
    file: &mut StreamingFile,
    base_dir: &Path,
    policy: &ReassemblyPolicy,
) -> Result<PathBuf, TransferError> {
    let rel_dir = clean_relative_dir(file.attrs().get(attributes::PATH).unwrap_or(""))?;
    let dir = base_dir.join(&rel_dir);
    tokio::fs::create_dir_all(&dir).await?;

    let filename = file.attrs().get(attributes::FILENAME).unwrap_or("");
    let filename = filename.rsplit('/').next().unwrap_or("").to_string();
    if filename == ".." {
        return Err(TransferError::InvalidPath(format!(
            "invalid filename: {filename}"
        )));
    }
    let output = dir.join(&filename);
    let kind = file.attrs().get(attributes::KIND).unwrap_or("").to_string();

    match kind.as_str() {
        "" | "file" => {
            if filename.is_empty() || filename == "." {
                return Err(TransferError::InvalidAttribute {
                    name: attributes::FILENAME,
                    value: filename,
                });
            }
            save_regular(file, &output, policy).await?;
        }
        "dir" => tokio::fs::create_dir_all(&output).await?,
        "link" => {
            let target = file.attrs().get(attributes::TARGET).unwrap_or("");
            if link_stays_inside(&rel_dir, target) {
                if let Err(err) = symlink(target, &output).await {
                    warn!(path = %output.display(), target, error = %err, "symlink creation failed");
                }
            } else {
                debug!(path = %output.display(), target, "skipping link that leaves the tree");
            }
        }
        other => return Err(TransferError::UnknownKind(other.to_string())),
    }

    if kind != "link" {
        if let Some(mtime) = file
            .attrs()
            .get(attributes::LAST_MODIFIED_TIME)
            .and_then(parse_time)
        {
            if let Err(err) = set_modified(&output, mtime) {
                debug!(path = %output.display(), error = %err, "could not restore modification time");
            }
        }
    }
    Ok(output)
}

async fn save_regular(
    file: &mut StreamingFile,
    output: &Path,
    policy: &ReassemblyPolicy,
) -> Result<(), TransferError> {
    let Some(parent_size) = file.attrs().get(attributes::SEGMENT_ORIGINAL_SIZE) else {
        let mut fh = tokio::fs::File::create(output).await?;
        tokio::io::copy(&mut *file, &mut fh).await?;
        fh.flush().await?;
        return verify_content(file);
    };

    let parent_size = parse_u64(attributes::SEGMENT_ORIGINAL_SIZE, parent_size)?;
    let offset = parse_u64(
        attributes::FRAGMENT_OFFSET,
        file.attrs().get(attributes::FRAGMENT_OFFSET).unwrap_or(""),
    )?;
    if offset.saturating_add(file.size()) > parent_size {
        return Err(TransferError::InvalidAttribute {
            name: attributes::FRAGMENT_OFFSET,
            value: offset.to_string(),
        });
    }

    presize(output, parent_size).await?;
    wait_for_size(output, parent_size, policy).await?;

    let mut fh = tokio::fs::OpenOptions::new()
        .write(true)
        .open(output)
        .await?;
    let pos = fh.seek(SeekFrom::Start(offset)).await?;
    if pos != offset {
        return Err(TransferError::InvalidPath(format!(
            "could not seek {} to {offset} (at {pos})",
            output.display()
        )));
    }
    tokio::io::copy(&mut *file, &mut fh).await?;
    fh.flush().await?;
    verify_content(file)
}

/// Creates the target at its full size. Losing the creation race to a
/// sibling fragment is fine.
async fn presize(output: &Path, size: u64) -> Result<(), TransferError> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .await
    {
        Ok(fh) => {
            fh.set_len(size).await?;
            debug!(path = %output.display(), size, "pre-sized reassembly target");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn wait_for_size(
    output: &Path,
    size: u64,
    policy: &ReassemblyPolicy,
) -> Result<(), TransferError> {
    let mut found = 0;
    for attempt in 0..=policy.poll_attempts {
        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() >= size => return Ok(()),
            Ok(meta) => found = meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if attempt < policy.poll_attempts {
            debug!(path = %output.display(), found, size, attempt, "waiting for reassembly target");
            tokio::time::sleep(policy.poll_delay()).await;
        }
    }
    Err(TransferError::ReassemblyTimeout {
        path: output.to_path_buf(),
        expected: size,
        found,
    })
}

/// Checks the content checksum when the sender supplied one.
fn verify_content(file: &mut StreamingFile) -> Result<(), TransferError> {
    if file.size() == 0 {
        return Ok(());
    }
    let Some(kind) = file.attrs().get(attributes::CHECKSUM_TYPE).map(str::to_owned) else {
        debug!(size = file.size(), "saved without checksum");
        return Ok(());
    };
    if file.checksum_status() == ChecksumStatus::Unverified {
        return Err(FlowFileError::UnknownChecksum(kind).into());
    }
    file.verify()?;
    Ok(())
}

fn parse_u64(name: &'static str, value: &str) -> Result<u64, TransferError> {
    value
        .trim()
        .parse()
        .map_err(|_| TransferError::InvalidAttribute {
            name,
            value: value.to_string(),
        })
}

fn parse_time(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(SystemTime::from)
}

fn set_modified(path: &Path, mtime: SystemTime) -> std::io::Result<()> {
    let fh = std::fs::File::options().write(!path.is_dir()).read(true).open(path)?;
    fh.set_modified(mtime)
}

#[cfg(unix)]
async fn symlink(target: &str, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &str, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_file(target, link).await
}

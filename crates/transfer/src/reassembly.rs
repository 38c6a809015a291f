use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use flowfile_protocol::{ChecksumEngine, StreamingFile, attributes};
use tracing::{debug, info};

use crate::TransferError;
use crate::save::{ReassemblyPolicy, save};

/// Result of saving one record through a [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// An unsegmented record was written.
    Saved(PathBuf),
    /// A fragment was written; siblings are still outstanding.
    Partial {
        path: PathBuf,
        received: u64,
        expected: u64,
    },
    /// The last fragment landed and the whole file checked out.
    Reassembled(PathBuf),
}

impl SaveOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Saved(path) | Self::Reassembled(path) => path,
            Self::Partial { path, .. } => path,
        }
    }
}

#[derive(Debug)]
struct Progress {
    count: u64,
    seen: HashSet<u64>,
    touched: Instant,
}

/// Saves records under one directory and tracks fragment arrival per
/// `fragment.identifier`.
///
/// Safe to share between concurrent receivers; fragments of one original
/// may arrive on different connections in any order. An original is
/// forgotten when one of its fragments fails to save, or when no fragment
/// of it arrived within [`ReassemblyPolicy::pending_ttl`].
#[derive(Debug)]
pub struct Reassembler {
    base_dir: PathBuf,
    policy: ReassemblyPolicy,
    engine: ChecksumEngine,
    pending: Mutex<HashMap<String, Progress>>,
}

impl Reassembler {
    pub fn new(base_dir: impl Into<PathBuf>, policy: ReassemblyPolicy) -> Self {
        Self {
            base_dir: base_dir.into(),
            policy,
            engine: ChecksumEngine::default(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Uses `engine` for parent checksum verification.
    pub fn with_engine(mut self, engine: ChecksumEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Number of originals with fragments still outstanding.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Saves `file` and, for the final fragment of an original, verifies the
    /// reassembled result against `segment.original.checksum`.
    pub async fn save(&self, file: &mut StreamingFile) -> Result<SaveOutcome, TransferError> {
        let attrs = file.attrs().clone();
        let path = match save(file, &self.base_dir, &self.policy).await {
            Ok(path) => path,
            Err(err) => {
                if let Some(id) = attrs.get(attributes::FRAGMENT_IDENTIFIER) {
                    if self.pending.lock().unwrap().remove(id).is_some() {
                        debug!(id, error = %err, "dropping reassembly after failed fragment");
                    }
                }
                return Err(err);
            }
        };

        let (Some(id), true) = (
            attrs.get(attributes::FRAGMENT_IDENTIFIER),
            attrs.contains(attributes::SEGMENT_ORIGINAL_SIZE),
        ) else {
            return Ok(SaveOutcome::Saved(path));
        };
        let index = parse_count(attributes::FRAGMENT_INDEX, attrs.get(attributes::FRAGMENT_INDEX))?;
        let count = parse_count(attributes::FRAGMENT_COUNT, attrs.get(attributes::FRAGMENT_COUNT))?;

        let received = {
            let mut pending = self.pending.lock().unwrap();
            let ttl = self.policy.pending_ttl();
            pending.retain(|other, progress| {
                let keep = other == id || progress.touched.elapsed() <= ttl;
                if !keep {
                    debug!(id = %other, received = progress.seen.len(), "forgetting stale reassembly");
                }
                keep
            });
            let progress = pending.entry(id.to_string()).or_insert_with(|| Progress {
                count,
                seen: HashSet::new(),
                touched: Instant::now(),
            });
            progress.seen.insert(index);
            progress.touched = Instant::now();
            let received = progress.seen.len() as u64;
            if received >= progress.count {
                pending.remove(id);
            }
            received
        };

        if received < count {
            debug!(id, index, received, count, "fragment saved");
            return Ok(SaveOutcome::Partial {
                path,
                received,
                expected: count,
            });
        }

        if attrs.contains(attributes::SEGMENT_ORIGINAL_CHECKSUM) {
            self.engine.verify_parent(&path, &attrs).await?;
            info!(id, path = %path.display(), count, "reassembled file verified");
        } else {
            info!(id, path = %path.display(), count, "reassembled file has no original checksum");
        }
        Ok(SaveOutcome::Reassembled(path))
    }
}

fn parse_count(name: &'static str, value: Option<&str>) -> Result<u64, TransferError> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| TransferError::InvalidAttribute {
            name,
            value: value.unwrap_or_default().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use flowfile_protocol::{ChecksumAlgorithm, segment_by_size};

    use super::*;

    fn quick() -> ReassemblyPolicy {
        ReassemblyPolicy {
            poll_attempts: 2,
            poll_delay_ms: 5,
            ..ReassemblyPolicy::default()
        }
    }

    fn original(content: &[u8]) -> StreamingFile {
        let mut file = StreamingFile::from_bytes(content.to_vec());
        file.attrs_mut()
            .set(attributes::PATH, "./nested/")
            .set(attributes::FILENAME, "movie.bin");
        file
    }

    #[tokio::test]
    async fn plain_records_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let reassembler = Reassembler::new(dir.path(), quick());
        let outcome = reassembler.save(&mut original(b"abc")).await.unwrap();
        assert_eq!(outcome, SaveOutcome::Saved(dir.path().join("nested/movie.bin")));
    }

    #[tokio::test]
    async fn last_fragment_triggers_parent_verification() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut whole = original(&data);
        ChecksumEngine::default()
            .add_checksum(&mut whole, ChecksumAlgorithm::Sha256)
            .unwrap();
        let mut fragments = segment_by_size(&mut whole, 1024).unwrap();
        assert_eq!(fragments.len(), 5);
        fragments.swap(0, 3);

        let reassembler = Reassembler::new(dir.path(), quick());
        let mut outcomes = Vec::new();
        for fragment in fragments.iter_mut() {
            outcomes.push(reassembler.save(fragment).await.unwrap());
        }

        for (i, outcome) in outcomes[..4].iter().enumerate() {
            assert!(
                matches!(outcome, SaveOutcome::Partial { received, expected: 5, .. } if *received == i as u64 + 1),
                "{outcome:?}"
            );
        }
        assert!(matches!(outcomes[4], SaveOutcome::Reassembled(_)));
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(std::fs::read(outcomes[4].path()).unwrap(), data);
    }

    #[tokio::test]
    async fn corrupted_reassembly_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut whole = original(b"0123456789");
        whole
            .attrs_mut()
            .set(attributes::CHECKSUM_TYPE, "MD5")
            .set(attributes::CHECKSUM, ChecksumAlgorithm::Md5.digest_hex(b"something else"));
        let mut fragments = segment_by_size(&mut whole, 4).unwrap();

        let reassembler = Reassembler::new(dir.path(), quick());
        let mut last = None;
        for fragment in fragments.iter_mut() {
            last = Some(reassembler.save(fragment).await);
        }
        let err = last.unwrap().unwrap_err();
        assert!(err.is_checksum());
    }

    #[tokio::test]
    async fn duplicate_fragments_do_not_complete_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut whole = original(b"abcdefgh");
        let mut fragments = segment_by_size(&mut whole, 4).unwrap();
        let reassembler = Reassembler::new(dir.path(), quick());

        fragments[0].reset().unwrap();
        reassembler.save(&mut fragments[0]).await.unwrap();
        fragments[0].reset().unwrap();
        let again = reassembler.save(&mut fragments[0]).await.unwrap();
        assert!(matches!(again, SaveOutcome::Partial { received: 1, .. }));
        assert_eq!(reassembler.pending(), 1);
    }

    #[tokio::test]
    async fn failed_fragment_forgets_original() {
        let dir = tempfile::tempdir().unwrap();
        let mut whole = original(b"abcdefghijkl");
        let mut fragments = segment_by_size(&mut whole, 4).unwrap();
        let reassembler = Reassembler::new(dir.path(), quick());

        reassembler.save(&mut fragments[0]).await.unwrap();
        assert_eq!(reassembler.pending(), 1);

        fragments[1]
            .attrs_mut()
            .set(attributes::FRAGMENT_OFFSET, "not-a-number");
        assert!(reassembler.save(&mut fragments[1]).await.is_err());
        assert_eq!(reassembler.pending(), 0);
    }

    #[tokio::test]
    async fn stale_originals_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let reassembler = Reassembler::new(
            dir.path(),
            ReassemblyPolicy {
                pending_ttl_secs: 0,
                ..quick()
            },
        );

        let mut first = original(b"abcdefgh");
        let mut first = segment_by_size(&mut first, 4).unwrap();
        reassembler.save(&mut first[0]).await.unwrap();
        assert_eq!(reassembler.pending(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let mut second = original(b"12345678");
        second.attrs_mut().set(attributes::FILENAME, "other.bin");
        let mut second = segment_by_size(&mut second, 4).unwrap();
        reassembler.save(&mut second[0]).await.unwrap();
        assert_eq!(reassembler.pending(), 1);
    }
}

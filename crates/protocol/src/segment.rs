//! Splitting a random-access file into fragments.
//!
//! Fragments share the parent's source and each reads its own window of
//! it. They carry enough attributes for the receiver to put the original
//! back together:
//!
//! | attribute                        | value                                 |
//! |----------------------------------|---------------------------------------|
//! | `fragment.identifier`            | the original's `uuid`                 |
//! | `fragment.offset`                | byte offset of the fragment           |
//! | `fragment.index`                 | 1-based position                      |
//! | `fragment.count`                 | number of fragments                   |
//! | `segment.original.size`          | the original's size                   |
//! | `segment.original.filename`      | the original's `filename`             |
//! | `segment.original.checksum[Type]`| the original's checksum, if it had one |

use std::sync::Arc;

use tracing::debug;

use crate::attributes;
use crate::error::FlowFileError;
use crate::file::StreamingFile;

/// Splits `file` into fragments of at most `segment_size` bytes.
///
/// A file that already fits is returned as a single file with its
/// attributes untouched. The original is left exhausted either way.
pub fn segment_by_size(
    file: &mut StreamingFile,
    segment_size: u64,
) -> Result<Vec<StreamingFile>, FlowFileError> {
    if segment_size == 0 {
        return Err(FlowFileError::InvalidArgument(
            "segment size must be greater than zero".into(),
        ));
    }
    let source = file.random_access_source()?;
    let (start, size) = file.window();

    if size <= segment_size {
        let whole = StreamingFile::from_random_access(source, start, size)
            .with_attributes(file.attrs().clone());
        file.exhaust();
        return Ok(vec![whole]);
    }

    let parent_id = match file.attrs().get(attributes::UUID) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => file.attrs_mut().generate_uuid(),
    };

    let original = file.attrs();
    let mut template = original.clone();
    template
        .set(attributes::FRAGMENT_IDENTIFIER, parent_id.as_str())
        .set(attributes::SEGMENT_ORIGINAL_SIZE, size.to_string());
    if let Some(name) = original.get(attributes::FILENAME) {
        template.set(attributes::SEGMENT_ORIGINAL_FILENAME, name);
    }
    if let (Some(kind), Some(sum)) = (
        original.get(attributes::CHECKSUM_TYPE),
        original.get(attributes::CHECKSUM),
    ) {
        template
            .set(attributes::SEGMENT_ORIGINAL_CHECKSUM_TYPE, kind)
            .set(attributes::SEGMENT_ORIGINAL_CHECKSUM, sum);
    }
    template.unset(attributes::CHECKSUM);
    template.unset(attributes::CHECKSUM_TYPE);

    let count = size.div_ceil(segment_size);
    let fragments: Vec<StreamingFile> = (0..count)
        .map(|i| {
            let offset = i * segment_size;
            let len = segment_size.min(size - offset);
            let mut attrs = template.clone();
            attrs.generate_uuid();
            attrs
                .set(attributes::FRAGMENT_OFFSET, offset.to_string())
                .set(attributes::FRAGMENT_INDEX, (i + 1).to_string())
                .set(attributes::FRAGMENT_COUNT, count.to_string());
            StreamingFile::from_random_access(Arc::clone(&source), start + offset, len)
                .with_attributes(attrs)
        })
        .collect();

    debug!(parent = %parent_id, size, count, "segmented flowfile");
    file.exhaust();
    Ok(fragments)
}

/// Splits `file` into `count` fragments of near-equal size.
pub fn segment(file: &mut StreamingFile, count: u64) -> Result<Vec<StreamingFile>, FlowFileError> {
    if count == 0 {
        return Err(FlowFileError::InvalidArgument(
            "segment count must be greater than zero".into(),
        ));
    }
    let segment_size = file.size().div_ceil(count).max(1);
    segment_by_size(file, segment_size)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::checksum::{ChecksumAlgorithm, ChecksumEngine};
    use crate::file::ReadAt;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn ten_megabytes_in_three_megabyte_pieces() {
        const MB: u64 = 1024 * 1024;
        let source: Arc<dyn ReadAt> = Arc::new(vec![0u8; (10 * MB) as usize]);
        let mut file = StreamingFile::from_random_access(source, 0, 10 * MB);
        file.attrs_mut()
            .set(attributes::FILENAME, "big.bin")
            .set(attributes::UUID, "parent-id");

        let fragments = segment_by_size(&mut file, 3 * MB).unwrap();
        let windows: Vec<(u64, u64)> = fragments.iter().map(StreamingFile::window).collect();
        assert_eq!(
            windows,
            vec![
                (0, 3_145_728),
                (3_145_728, 3_145_728),
                (6_291_456, 3_145_728),
                (9_437_184, 1_048_576),
            ]
        );
        for (i, fragment) in fragments.iter().enumerate() {
            let attrs = fragment.attrs();
            assert_eq!(attrs.get(attributes::FRAGMENT_IDENTIFIER), Some("parent-id"));
            assert_eq!(attrs.get(attributes::FRAGMENT_COUNT), Some("4"));
            assert_eq!(attrs.get(attributes::FRAGMENT_INDEX), Some((i + 1).to_string().as_str()));
            assert_eq!(attrs.get(attributes::SEGMENT_ORIGINAL_SIZE), Some("10485760"));
            assert_eq!(attrs.get(attributes::SEGMENT_ORIGINAL_FILENAME), Some("big.bin"));
            assert_ne!(attrs.get(attributes::UUID), Some("parent-id"));
        }
        assert_eq!(file.remaining(), 0);
    }

    #[tokio::test]
    async fn fragments_tile_the_original() {
        let data = patterned(10_007);
        for segment_size in [1u64, 7, 1000, 4096, 10_006, 10_007, 50_000] {
            let mut file = StreamingFile::from_bytes(data.clone());
            let mut fragments = segment_by_size(&mut file, segment_size).unwrap();

            let mut expected_offset = 0;
            let mut rebuilt = Vec::new();
            for fragment in fragments.iter_mut() {
                let (offset, len) = fragment.window();
                assert_eq!(offset, expected_offset);
                assert!(len > 0 && len <= segment_size);
                expected_offset += len;
                fragment.read_to_end(&mut rebuilt).await.unwrap();
            }
            assert_eq!(expected_offset, data.len() as u64);
            assert_eq!(rebuilt, data, "segment size {segment_size}");
        }
    }

    #[test]
    fn small_file_passes_through_unchanged() {
        let mut file = StreamingFile::from_bytes(b"tiny".to_vec());
        file.attrs_mut().set(attributes::FILENAME, "t.txt");
        let original = file.attrs().clone();

        let fragments = segment_by_size(&mut file, 4).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].attrs(), &original);
        assert!(!fragments[0].attrs().contains(attributes::FRAGMENT_INDEX));
    }

    #[test]
    fn original_checksum_moves_to_segment_attributes() {
        let engine = ChecksumEngine::default();
        let mut file = StreamingFile::from_bytes(patterned(100));
        let digest = engine.add_checksum(&mut file, ChecksumAlgorithm::Sha256).unwrap();

        let fragments = segment_by_size(&mut file, 30).unwrap();
        assert_eq!(fragments.len(), 4);
        for fragment in &fragments {
            let attrs = fragment.attrs();
            assert!(!attrs.contains(attributes::CHECKSUM));
            assert!(!attrs.contains(attributes::CHECKSUM_TYPE));
            assert_eq!(attrs.get(attributes::SEGMENT_ORIGINAL_CHECKSUM), Some(digest.as_str()));
            assert_eq!(attrs.get(attributes::SEGMENT_ORIGINAL_CHECKSUM_TYPE), Some("SHA256"));
        }
    }

    #[test]
    fn missing_uuid_is_generated() {
        let mut file = StreamingFile::from_bytes(patterned(10));
        let fragments = segment_by_size(&mut file, 3).unwrap();
        let parent = file.attrs().get(attributes::UUID).unwrap().to_string();
        assert!(fragments
            .iter()
            .all(|f| f.attrs().get(attributes::FRAGMENT_IDENTIFIER) == Some(parent.as_str())));
    }

    #[test]
    fn zero_segment_size_is_rejected() {
        let mut file = StreamingFile::from_bytes(patterned(10));
        assert!(matches!(
            segment_by_size(&mut file, 0),
            Err(FlowFileError::InvalidArgument(_))
        ));
        assert!(segment(&mut file, 0).is_err());
    }

    #[test]
    fn sequential_files_cannot_be_segmented() {
        let mut file = StreamingFile::from_reader(std::io::Cursor::new(patterned(10)), 10);
        assert!(matches!(
            segment_by_size(&mut file, 3),
            Err(FlowFileError::NotSeekable)
        ));
    }

    #[test]
    fn segment_by_count() {
        let mut file = StreamingFile::from_bytes(patterned(10));
        let fragments = segment(&mut file, 3).unwrap();
        let lens: Vec<u64> = fragments.iter().map(|f| f.size()).collect();
        assert_eq!(lens, vec![4u64, 4, 2]);
    }
}

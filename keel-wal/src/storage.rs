//! Storage-directory layout.
//!
//! Segment files are named `log-<start>-<end>` (sealed) or
//! `log-<start>-inprogress` (open tail). Indices are zero-padded 20-digit
//! decimal so lexicographic order equals numeric order.

use std::path::{Path, PathBuf};

use keel_core::{KeelError, Result};
use tracing::warn;

const SEGMENT_PREFIX: &str = "log-";
const INPROGRESS_SUFFIX: &str = "inprogress";

#[must_use]
pub(crate) fn open_segment_name(start: u64) -> String {
    format!("log-{start:020}-{INPROGRESS_SUFFIX}")
}

#[must_use]
pub(crate) fn sealed_segment_name(start: u64, end: u64) -> String {
    format!("log-{start:020}-{end:020}")
}

/// A segment file discovered in the storage directory. `end` is `None` for
/// the in-progress file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentFile {
    pub path: PathBuf,
    pub start: u64,
    pub end: Option<u64>,
}

/// Parse a file name against the segment grammar.
///
/// Returns `Ok(None)` for names outside the `log-` namespace (the directory
/// may hold unrelated state files); a malformed `log-*` name is an error.
pub(crate) fn parse_segment_name(name: &str) -> Result<Option<(u64, Option<u64>)>> {
    let Some(rest) = name.strip_prefix(SEGMENT_PREFIX) else {
        return Ok(None);
    };
    let malformed = || KeelError::CorruptDirectory(format!("malformed segment file name: {name}"));

    let (start_str, end_str) = rest.split_once('-').ok_or_else(malformed)?;
    let start: u64 = start_str.parse().map_err(|_| malformed())?;

    if end_str == INPROGRESS_SUFFIX {
        return Ok(Some((start, None)));
    }
    let end: u64 = end_str.parse().map_err(|_| malformed())?;
    if end < start {
        return Err(malformed());
    }
    Ok(Some((start, Some(end))))
}

/// Enumerate and validate the segment files in `dir`.
///
/// The returned list is sorted by start index and satisfies the directory
/// invariants: no duplicate or overlapping ranges, no gaps between adjacent
/// segments, and at most one in-progress file, which must hold the largest
/// start index.
pub(crate) fn scan_storage_dir(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut files = Vec::new();

    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match parse_segment_name(name)? {
            Some((start, end)) => files.push(SegmentFile { path, start, end }),
            None => {
                warn!(
                    target: "keel::storage",
                    file = name,
                    "Ignoring non-segment file in storage directory"
                );
            }
        }
    }

    files.sort_by_key(|f| f.start);

    for pair in files.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let Some(prev_end) = prev.end else {
            return Err(KeelError::CorruptDirectory(format!(
                "in-progress segment at start {} is not the last segment",
                prev.start
            )));
        };
        if next.start == prev.start {
            return Err(KeelError::CorruptDirectory(format!(
                "duplicate segment start index {}",
                next.start
            )));
        }
        if next.start <= prev_end {
            return Err(KeelError::CorruptDirectory(format!(
                "segments [{}-{}] and [{}-..] overlap",
                prev.start, prev_end, next.start
            )));
        }
        if next.start != prev_end + 1 {
            return Err(KeelError::CorruptDirectory(format!(
                "gap between segment end {} and next start {}",
                prev_end, next.start
            )));
        }
    }

    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_name_roundtrip() {
        assert_eq!(
            parse_segment_name(&open_segment_name(7)).unwrap(),
            Some((7, None))
        );
        assert_eq!(
            parse_segment_name(&sealed_segment_name(0, 99)).unwrap(),
            Some((0, Some(99)))
        );
    }

    #[test]
    fn test_fixed_width_names_sort_lexicographically() {
        let mut names = vec![
            sealed_segment_name(100, 199),
            sealed_segment_name(0, 99),
            sealed_segment_name(200, 250),
        ];
        names.sort();
        assert_eq!(names[0], sealed_segment_name(0, 99));
        assert_eq!(names[2], sealed_segment_name(200, 250));
    }

    #[test]
    fn test_foreign_names_ignored() {
        assert_eq!(parse_segment_name("raft.meta").unwrap(), None);
        assert_eq!(parse_segment_name("snapshot-00001").unwrap(), None);
    }

    #[test]
    fn test_malformed_log_names_rejected() {
        for name in ["log-abc-inprogress", "log-12", "log-5-x", "log-9-3"] {
            assert!(parse_segment_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn test_scan_orders_and_validates() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(sealed_segment_name(5, 9)), b"").unwrap();
        std::fs::write(dir.path().join(sealed_segment_name(0, 4)), b"").unwrap();
        std::fs::write(dir.path().join(open_segment_name(10)), b"").unwrap();
        std::fs::write(dir.path().join("node.state"), b"").unwrap();

        let files = scan_storage_dir(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].start, 0);
        assert_eq!(files[1].start, 5);
        assert_eq!(files[2].end, None);
    }

    #[test]
    fn test_scan_rejects_gap() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(sealed_segment_name(0, 4)), b"").unwrap();
        std::fs::write(dir.path().join(sealed_segment_name(6, 9)), b"").unwrap();
        assert!(matches!(
            scan_storage_dir(dir.path()),
            Err(KeelError::CorruptDirectory(_))
        ));
    }

    #[test]
    fn test_scan_rejects_overlap() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(sealed_segment_name(0, 4)), b"").unwrap();
        std::fs::write(dir.path().join(sealed_segment_name(3, 9)), b"").unwrap();
        assert!(matches!(
            scan_storage_dir(dir.path()),
            Err(KeelError::CorruptDirectory(_))
        ));
    }

    #[test]
    fn test_scan_rejects_inprogress_not_last() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(open_segment_name(0)), b"").unwrap();
        std::fs::write(dir.path().join(sealed_segment_name(1, 4)), b"").unwrap();
        assert!(matches!(
            scan_storage_dir(dir.path()),
            Err(KeelError::CorruptDirectory(_))
        ));
    }

    #[test]
    fn test_scan_rejects_two_inprogress() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(open_segment_name(0)), b"").unwrap();
        std::fs::write(dir.path().join(open_segment_name(5)), b"").unwrap();
        assert!(matches!(
            scan_storage_dir(dir.path()),
            Err(KeelError::CorruptDirectory(_))
        ));
    }
}

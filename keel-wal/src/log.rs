//! The `SegmentedLog` coordinator: an ordered collection of segments
//! exposing the full log surface to the consensus layer.
//!
//! Single-writer, multi-reader. The consensus module guards the log with
//! its own lock; no two mutators ever run concurrently on one log, and
//! readers do not run concurrently with mutators. `append` may block on a
//! filesystem write or fsync.

use std::path::{Path, PathBuf};
use std::time::Instant;

use keel_core::{KeelError, Result, SEGMENT_MAGIC};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::codec::{frame_size, LogEntry};
use crate::config::{LogConfig, SyncPolicy};
use crate::segment::LogSegment;
use crate::storage::scan_storage_dir;

#[derive(Debug)]
pub struct SegmentedLog {
    dir: PathBuf,
    config: LogConfig,
    /// Ordered by start index; only the last segment may be open.
    segments: Vec<LogSegment>,
    closed: bool,
    /// Frames appended since the last fsync (batch sync mode).
    unsynced_frames: usize,
    last_sync: Instant,
}

impl SegmentedLog {
    /// Open a log in `dir`, creating the directory if missing and replaying
    /// any segment files found there.
    ///
    /// Sealed segments replay in parallel; the in-progress tail replays
    /// last and sequentially, because only it may rewrite its file while
    /// discarding a torn tail write.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self> {
        let dir = dir.into();
        if config.segment_max_bytes <= SEGMENT_MAGIC.len() as u64 {
            return Err(KeelError::Config(format!(
                "segment_max_bytes {} leaves no room for entries",
                config.segment_max_bytes
            )));
        }
        std::fs::create_dir_all(&dir)?;

        let mut files = scan_storage_dir(&dir)?;
        let has_open = files.last().is_some_and(|f| f.end.is_none());
        let open_file = if has_open { files.pop() } else { None };

        let mut segments = files
            .par_iter()
            .map(|f| LogSegment::load(&f.path, f.start, f.end))
            .collect::<Result<Vec<_>>>()?;
        if let Some(f) = open_file {
            segments.push(LogSegment::load(&f.path, f.start, None)?);
        }

        verify_loaded(&segments)?;

        let log = Self {
            dir,
            config,
            segments,
            closed: false,
            unsynced_frames: 0,
            last_sync: Instant::now(),
        };
        info!(
            target: "keel::log",
            dir = %log.dir.display(),
            segments = log.segments.len(),
            last_index = log.last_index(),
            "Opened segmented log"
        );
        Ok(log)
    }

    /// Append one entry. Its index must continue the log exactly; the open
    /// tail is created or rolled as needed, and the configured sync policy
    /// decides when the frame becomes durable.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if self.closed {
            return Err(KeelError::Closed);
        }
        if let Some(expected) = self.expected_next_index() {
            if entry.index != expected {
                return Err(KeelError::IndexGap {
                    expected,
                    actual: entry.index,
                });
            }
        }

        let frame_len = frame_size(&entry);
        let max_bytes = self.config.segment_max_bytes;

        // Seal before the bound would be crossed, never after.
        let roll = self.segments.last().is_some_and(|tail| {
            tail.is_open() && tail.num_entries() > 0 && tail.would_overfill(frame_len, max_bytes)
        });
        if roll {
            if let Some(tail) = self.segments.last_mut() {
                tail.close()?;
            }
            // close() fsynced everything that was pending.
            self.unsynced_frames = 0;
            self.last_sync = Instant::now();
            info!(target: "keel::log", next_start = entry.index, "Rolled segment");
        }

        if !self.segments.last().is_some_and(LogSegment::is_open) {
            let segment = LogSegment::new_open(&self.dir, entry.index)?;
            self.segments.push(segment);
        }

        let Some(tail) = self.segments.last_mut() else {
            return Err(KeelError::NotOpen);
        };
        tail.append(std::slice::from_ref(&entry))?;

        match self.config.sync {
            SyncPolicy::Always => {
                if let Some(tail) = self.segments.last_mut() {
                    tail.sync()?;
                }
                self.unsynced_frames = 0;
                self.last_sync = Instant::now();
            }
            SyncPolicy::Batch { entries, interval } => {
                if let Some(tail) = self.segments.last_mut() {
                    tail.flush_buffer()?;
                }
                self.unsynced_frames += 1;
                if self.unsynced_frames >= entries || self.last_sync.elapsed() >= interval {
                    self.flush()?;
                }
            }
        }

        debug!(
            target: "keel::log",
            index = entry.index,
            term = entry.term,
            "Appended entry"
        );
        Ok(())
    }

    /// Read one entry. `None` outside the retained range. Memory-only.
    #[must_use]
    pub fn get(&self, index: u64) -> Option<LogEntry> {
        self.segment_for(index)?.get(index).cloned()
    }

    /// Single-pass iterator over `[from, to]` inclusive. A missing index
    /// ends the sequence early.
    #[must_use]
    pub fn get_range(&self, from: u64, to: u64) -> LogReader<'_> {
        LogReader {
            log: self,
            next: from,
            last: to,
            done: false,
        }
    }

    /// Drop every entry with `index >= from_index`. Segments entirely above
    /// the cut are deleted; the segment containing it is truncated in place
    /// and re-opened as the tail, so the next append (at `from_index`)
    /// proceeds immediately.
    pub fn truncate(&mut self, from_index: u64) -> Result<()> {
        if self.closed {
            return Err(KeelError::Closed);
        }
        let Some(first) = self.first_index() else {
            return Ok(());
        };
        if from_index < first {
            return Err(KeelError::OutOfRange {
                index: from_index,
                first_index: first,
            });
        }
        let next = self.last_index() + 1;
        if (from_index as i64) > next {
            return Err(KeelError::IndexGap {
                expected: next as u64,
                actual: from_index,
            });
        }
        if (from_index as i64) == next {
            return Ok(());
        }

        // Segments strictly after the one containing from_index are dropped
        // whole, file and all.
        let pos = self.segments.partition_point(|s| s.start_index() <= from_index);
        for seg in self.segments.split_off(pos) {
            seg.delete()?;
        }
        let Some(mut seg) = self.segments.pop() else {
            return Err(KeelError::CorruptDirectory(
                "no segment contains the truncation point".into(),
            ));
        };
        if from_index == seg.start_index() {
            // Nothing of the segment survives; a zero-entry file is never
            // left behind.
            seg.delete()?;
            let fresh = LogSegment::new_open(&self.dir, from_index)?;
            self.segments.push(fresh);
        } else {
            seg.truncate(from_index)?;
            self.segments.push(seg.reopen()?);
        }

        self.unsynced_frames = 0;
        self.last_sync = Instant::now();

        info!(
            target: "keel::log",
            from_index,
            last_index = self.last_index(),
            "Truncated log"
        );
        Ok(())
    }

    /// Delete sealed segments whose whole range lies at or below
    /// `through_index`. File-granular: a segment holding any entry above
    /// the watermark is kept, and the tail segment always survives.
    /// Returns the number of segments deleted.
    pub fn purge(&mut self, through_index: u64) -> Result<usize> {
        if self.closed {
            return Err(KeelError::Closed);
        }
        let mut removed = 0;
        while self.segments.len() > 1 {
            let deletable = self.segments.first().is_some_and(|seg| {
                !seg.is_open() && seg.end_index().is_some_and(|end| end <= through_index)
            });
            if !deletable {
                break;
            }
            let seg = self.segments.remove(0);
            seg.delete()?;
            removed += 1;
        }
        if removed > 0 {
            info!(
                target: "keel::log",
                through_index,
                removed,
                first_index = ?self.first_index(),
                "Purged segments below watermark"
            );
        }
        Ok(removed)
    }

    /// Index of the last entry, or −1 when the log holds none.
    #[must_use]
    pub fn last_index(&self) -> i64 {
        for seg in self.segments.iter().rev() {
            if let Some(end) = seg.end_index() {
                return end as i64;
            }
        }
        match self.segments.first() {
            Some(seg) => seg.start_index() as i64 - 1,
            None => -1,
        }
    }

    /// Term of the last entry, or 0 when the log holds none.
    #[must_use]
    pub fn last_term(&self) -> u64 {
        self.segments
            .iter()
            .rev()
            .find_map(LogSegment::last_record)
            .map_or(0, |r| r.entry.term)
    }

    /// Start index of the first retained segment.
    #[must_use]
    pub fn first_index(&self) -> Option<u64> {
        self.segments.first().map(LogSegment::start_index)
    }

    /// Force everything appended so far to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(tail) = self.segments.last_mut() {
            tail.sync()?;
        }
        self.unsynced_frames = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Flush, release file handles and refuse further mutation. The tail
    /// file stays in-progress on disk so a later `open` resumes appending.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for seg in &mut self.segments {
            seg.release_writer()?;
        }
        self.closed = true;
        info!(
            target: "keel::log",
            dir = %self.dir.display(),
            last_index = self.last_index(),
            "Closed segmented log"
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    #[must_use]
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Index the next append must carry, or `None` when the log is free to
    /// start anywhere (nothing stored yet).
    fn expected_next_index(&self) -> Option<u64> {
        match self.segments.last() {
            None => None,
            Some(tail) if tail.is_open() => Some(tail.next_index()),
            Some(tail) => tail.end_index().map(|e| e + 1),
        }
    }

    /// Binary search for the segment covering `index`.
    fn segment_for(&self, index: u64) -> Option<&LogSegment> {
        let pos = self.segments.partition_point(|s| s.start_index() <= index);
        let seg = self.segments.get(pos.checked_sub(1)?)?;
        if seg.end_index().is_some_and(|end| index <= end) {
            Some(seg)
        } else {
            None
        }
    }
}

fn verify_loaded(segments: &[LogSegment]) -> Result<()> {
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_open() && i + 1 != segments.len() {
            return Err(KeelError::CorruptDirectory(format!(
                "open segment at start {} is not the tail",
                seg.start_index()
            )));
        }
    }
    for pair in segments.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let Some(prev_end) = prev.end_index() else {
            return Err(KeelError::CorruptDirectory(format!(
                "empty segment at start {} precedes start {}",
                prev.start_index(),
                next.start_index()
            )));
        };
        if next.start_index() != prev_end + 1 {
            return Err(KeelError::CorruptDirectory(format!(
                "segment starting at {} does not continue previous end {}",
                next.start_index(),
                prev_end
            )));
        }
    }
    Ok(())
}

/// Lazy, single-pass view over a contiguous index range. Not restartable.
pub struct LogReader<'a> {
    log: &'a SegmentedLog,
    next: u64,
    last: u64,
    done: bool,
}

impl Iterator for LogReader<'_> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        if self.done || self.next > self.last {
            return None;
        }
        match self.log.get(self.next) {
            Some(entry) => {
                self.next += 1;
                Some(entry)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

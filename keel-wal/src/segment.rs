//! One contiguous range of log entries, mirroring exactly one file on disk.
//!
//! A `LogSegment` caches every entry it holds in memory, so reads never
//! touch the file after load. The open tail segment owns a buffered write
//! handle; sealing or truncating releases it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use keel_core::{KeelError, Result, SEGMENT_MAGIC};
use tracing::{debug, info, warn};

use crate::codec::{decode_frame, encode_frame, frame_size, LogEntry};
use crate::storage::{open_segment_name, sealed_segment_name};

/// An entry plus the absolute file offset at which its frame begins.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub offset: u64,
    pub entry: LogEntry,
}

#[derive(Debug)]
pub struct LogSegment {
    path: PathBuf,
    start_index: u64,
    /// Dense: `records[i]` holds the entry with index `start_index + i`.
    records: Vec<LogRecord>,
    /// File size this segment corresponds to, header included. Bytes still
    /// sitting in the write buffer count; the file catches up on flush.
    total_size: u64,
    is_open: bool,
    writer: Option<BufWriter<File>>,
}

impl LogSegment {
    /// Create an empty open segment backed by a fresh
    /// `log-<start>-inprogress` file.
    pub fn new_open(dir: &Path, start: u64) -> Result<Self> {
        let path = dir.join(open_segment_name(start));
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        file.write_all(&SEGMENT_MAGIC)?;
        file.sync_data()?;

        info!(
            target: "keel::segment",
            path = %path.display(),
            start,
            "Created open segment"
        );

        Ok(Self {
            path,
            start_index: start,
            records: Vec::new(),
            total_size: SEGMENT_MAGIC.len() as u64,
            is_open: true,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Replay a segment file. `end` is the declared last index for a sealed
    /// file, `None` for the in-progress tail.
    ///
    /// A decode failure in the tail of an in-progress file is a torn write:
    /// the parsed prefix is kept and the file is truncated to it. The same
    /// failure in a sealed file is fatal — sealed files are never partially
    /// valid.
    pub fn load(path: &Path, start: u64, end: Option<u64>) -> Result<Self> {
        let is_open = end.is_none();
        let data = fs::read(path)?;
        let header_len = SEGMENT_MAGIC.len() as u64;

        if data.len() < SEGMENT_MAGIC.len() {
            if !is_open {
                return Err(KeelError::CorruptSegment(format!(
                    "{}: file shorter than the segment header",
                    path.display()
                )));
            }
            // A crash can leave an in-progress file without a complete
            // header; reset it.
            warn!(
                target: "keel::segment",
                path = %path.display(),
                "In-progress segment shorter than its header, resetting"
            );
            let mut file = OpenOptions::new().write(true).open(path)?;
            file.set_len(0)?;
            file.write_all(&SEGMENT_MAGIC)?;
            file.sync_data()?;
            return Ok(Self {
                path: path.to_path_buf(),
                start_index: start,
                records: Vec::new(),
                total_size: header_len,
                is_open: true,
                writer: Some(BufWriter::new(file)),
            });
        }
        if data[..SEGMENT_MAGIC.len()] != SEGMENT_MAGIC {
            return Err(KeelError::CorruptSegment(format!(
                "{}: bad segment magic",
                path.display()
            )));
        }

        let expected_entries = end.map(|e| e - start + 1);
        let mut records: Vec<LogRecord> = Vec::new();
        let mut offset = header_len;
        let mut repaired = false;

        loop {
            if Some(records.len() as u64) == expected_entries {
                break;
            }
            match decode_frame(&data, offset) {
                Ok(None) => break,
                Ok(Some((entry, next))) => {
                    let expected_index = start + records.len() as u64;
                    if entry.index != expected_index {
                        return Err(KeelError::CorruptSegment(format!(
                            "{}: expected index {expected_index}, found {}",
                            path.display(),
                            entry.index
                        )));
                    }
                    if let Some(last) = records.last() {
                        if entry.term < last.entry.term {
                            return Err(KeelError::CorruptSegment(format!(
                                "{}: term regressed from {} to {} at index {}",
                                path.display(),
                                last.entry.term,
                                entry.term,
                                entry.index
                            )));
                        }
                    }
                    records.push(LogRecord { offset, entry });
                    offset = next;
                }
                Err(err) if is_open => {
                    // Torn tail write from a crash: keep the parsed prefix.
                    warn!(
                        target: "keel::segment",
                        path = %path.display(),
                        offset,
                        error = %err,
                        "Discarding torn tail of in-progress segment"
                    );
                    repaired = true;
                    break;
                }
                Err(err) => {
                    return Err(KeelError::CorruptSegment(format!(
                        "{}: {err}",
                        path.display()
                    )));
                }
            }
        }

        if let Some(expected) = expected_entries {
            if (records.len() as u64) < expected {
                return Err(KeelError::CorruptSegment(format!(
                    "{}: holds {} entries but the file name declares {expected}",
                    path.display(),
                    records.len()
                )));
            }
        }

        let file_len = data.len() as u64;
        let mut segment = Self {
            path: path.to_path_buf(),
            start_index: start,
            records,
            total_size: offset,
            is_open,
            writer: None,
        };

        if is_open {
            let mut file = OpenOptions::new().write(true).open(path)?;
            if repaired || file_len > offset {
                file.set_len(offset)?;
                file.sync_data()?;
            }
            file.seek(SeekFrom::Start(offset))?;
            segment.writer = Some(BufWriter::new(file));
        } else if file_len > offset {
            // Sealed files may carry preallocation padding past the declared
            // range; trim it so the file matches total_size.
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            file.sync_data()?;
            info!(
                target: "keel::segment",
                path = %path.display(),
                trimmed = file_len - offset,
                "Trimmed padding after sealed range"
            );
        }

        info!(
            target: "keel::segment",
            path = %segment.path.display(),
            entries = segment.records.len(),
            size = segment.total_size,
            "Loaded segment"
        );
        Ok(segment)
    }

    /// Append a batch of entries and write their frames through the
    /// segment's file handle. All entries must carry the same term and
    /// strictly contiguous indices continuing this segment.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if !self.is_open {
            return Err(KeelError::NotOpen);
        }
        if entries.is_empty() {
            return Ok(());
        }

        let term = entries[0].term;
        let mut expected = self.next_index();
        for entry in entries {
            if entry.term != term {
                return Err(KeelError::MixedTerm {
                    expected: term,
                    actual: entry.term,
                });
            }
            if entry.index != expected {
                return Err(KeelError::IndexGap {
                    expected,
                    actual: entry.index,
                });
            }
            expected += 1;
        }

        let mut buf = Vec::new();
        for entry in entries {
            encode_frame(entry, &mut buf);
        }
        let writer = self.writer.as_mut().ok_or(KeelError::NotOpen)?;
        writer.write_all(&buf)?;

        // Memory is updated only after the bytes are handed off.
        let mut offset = self.total_size;
        for entry in entries {
            let len = frame_size(entry);
            self.records.push(LogRecord {
                offset,
                entry: entry.clone(),
            });
            offset += len;
        }
        self.total_size = offset;

        debug!(
            target: "keel::segment",
            path = %self.path.display(),
            appended = entries.len(),
            end_index = expected - 1,
            size = self.total_size,
            "Appended entries"
        );
        Ok(())
    }

    /// Drop all records with `index >= from_index` and shrink the file to
    /// match. A truncated segment is always sealed; the coordinator decides
    /// whether to re-open it.
    pub fn truncate(&mut self, from_index: u64) -> Result<()> {
        let next = self.next_index();
        if from_index < self.start_index {
            return Err(KeelError::OutOfRange {
                index: from_index,
                first_index: self.start_index,
            });
        }
        if from_index > next {
            return Err(KeelError::IndexGap {
                expected: next,
                actual: from_index,
            });
        }

        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let keep = (from_index - self.start_index) as usize;
        let new_len = self.records.get(keep).map_or(self.total_size, |r| r.offset);
        let removed = self.records.len() - keep;
        self.records.truncate(keep);

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(new_len)?;
        file.sync_data()?;

        self.total_size = new_len;
        self.is_open = false;

        info!(
            target: "keel::segment",
            path = %self.path.display(),
            from_index,
            removed,
            size = self.total_size,
            "Truncated segment"
        );
        Ok(())
    }

    /// Seal the segment: flush, fsync, release the write handle and rename
    /// the file to its `log-<start>-<end>` form.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Err(KeelError::NotOpen);
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        self.is_open = false;

        match self.end_index() {
            Some(end) => {
                let sealed = self.sibling(&sealed_segment_name(self.start_index, end))?;
                fs::rename(&self.path, &sealed)?;
                info!(
                    target: "keel::segment",
                    from = %self.path.display(),
                    to = %sealed.display(),
                    "Sealed segment"
                );
                self.path = sealed;
            }
            None => {
                // An empty sealed segment has no representable file name.
                fs::remove_file(&self.path)?;
                warn!(
                    target: "keel::segment",
                    path = %self.path.display(),
                    "Closed empty segment, removed its file"
                );
            }
        }
        Ok(())
    }

    /// Coordinator-side explicit re-open after a truncation: rename the
    /// file back to its in-progress form and re-acquire a write handle
    /// positioned at the end of the surviving data.
    pub(crate) fn reopen(mut self) -> Result<Self> {
        let inprogress = self.sibling(&open_segment_name(self.start_index))?;
        if self.path != inprogress {
            fs::rename(&self.path, &inprogress)?;
            self.path = inprogress;
        }
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(self.total_size))?;
        self.writer = Some(BufWriter::new(file));
        self.is_open = true;

        info!(
            target: "keel::segment",
            path = %self.path.display(),
            next_index = self.next_index(),
            "Re-opened segment for append"
        );
        Ok(self)
    }

    /// Remove this segment's file.
    pub(crate) fn delete(mut self) -> Result<()> {
        self.writer = None;
        fs::remove_file(&self.path)?;
        info!(
            target: "keel::segment",
            path = %self.path.display(),
            "Deleted segment"
        );
        Ok(())
    }

    /// Push buffered frames to the OS page cache without fsyncing.
    pub(crate) fn flush_buffer(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flush and fsync; appended frames are durable once this returns.
    pub(crate) fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flush, fsync and drop the write handle without renaming the file.
    /// Used on shutdown so the tail stays in-progress for the next open.
    pub(crate) fn release_writer(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.start_index {
            return None;
        }
        self.records
            .get((index - self.start_index) as usize)
            .map(|r| &r.entry)
    }

    #[must_use]
    pub fn last_record(&self) -> Option<&LogRecord> {
        self.records.last()
    }

    #[inline]
    #[must_use]
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Index of the last entry, or `None` while the segment is empty.
    #[inline]
    #[must_use]
    pub fn end_index(&self) -> Option<u64> {
        if self.records.is_empty() {
            None
        } else {
            Some(self.start_index + self.records.len() as u64 - 1)
        }
    }

    /// Index the next appended entry must carry.
    #[inline]
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.start_index + self.records.len() as u64
    }

    #[inline]
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.records.len()
    }

    #[inline]
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self, max_bytes: u64) -> bool {
        self.total_size >= max_bytes
    }

    /// True when appending a frame of `frame_len` bytes would push the file
    /// past `max_bytes`. The coordinator rolls before that happens, keeping
    /// sealed segments under the bound.
    #[inline]
    #[must_use]
    pub fn would_overfill(&self, frame_len: u64, max_bytes: u64) -> bool {
        self.total_size + frame_len > max_bytes
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, name: &str) -> Result<PathBuf> {
        let parent = self.path.parent().ok_or_else(|| {
            KeelError::CorruptDirectory(format!(
                "segment path {} has no parent directory",
                self.path.display()
            ))
        })?;
        Ok(parent.join(name))
    }
}

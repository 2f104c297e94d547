//! Segmented, append-only storage for a Raft replicated log.
//!
//! The log is a sequence of checksummed entry frames split across segment
//! files named `log-<start>-<end>` (sealed) and `log-<start>-inprogress`
//! (the unique open tail). All entries are cached in memory; reads never
//! touch disk after recovery.
//!
//! The log is single-writer, multi-reader and expects the consensus module
//! to hold its own lock around mutations; see [`SegmentedLog`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod config;
mod log;
mod segment;
mod storage;

pub use codec::{decode_frame, encode_frame, frame_size, EntryKind, LogEntry};
pub use config::{LogConfig, SyncPolicy};
pub use keel_core::{KeelError, Result};
pub use log::{LogReader, SegmentedLog};
pub use segment::{LogRecord, LogSegment};

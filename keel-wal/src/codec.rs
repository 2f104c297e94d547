//! Entry frame codec.
//!
//! On-disk frame layout:
//!
//! ```text
//! [length: varint]  byte length L of the body
//! [body: L bytes]   index (8, LE) | term (8, LE) | kind (1) | payload
//! [crc: 4 bytes]    CRC32 of the body, big-endian
//! ```
//!
//! The length prefix plus trailing CRC lets recovery distinguish a torn
//! write at the tail of a file (truncated frame) from silent corruption
//! inside a frame (CRC mismatch).

use bytes::Bytes;
use keel_core::{crc32, decode_varint32, encode_varint32, varint32_len, KeelError, Result, Varint32};

/// index + term + kind discriminator.
const BODY_FIXED_LEN: usize = 8 + 8 + 1;
const CRC_LEN: usize = 4;

/// Entry discriminator supplied by the consensus layer; opaque to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// State-machine command.
    Data = 0,
    /// Cluster membership change.
    Config = 1,
    /// Leader no-op, written at the start of a term.
    Noop = 2,
}

impl EntryKind {
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Config,
            2 => Self::Noop,
            _ => Self::Data,
        }
    }
}

/// A single consensus log entry. Immutable once appended; the log never
/// inspects `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub payload: Bytes,
}

impl LogEntry {
    #[must_use]
    pub fn new(index: u64, term: u64, kind: EntryKind, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            term,
            kind,
            payload: payload.into(),
        }
    }
}

/// Exact number of bytes `encode_frame` writes for `entry`.
#[must_use]
pub fn frame_size(entry: &LogEntry) -> u64 {
    let body_len = BODY_FIXED_LEN + entry.payload.len();
    (varint32_len(body_len as u32) + body_len + CRC_LEN) as u64
}

/// Append the frame for `entry` to `buf`. Pure and deterministic.
pub fn encode_frame(entry: &LogEntry, buf: &mut Vec<u8>) {
    let body_len = BODY_FIXED_LEN + entry.payload.len();
    buf.reserve(varint32_len(body_len as u32) + body_len + CRC_LEN);

    encode_varint32(body_len as u32, buf);
    let body_start = buf.len();
    buf.extend_from_slice(&entry.index.to_le_bytes());
    buf.extend_from_slice(&entry.term.to_le_bytes());
    buf.push(entry.kind.as_u8());
    buf.extend_from_slice(&entry.payload);

    let crc = crc32(&buf[body_start..]);
    buf.extend_from_slice(&crc.to_be_bytes());
}

fn read_u64_le(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

/// Decode the frame starting at `offset` within `data` (a whole segment
/// file, header included).
///
/// Returns `Ok(None)` at a clean end of data, or the entry plus the offset
/// of the next frame. The declared body length is validated against the
/// bytes actually present before anything is allocated, so a torn length
/// prefix can never drive an oversized read.
pub fn decode_frame(data: &[u8], offset: u64) -> Result<Option<(LogEntry, u64)>> {
    let buf = &data[offset as usize..];
    if buf.is_empty() {
        return Ok(None);
    }

    let (body_len, prefix_len) = match decode_varint32(buf) {
        Varint32::Value(value, len) => (value as usize, len),
        Varint32::Incomplete => return Err(KeelError::TruncatedFrame { offset }),
        Varint32::Malformed => return Err(KeelError::BadVarint { offset }),
    };
    if body_len < BODY_FIXED_LEN {
        return Err(KeelError::CorruptFrame {
            offset,
            reason: format!("body length {body_len} shorter than the fixed fields"),
        });
    }

    let rest = &buf[prefix_len..];
    if rest.len() < body_len + CRC_LEN {
        return Err(KeelError::TruncatedFrame { offset });
    }

    let body = &rest[..body_len];
    let crc_bytes = &rest[body_len..body_len + CRC_LEN];
    let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32(body);
    if expected != actual {
        return Err(KeelError::CrcMismatch { expected, actual });
    }

    let entry = LogEntry {
        index: read_u64_le(&body[0..8]),
        term: read_u64_le(&body[8..16]),
        kind: EntryKind::from_u8(body[16]),
        payload: Bytes::copy_from_slice(&body[BODY_FIXED_LEN..]),
    };
    let next = offset + (prefix_len + body_len + CRC_LEN) as u64;
    Ok(Some((entry, next)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, payload: &[u8]) -> LogEntry {
        LogEntry::new(index, term, EntryKind::Data, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn test_roundtrip() {
        for e in [
            entry(0, 1, b"a"),
            entry(7, 3, b""),
            LogEntry::new(42, 9, EntryKind::Config, Bytes::from_static(b"membership")),
            LogEntry::new(43, 9, EntryKind::Noop, Bytes::new()),
        ] {
            let mut buf = Vec::new();
            encode_frame(&e, &mut buf);
            assert_eq!(buf.len() as u64, frame_size(&e));

            let (decoded, next) = decode_frame(&buf, 0).unwrap().unwrap();
            assert_eq!(decoded, e);
            assert_eq!(next, buf.len() as u64);
        }
    }

    #[test]
    fn test_decode_sequence() {
        let mut buf = Vec::new();
        for i in 0..5 {
            encode_frame(&entry(i, 1, b"payload"), &mut buf);
        }

        let mut offset = 0;
        for i in 0..5 {
            let (decoded, next) = decode_frame(&buf, offset).unwrap().unwrap();
            assert_eq!(decoded.index, i);
            offset = next;
        }
        assert!(decode_frame(&buf, offset).unwrap().is_none());
    }

    #[test]
    fn test_clean_eof() {
        assert!(decode_frame(&[], 0).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame() {
        let mut buf = Vec::new();
        encode_frame(&entry(0, 1, b"some payload"), &mut buf);

        for cut in 1..buf.len() {
            let err = decode_frame(&buf[..cut], 0).unwrap_err();
            assert!(
                matches!(err, KeelError::TruncatedFrame { offset: 0 }),
                "cut at {cut}: {err}"
            );
        }
    }

    #[test]
    fn test_crc_mismatch() {
        let mut buf = Vec::new();
        encode_frame(&entry(0, 1, b"some payload"), &mut buf);

        // Flip one payload bit; the length prefix still parses.
        let mid = buf.len() / 2;
        buf[mid] ^= 0x40;
        let err = decode_frame(&buf, 0).unwrap_err();
        assert!(matches!(err, KeelError::CrcMismatch { .. }), "{err}");
    }

    #[test]
    fn test_bad_varint() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0x7F, 0, 0, 0];
        let err = decode_frame(&buf, 0).unwrap_err();
        assert!(matches!(err, KeelError::BadVarint { offset: 0 }), "{err}");
    }

    #[test]
    fn test_undersized_body_rejected() {
        // Declared body of 3 bytes cannot hold index + term + kind.
        let body = [1u8, 2, 3];
        let mut buf = vec![3u8];
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&crc32(&body).to_be_bytes());
        let err = decode_frame(&buf, 0).unwrap_err();
        assert!(matches!(err, KeelError::CorruptFrame { offset: 0, .. }), "{err}");
    }

    #[test]
    fn test_oversized_length_is_truncation_not_allocation() {
        // A frame claiming u32::MAX body bytes in a tiny file must report a
        // torn tail, not attempt the allocation.
        let mut buf = Vec::new();
        encode_varint32(u32::MAX - 8, &mut buf);
        buf.extend_from_slice(b"short");
        let err = decode_frame(&buf, 0).unwrap_err();
        assert!(matches!(err, KeelError::TruncatedFrame { offset: 0 }), "{err}");
    }
}

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod checksum;
mod error;
mod varint;

pub use checksum::crc32;
pub use error::{KeelError, Result};
pub use varint::{decode_varint32, encode_varint32, varint32_len, Varint32, MAX_VARINT32_LEN};

/// Every segment file begins with exactly these bytes; the first entry frame
/// starts at `SEGMENT_MAGIC.len()`.
pub const SEGMENT_MAGIC: [u8; 8] = *b"KEELWAL1";

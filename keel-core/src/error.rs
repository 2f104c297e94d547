use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index gap: expected {expected}, got {actual}")]
    IndexGap { expected: u64, actual: u64 },

    #[error("segment is not open for append")]
    NotOpen,

    #[error("append batch spans terms: expected {expected}, got {actual}")]
    MixedTerm { expected: u64, actual: u64 },

    #[error("index {index} is below the first retained index {first_index}")]
    OutOfRange { index: u64, first_index: u64 },

    #[error("corrupt frame at offset {offset}: {reason}")]
    CorruptFrame { offset: u64, reason: String },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("truncated frame at offset {offset}")]
    TruncatedFrame { offset: u64 },

    #[error("malformed varint length prefix at offset {offset}")]
    BadVarint { offset: u64 },

    #[error("corrupt segment: {0}")]
    CorruptSegment(String),

    #[error("corrupt storage directory: {0}")]
    CorruptDirectory(String),

    #[error("log is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, KeelError>;

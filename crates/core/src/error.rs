//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("chunk index {index} out of range for {total} chunks")]
    ChunkIndexOutOfRange { index: u32, total: u32 },

    #[error("invalid total chunk count: {0}")]
    InvalidTotalChunks(String),

    #[error("inconsistent total chunks: session declared {expected}, request declared {declared}")]
    InconsistentTotalChunks { expected: u32, declared: u32 },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("upload session is {0}, not open")]
    SessionNotOpen(String),

    #[error("upload too large: {size} bytes exceeds maximum {max}")]
    UploadTooLarge { size: u64, max: u64 },

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

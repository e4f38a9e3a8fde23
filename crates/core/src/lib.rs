//! Core domain types and shared logic for depot.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload identifiers and file name validation
//! - Upload session lifecycle and the forward-only state machine
//! - Whole-file content hashing
//! - Configuration shared by the storage layer and the server

pub mod config;
pub mod error;
pub mod hash;
pub mod upload;

pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use upload::{ArtifactHandle, ChunkIndex, FileName, UploadId, UploadSession, UploadState};

/// Default maximum size of a single chunk: 32 MiB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Default ceiling on the total size of one upload: 1 GiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;

/// Default maximum number of chunks a single upload may declare.
pub const DEFAULT_MAX_TOTAL_CHUNKS: u32 = 100_000;

//! Upload session types and lifecycle.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Position of a chunk within its upload (0-indexed).
pub type ChunkIndex = u32;

/// Maximum length of a sanitized file name in bytes.
const MAX_FILE_NAME_LEN: usize = 255;

/// Unique identifier for an upload session.
///
/// Minted by the server on the first chunk of an upload. The client file
/// name is never used as a storage key on its own.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidUploadId(e.to_string()))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client-supplied file name, reduced to a single safe path component.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileName(String);

impl FileName {
    /// Sanitize a raw client file name.
    ///
    /// Directory parts are dropped (browsers may send a full path), leading
    /// dots are stripped, and names that are empty, contain control
    /// characters or exceed 255 bytes are rejected.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
        let base = base.trim_start_matches('.');

        if base.is_empty() {
            return Err(crate::Error::InvalidFileName(format!(
                "file name is empty after sanitizing: {raw:?}"
            )));
        }
        if base.chars().any(char::is_control) {
            return Err(crate::Error::InvalidFileName(
                "file name contains control characters".to_string(),
            ));
        }
        if base.len() > MAX_FILE_NAME_LEN {
            return Err(crate::Error::InvalidFileName(format!(
                "file name is {} bytes (max {MAX_FILE_NAME_LEN})",
                base.len()
            )));
        }

        Ok(Self(base.to_string()))
    }

    /// Get the sanitized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FileName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<FileName> for String {
    fn from(value: FileName) -> Self {
        value.0
    }
}

impl fmt::Debug for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileName({:?})", self.0)
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upload session state.
///
/// Transitions only move forward:
///
/// ```text
/// Open ──► Assembling ──► Complete
///   │            └──────► Failed
///   └──► Expired
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Session is open and accepting chunks.
    Open,
    /// Chunks are being merged into the final artifact.
    Assembling,
    /// The final artifact was written and verified.
    Complete,
    /// Assembly failed; chunks are retained for inspection.
    Failed,
    /// No chunk arrived within the upload timeout.
    Expired,
}

impl UploadState {
    /// Get the state as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assembling => "assembling",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Check if the session is still active (can receive chunks).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Expired)
    }

    /// Check whether moving to `next` is a legal forward transition.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Assembling)
                | (Self::Open, Self::Expired)
                | (Self::Assembling, Self::Complete)
                | (Self::Assembling, Self::Failed)
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an assembled file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    /// Upload that produced the artifact.
    pub upload_id: UploadId,
    /// Object store key of the artifact.
    pub key: String,
    /// Artifact size in bytes.
    pub size: u64,
    /// SHA-256 of the artifact contents (hex).
    pub sha256: ContentHash,
}

/// An upload session tracking chunk arrival and assembly state.
///
/// The received chunk map is not serialized: it is rebuilt from the chunk
/// store when a session record is loaded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier.
    pub id: UploadId,
    /// Sanitized client file name.
    pub file_name: FileName,
    /// Number of chunks the upload is split into. Fixed at creation.
    pub total_chunks: u32,
    /// Current session state.
    pub state: UploadState,
    /// Whole-file checksum supplied by the client, verified at assembly.
    #[serde(default)]
    pub checksum: Option<ContentHash>,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the most recent chunk was accepted.
    #[serde(with = "time::serde::rfc3339")]
    pub last_chunk_at: OffsetDateTime,
    /// When the session last changed state.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Failure cause, set when the session is `Failed`.
    #[serde(default)]
    pub failure: Option<String>,
    /// The assembled artifact, set when the session is `Complete`.
    #[serde(default)]
    pub artifact: Option<ArtifactHandle>,
    /// Whether chunk storage was reclaimed after completion.
    #[serde(default)]
    pub chunks_cleared: bool,
    /// Accepted chunk sizes keyed by index.
    #[serde(skip)]
    received: BTreeMap<ChunkIndex, u64>,
    /// Bytes reserved by chunk writes that have not been recorded yet.
    #[serde(skip)]
    reserved_bytes: u64,
}

impl UploadSession {
    /// Create a new open upload session.
    pub fn new(
        file_name: FileName,
        total_chunks: u32,
        checksum: Option<ContentHash>,
        now: OffsetDateTime,
    ) -> crate::Result<Self> {
        if total_chunks == 0 {
            return Err(crate::Error::InvalidTotalChunks(
                "total chunks must be positive".to_string(),
            ));
        }

        Ok(Self {
            id: UploadId::new(),
            file_name,
            total_chunks,
            state: UploadState::Open,
            checksum,
            created_at: now,
            last_chunk_at: now,
            updated_at: now,
            failure: None,
            artifact: None,
            chunks_cleared: false,
            received: BTreeMap::new(),
            reserved_bytes: 0,
        })
    }

    /// Fail unless the session accepts chunks.
    pub fn ensure_open(&self) -> crate::Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(crate::Error::SessionNotOpen(self.state.to_string()))
        }
    }

    /// Fail unless `index` lies in `[0, total_chunks)`.
    pub fn check_index(&self, index: ChunkIndex) -> crate::Result<()> {
        if index < self.total_chunks {
            Ok(())
        } else {
            Err(crate::Error::ChunkIndexOutOfRange {
                index,
                total: self.total_chunks,
            })
        }
    }

    /// Fail unless `declared` matches the chunk count fixed at creation.
    pub fn check_total(&self, declared: u32) -> crate::Result<()> {
        if declared == self.total_chunks {
            Ok(())
        } else {
            Err(crate::Error::InconsistentTotalChunks {
                expected: self.total_chunks,
                declared,
            })
        }
    }

    /// Reserve space for a chunk write before it reaches storage.
    ///
    /// The projected total counts accepted chunks (with `index` replaced by
    /// the new size) plus every in-flight reservation.
    pub fn reserve(&mut self, index: ChunkIndex, size: u64, max_upload_size: u64) -> crate::Result<()> {
        self.ensure_open()?;
        self.check_index(index)?;

        let replaced = self.received.get(&index).copied().unwrap_or(0);
        let projected = (self.received_bytes() - replaced)
            .saturating_add(self.reserved_bytes)
            .saturating_add(size);
        if projected > max_upload_size {
            return Err(crate::Error::UploadTooLarge {
                size: projected,
                max: max_upload_size,
            });
        }

        self.reserved_bytes += size;
        Ok(())
    }

    /// Return a reservation that will not be recorded.
    pub fn release(&mut self, size: u64) {
        self.reserved_bytes = self.reserved_bytes.saturating_sub(size);
    }

    /// Record a durably written chunk, consuming its reservation.
    ///
    /// Returns `true` only for the call that makes the received set equal to
    /// `[0, total_chunks)`. Re-recording an index replaces its size and never
    /// signals completion again.
    pub fn record_chunk(
        &mut self,
        index: ChunkIndex,
        size: u64,
        now: OffsetDateTime,
    ) -> crate::Result<bool> {
        self.release(size);
        self.ensure_open()?;
        self.check_index(index)?;

        let was_complete = self.is_complete();
        self.received.insert(index, size);
        self.last_chunk_at = now;
        Ok(!was_complete && self.is_complete())
    }

    /// Restore a chunk found in storage while loading a session.
    ///
    /// Indices outside the declared range are ignored.
    pub fn restore_chunk(&mut self, index: ChunkIndex, size: u64, modified: Option<OffsetDateTime>) {
        if index >= self.total_chunks {
            return;
        }
        self.received.insert(index, size);
        if let Some(modified) = modified
            && modified > self.last_chunk_at
        {
            self.last_chunk_at = modified;
        }
    }

    /// Move to `next`, rejecting backward or sideways transitions.
    pub fn transition(&mut self, next: UploadState, now: OffsetDateTime) -> crate::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(crate::Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Mark assembly as failed with the given cause.
    pub fn fail(&mut self, cause: impl Into<String>, now: OffsetDateTime) -> crate::Result<()> {
        self.transition(UploadState::Failed, now)?;
        self.failure = Some(cause.into());
        Ok(())
    }

    /// Mark assembly as complete.
    pub fn complete(&mut self, artifact: ArtifactHandle, now: OffsetDateTime) -> crate::Result<()> {
        self.transition(UploadState::Complete, now)?;
        self.artifact = Some(artifact);
        Ok(())
    }

    /// Whether every index in `[0, total_chunks)` has been received.
    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }

    /// Indices that have not been received yet, in ascending order.
    pub fn missing_chunks(&self) -> Vec<ChunkIndex> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains_key(i))
            .collect()
    }

    /// Number of distinct chunks received.
    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Sum of accepted chunk sizes.
    pub fn received_bytes(&self) -> u64 {
        self.received.values().sum()
    }

    /// Accepted size of one chunk.
    pub fn chunk_size(&self, index: ChunkIndex) -> Option<u64> {
        self.received.get(&index).copied()
    }

    /// When the session expires if no further chunk arrives.
    ///
    /// `None` when the deadline is past the representable date range, which
    /// means never.
    pub fn expires_at(&self, ttl: time::Duration) -> Option<OffsetDateTime> {
        self.last_chunk_at.checked_add(ttl)
    }

    /// Whether an open session has gone without chunks for longer than `ttl`.
    pub fn is_stale(&self, now: OffsetDateTime, ttl: time::Duration) -> bool {
        self.state == UploadState::Open && self.expires_at(ttl).is_some_and(|at| now > at)
    }

    /// Time spent in the current state.
    pub fn time_in_state(&self, now: OffsetDateTime) -> time::Duration {
        now - self.updated_at
    }
}

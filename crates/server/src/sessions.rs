//! Upload session registry.
//!
//! Sessions live in a sharded map keyed by upload id. Each entry carries
//! three locks with distinct jobs:
//!
//! - `session`: a short critical section around the session record. The
//!   received-set insert and completeness check happen under it as one step.
//! - `gate`: shared by chunk writers for the whole reserve, write, record
//!   sequence; taken exclusively to flip a session out of `Open`, so no chunk
//!   write straddles that transition.
//! - `assembly`: held for the full merge so only one assembly runs per upload.

use crate::metrics::{
    ACTIVE_UPLOAD_SESSIONS, BYTES_RECEIVED, CHUNK_DUPLICATES, CHUNKS_RECEIVED,
    UPLOAD_SESSIONS_CREATED, UPLOAD_SESSIONS_EXPIRED, UPLOAD_SESSIONS_RECOVERED,
};
use bytes::Bytes;
use dashmap::DashMap;
use depot_core::config::ServerConfig;
use depot_core::{
    ArtifactHandle, ChunkIndex, ContentHash, FileName, UploadId, UploadSession, UploadState,
};
use depot_storage::chunk_store::{UPLOADS_PREFIX, artifact_key, optional, session_key};
use depot_storage::{ChunkStore, ObjectStore, StorageError};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};

/// Session manager errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("upload session not found: {0}")]
    NotFound(UploadId),

    #[error(transparent)]
    Core(#[from] depot_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// One registered upload session and its locks.
pub struct SessionEntry {
    id: UploadId,
    session: Mutex<UploadSession>,
    gate: RwLock<()>,
    assembly: tokio::sync::Mutex<()>,
}

impl SessionEntry {
    fn new(session: UploadSession) -> Self {
        Self {
            id: session.id,
            session: Mutex::new(session),
            gate: RwLock::new(()),
            assembly: tokio::sync::Mutex::new(()),
        }
    }

    /// Upload id of this session.
    pub fn id(&self) -> UploadId {
        self.id
    }

    /// Run `f` inside the session critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut UploadSession) -> R) -> R {
        // A panic inside `f` cannot leave the record half-updated: every
        // mutation on UploadSession validates before it writes.
        let mut guard = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Copy of the current session record.
    pub fn snapshot(&self) -> UploadSession {
        self.with(|s| s.clone())
    }

    /// Current state.
    pub fn state(&self) -> UploadState {
        self.with(|s| s.state)
    }

    /// Shared ingest gate held by chunk writers.
    pub async fn ingest(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Exclusive gate, waits for in-flight chunk writes to drain.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Exclusive gate if no chunk write is in flight.
    pub fn try_exclusive(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.gate.try_write().ok()
    }

    /// Per-upload assembly lock.
    pub async fn lock_assembly(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.assembly.lock().await
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Result of accepting one chunk.
#[derive(Clone, Copy, Debug)]
pub struct ChunkReceipt {
    pub upload_id: UploadId,
    /// Distinct chunks received so far.
    pub received_chunks: usize,
    pub total_chunks: u32,
    /// True for the single request that completed the received set.
    pub is_now_complete: bool,
}

/// Space held against an upload's ceiling while its chunk is written.
#[must_use = "dropping a reservation releases it"]
#[derive(Debug)]
pub struct Reservation<'a> {
    entry: &'a SessionEntry,
    index: ChunkIndex,
    size: Option<u64>,
}

impl Reservation<'_> {
    pub fn index(&self) -> ChunkIndex {
        self.index
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(size) = self.size.take() {
            self.entry.with(|s| s.release(size));
        }
    }
}

/// What startup recovery found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub loaded: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Limits applied to incoming uploads.
#[derive(Clone, Copy, Debug)]
pub struct SessionLimits {
    pub max_upload_size: u64,
    pub max_total_chunks: u32,
    pub upload_timeout: Duration,
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_upload_size: config.max_upload_size,
            max_total_chunks: config.max_total_chunks,
            upload_timeout: config.upload_timeout(),
        }
    }
}

/// Registry of upload sessions.
pub struct UploadSessionManager {
    sessions: DashMap<UploadId, Arc<SessionEntry>>,
    chunks: ChunkStore,
    limits: SessionLimits,
}

impl UploadSessionManager {
    pub fn new(chunks: ChunkStore, limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            chunks,
            limits,
        }
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    fn store(&self) -> &Arc<dyn ObjectStore> {
        self.chunks.object_store()
    }

    /// Look up a registered session.
    pub fn get(&self, id: &UploadId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Look up a session or fail with `NotFound`.
    pub fn require(&self, id: &UploadId) -> SessionResult<Arc<SessionEntry>> {
        self.get(id).ok_or(SessionError::NotFound(*id))
    }

    /// Copy of a session record.
    pub fn snapshot(&self, id: &UploadId) -> Option<UploadSession> {
        self.get(id).map(|entry| entry.snapshot())
    }

    /// All registered sessions. Arcs are cloned out so no map shard stays
    /// locked while the caller awaits.
    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop a session from the registry. Storage is untouched.
    pub fn remove(&self, id: &UploadId) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(id).map(|(_, entry)| entry)
    }

    /// Write the durable session record.
    pub async fn persist(&self, session: &UploadSession) -> SessionResult<()> {
        let record = serde_json::to_vec_pretty(session)?;
        self.store()
            .put(&session_key(&session.id), Bytes::from(record))
            .await?;
        Ok(())
    }

    /// Resolve the session a chunk belongs to, creating one when needed.
    ///
    /// An absent, unknown or expired `upload_id` starts a fresh session with
    /// a newly minted id; an expired session is never resurrected. For an
    /// open session the declared total must match the one fixed at creation.
    /// Sessions in any other state are returned as-is and rejected when the
    /// chunk is reserved.
    #[instrument(skip_all, fields(upload_id = tracing::field::Empty, total_chunks))]
    pub async fn get_or_create(
        &self,
        upload_id: Option<UploadId>,
        total_chunks: u32,
        file_name: &FileName,
        checksum: Option<ContentHash>,
    ) -> SessionResult<Arc<SessionEntry>> {
        if let Some(id) = upload_id
            && let Some(entry) = self.get(&id)
        {
            let state = entry.state();
            if state != UploadState::Expired {
                if state == UploadState::Open {
                    entry.with(|s| s.check_total(total_chunks))?;
                }
                tracing::Span::current().record("upload_id", tracing::field::display(id));
                return Ok(entry);
            }
            debug!(upload_id = %id, "chunk for expired session, starting a fresh one");
        }

        self.create(total_chunks, file_name.clone(), checksum).await
    }

    async fn create(
        &self,
        total_chunks: u32,
        file_name: FileName,
        checksum: Option<ContentHash>,
    ) -> SessionResult<Arc<SessionEntry>> {
        if total_chunks > self.limits.max_total_chunks {
            return Err(depot_core::Error::InvalidTotalChunks(format!(
                "{total_chunks} exceeds maximum of {}",
                self.limits.max_total_chunks
            ))
            .into());
        }

        let session = UploadSession::new(file_name, total_chunks, checksum, OffsetDateTime::now_utc())?;
        self.persist(&session).await?;

        let id = session.id;
        let entry = Arc::new(SessionEntry::new(session));
        self.sessions.insert(id, entry.clone());

        UPLOAD_SESSIONS_CREATED.inc();
        ACTIVE_UPLOAD_SESSIONS.inc();
        tracing::Span::current().record("upload_id", tracing::field::display(id));
        info!(upload_id = %id, total_chunks, "upload session created");

        Ok(entry)
    }

    /// Reserve space for chunk `index` against the upload ceiling.
    ///
    /// The reservation is returned when the guard drops unless
    /// [`mark_received`](Self::mark_received) consumed it first, so a
    /// cancelled or failed write never shrinks the ceiling.
    pub fn reserve<'a>(
        &self,
        entry: &'a SessionEntry,
        index: ChunkIndex,
        size: u64,
    ) -> SessionResult<Reservation<'a>> {
        entry.with(|s| s.reserve(index, size, self.limits.max_upload_size))?;
        Ok(Reservation {
            entry,
            index,
            size: Some(size),
        })
    }

    /// Persist one chunk and record it.
    ///
    /// Space is reserved before the write, so a rejected chunk never reaches
    /// storage. A write that fails or is cancelled is not recorded as
    /// received and gives its reservation back.
    #[instrument(skip(self, entry, data), fields(upload_id = %entry.id(), size = data.len()))]
    pub async fn receive_chunk(
        &self,
        entry: &SessionEntry,
        index: ChunkIndex,
        data: Bytes,
    ) -> SessionResult<ChunkReceipt> {
        let _ingest = entry.ingest().await;
        let reservation = self.reserve(entry, index, data.len() as u64)?;

        if let Err(e) = self.chunks.write(&entry.id(), index, data).await {
            warn!(upload_id = %entry.id(), chunk_index = index, error = %e, "chunk write failed");
            return Err(e.into());
        }

        self.mark_received(reservation)
    }

    /// Record that the reserved chunk is durably stored.
    ///
    /// `is_now_complete` is true for exactly one caller: the one whose insert
    /// completed the received set. Recording an index again replaces its
    /// size and never signals completion twice.
    pub fn mark_received(&self, mut reservation: Reservation<'_>) -> SessionResult<ChunkReceipt> {
        let entry = reservation.entry;
        let index = reservation.index;

        let (receipt, size, replaced) = entry.with(|s| {
            // Consumed inside the critical section: record_chunk releases it.
            let size = reservation.size.take().unwrap_or_default();
            let replaced = s.chunk_size(index).is_some();
            let is_now_complete = s.record_chunk(index, size, OffsetDateTime::now_utc())?;
            Ok::<_, depot_core::Error>((
                ChunkReceipt {
                    upload_id: s.id,
                    received_chunks: s.received_count(),
                    total_chunks: s.total_chunks,
                    is_now_complete,
                },
                size,
                replaced,
            ))
        })?;

        if replaced {
            CHUNK_DUPLICATES.inc();
        }
        CHUNKS_RECEIVED.inc();
        BYTES_RECEIVED.inc_by(size);
        debug!(
            upload_id = %receipt.upload_id,
            chunk_index = index,
            received = receipt.received_chunks,
            total = receipt.total_chunks,
            "chunk recorded"
        );

        Ok(receipt)
    }

    /// Mark open sessions with no chunk for longer than `ttl` as expired.
    ///
    /// Sessions with a chunk write in flight are skipped and picked up by a
    /// later sweep. Returns the ids that expired.
    pub async fn expire_stale(&self, now: OffsetDateTime, ttl: Duration) -> Vec<UploadId> {
        let mut expired = Vec::new();

        for entry in self.entries() {
            if !entry.with(|s| s.is_stale(now, ttl)) {
                continue;
            }
            let Some(_exclusive) = entry.try_exclusive() else {
                debug!(upload_id = %entry.id(), "stale session busy, skipping");
                continue;
            };

            let flipped = entry.with(|s| {
                // Re-check: a chunk may have landed before we got the gate.
                if !s.is_stale(now, ttl) {
                    return None;
                }
                s.transition(UploadState::Expired, now).ok()?;
                Some(s.clone())
            });
            let Some(session) = flipped else {
                continue;
            };

            UPLOAD_SESSIONS_EXPIRED.inc();
            ACTIVE_UPLOAD_SESSIONS.dec();
            info!(
                upload_id = %session.id,
                received = session.received_count(),
                total = session.total_chunks,
                "upload session expired"
            );
            if let Err(e) = self.persist(&session).await {
                warn!(upload_id = %session.id, error = %e, "failed to persist expired session");
            }
            expired.push(session.id);
        }

        expired
    }

    /// Rebuild the registry from storage after a restart.
    ///
    /// Received chunks are reconciled from the chunk store. A session left
    /// mid-assembly becomes `Complete` when its artifact is intact and
    /// `Failed` otherwise. Unreadable records are logged and skipped.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> SessionResult<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let keys = self.store().list(UPLOADS_PREFIX).await?;

        for key in keys.iter().filter(|k| k.ends_with("/session.json")) {
            match self.recover_one(key).await {
                Ok(Some(outcome)) => {
                    stats.loaded += 1;
                    match outcome {
                        UploadState::Complete => stats.completed += 1,
                        UploadState::Failed => stats.failed += 1,
                        _ => {}
                    }
                }
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unrecoverable session record");
                    stats.skipped += 1;
                }
            }
        }

        info!(
            loaded = stats.loaded,
            skipped = stats.skipped,
            completed = stats.completed,
            failed = stats.failed,
            "upload sessions recovered"
        );
        Ok(stats)
    }

    /// Load one record. Returns the state an interrupted assembly resolved
    /// to (or the loaded state), `None` if the record was skipped.
    async fn recover_one(&self, key: &str) -> SessionResult<Option<UploadState>> {
        let Some(record) = optional(self.store().get(key).await)? else {
            return Ok(None);
        };
        let mut session: UploadSession = match serde_json::from_slice(&record) {
            Ok(session) => session,
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt session record");
                return Ok(None);
            }
        };
        if session_key(&session.id) != key {
            warn!(key = %key, upload_id = %session.id, "session record under the wrong key");
            return Ok(None);
        }
        if self.sessions.contains_key(&session.id) {
            return Ok(None);
        }

        if !session.chunks_cleared {
            for index in self.chunks.list_indices(&session.id).await? {
                if let Some(meta) = optional(self.chunks.head(&session.id, index).await)? {
                    session.restore_chunk(index, meta.size, meta.last_modified);
                }
            }
        }

        if session.state == UploadState::Assembling {
            self.resolve_interrupted_assembly(&mut session).await?;
        }

        let state = session.state;
        if state == UploadState::Open {
            ACTIVE_UPLOAD_SESSIONS.inc();
        }
        UPLOAD_SESSIONS_RECOVERED.inc();
        debug!(upload_id = %session.id, state = %state, received = session.received_count(), "session recovered");

        self.sessions
            .insert(session.id, Arc::new(SessionEntry::new(session)));
        Ok(Some(state))
    }

    async fn resolve_interrupted_assembly(&self, session: &mut UploadSession) -> SessionResult<()> {
        let now = OffsetDateTime::now_utc();
        let key = artifact_key(&session.id, &session.file_name);
        let expected = session.received_bytes();

        let intact = session.is_complete()
            && optional(self.store().head(&key).await)?.is_some_and(|meta| meta.size == expected);

        let sha256 = if intact {
            let mut hasher = ContentHash::hasher();
            let mut stream = self.store().get_stream(&key).await?;
            while let Some(bytes) = stream.next().await {
                hasher.update(&bytes?);
            }
            let sha256 = hasher.finalize();
            session.checksum.is_none_or(|c| c == sha256).then_some(sha256)
        } else {
            None
        };

        match sha256 {
            Some(sha256) => {
                session.complete(
                    ArtifactHandle {
                        upload_id: session.id,
                        key,
                        size: expected,
                        sha256,
                    },
                    now,
                )?;
                info!(upload_id = %session.id, "interrupted assembly found complete artifact");
            }
            None => {
                session.fail("assembly interrupted", now)?;
                warn!(upload_id = %session.id, "interrupted assembly marked failed");
            }
        }

        self.persist(session).await
    }
}

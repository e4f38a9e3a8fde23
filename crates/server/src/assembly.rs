//! Merging received chunks into the final artifact.

use crate::gc::GarbageCollector;
use crate::metrics::{ACTIVE_UPLOAD_SESSIONS, ASSEMBLY_DURATION, UPLOAD_SESSIONS_COMPLETED, UPLOAD_SESSIONS_FAILED};
use crate::sessions::{SessionEntry, SessionError, UploadSessionManager};
use depot_core::{ArtifactHandle, ChunkIndex, ContentHash, UploadId, UploadSession, UploadState};
use depot_storage::StreamingUpload;
use depot_storage::chunk_store::artifact_key;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("upload session not found: {0}")]
    NotFound(UploadId),

    #[error("upload incomplete: {} of {total} chunks missing", missing.len())]
    Incomplete { missing: Vec<ChunkIndex>, total: u32 },

    #[error("upload cannot be assembled while {0}")]
    NotAssemblable(UploadState),

    #[error("assembly failed: {cause}")]
    Failed { cause: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<depot_core::Error> for AssemblyError {
    fn from(e: depot_core::Error) -> Self {
        Self::Session(SessionError::Core(e))
    }
}

/// What an assembly request resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssembleOutcome {
    /// This call merged the chunks.
    Assembled(ArtifactHandle),
    /// Another call already did; same artifact.
    AlreadyComplete(ArtifactHandle),
}

impl AssembleOutcome {
    pub fn handle(&self) -> &ArtifactHandle {
        match self {
            Self::Assembled(handle) | Self::AlreadyComplete(handle) => handle,
        }
    }

    pub fn into_handle(self) -> ArtifactHandle {
        match self {
            Self::Assembled(handle) | Self::AlreadyComplete(handle) => handle,
        }
    }

    /// True for the one call that performed the assembly.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Assembled(_))
    }
}

enum Start {
    Done(ArtifactHandle),
    Merge(UploadSession),
}

/// Fails a session still in `Assembling` when the merge that owns it goes
/// away without finishing, e.g. a panic inside the merge task.
struct InterruptGuard {
    entry: Arc<SessionEntry>,
    sessions: Arc<UploadSessionManager>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let interrupted = self.entry.with(|s| {
            if s.state != UploadState::Assembling {
                return None;
            }
            s.fail(INTERRUPTED, OffsetDateTime::now_utc()).ok()?;
            Some(s.clone())
        });
        let Some(session) = interrupted else {
            return;
        };

        UPLOAD_SESSIONS_FAILED.inc();
        error!(upload_id = %session.id, "assembly interrupted, chunks retained");

        // Without a runtime the record stays `Assembling` on disk and
        // recovery resolves it at the next start.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let sessions = self.sessions.clone();
            runtime.spawn(async move {
                if let Err(e) = sessions.persist(&session).await {
                    warn!(upload_id = %session.id, error = %e, "failed to persist interrupted session");
                }
            });
        }
    }
}

const INTERRUPTED: &str = "assembly interrupted";

/// Turns a fully received upload into one artifact.
///
/// At most one merge runs per upload. The merge runs on its own task, so a
/// caller that goes away mid-request cannot stop it halfway. Concurrent and
/// later callers wait on the per-upload assembly lock and then observe the
/// finished session.
#[derive(Clone)]
pub struct AssemblyCoordinator {
    sessions: Arc<UploadSessionManager>,
    gc: Arc<GarbageCollector>,
}

impl AssemblyCoordinator {
    pub fn new(sessions: Arc<UploadSessionManager>, gc: Arc<GarbageCollector>) -> Self {
        Self { sessions, gc }
    }

    /// Assemble an upload, or return the artifact of an earlier assembly.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn assemble(&self, id: &UploadId) -> Result<AssembleOutcome, AssemblyError> {
        let entry = self.sessions.get(id).ok_or(AssemblyError::NotFound(*id))?;
        let coordinator = self.clone();

        tokio::spawn(async move { coordinator.run(entry).await }.in_current_span())
            .await
            .map_err(|e| AssemblyError::Failed {
                cause: format!("{INTERRUPTED}: {e}"),
            })?
    }

    async fn run(&self, entry: Arc<SessionEntry>) -> Result<AssembleOutcome, AssemblyError> {
        let _assembly = entry.lock_assembly().await;

        let session = match self.begin(&entry).await? {
            Start::Done(handle) => return Ok(AssembleOutcome::AlreadyComplete(handle)),
            Start::Merge(session) => session,
        };
        let _interrupted = InterruptGuard {
            entry: entry.clone(),
            sessions: self.sessions.clone(),
        };

        if let Err(e) = self.sessions.persist(&session).await {
            warn!(upload_id = %session.id, error = %e, "failed to persist assembling state");
        }
        ACTIVE_UPLOAD_SESSIONS.dec();

        let started = Instant::now();
        match self.merge(&session).await {
            Ok(handle) => {
                self.finish(&entry, handle.clone()).await?;
                ASSEMBLY_DURATION.observe(started.elapsed().as_secs_f64());
                Ok(AssembleOutcome::Assembled(handle))
            }
            Err(cause) => {
                self.abandon(&entry, &cause).await?;
                Err(AssemblyError::Failed { cause })
            }
        }
    }

    /// Flip an open, fully received session to `Assembling`.
    ///
    /// Takes the ingest gate exclusively so no chunk write is in flight
    /// across the transition.
    async fn begin(&self, entry: &SessionEntry) -> Result<Start, AssemblyError> {
        let _exclusive = entry.exclusive().await;

        entry.with(|s| match s.state {
            UploadState::Complete => s
                .artifact
                .clone()
                .map(Start::Done)
                .ok_or(AssemblyError::NotAssemblable(s.state)),
            UploadState::Failed => Err(AssemblyError::Failed {
                cause: s.failure.clone().unwrap_or_default(),
            }),
            UploadState::Expired | UploadState::Assembling => {
                Err(AssemblyError::NotAssemblable(s.state))
            }
            UploadState::Open => {
                if !s.is_complete() {
                    return Err(AssemblyError::Incomplete {
                        missing: s.missing_chunks(),
                        total: s.total_chunks,
                    });
                }
                s.transition(UploadState::Assembling, OffsetDateTime::now_utc())?;
                Ok(Start::Merge(s.clone()))
            }
        })
    }

    async fn finish(&self, entry: &SessionEntry, handle: ArtifactHandle) -> Result<(), AssemblyError> {
        let id = entry.id();
        let session = entry.with(|s| {
            s.complete(handle.clone(), OffsetDateTime::now_utc())?;
            Ok::<_, depot_core::Error>(s.clone())
        })?;
        // Recovery completes an intact artifact, so a lost write is repaired.
        if let Err(e) = self.sessions.persist(&session).await {
            warn!(upload_id = %id, error = %e, "failed to persist completed session");
        }

        UPLOAD_SESSIONS_COMPLETED.inc();
        info!(
            upload_id = %id,
            key = %handle.key,
            size = handle.size,
            sha256 = %handle.sha256,
            "upload assembled"
        );

        if let Err(e) = self.gc.reclaim(&id).await {
            debug!(upload_id = %id, error = %e, "chunk reclaim deferred to the sweep");
        }
        Ok(())
    }

    async fn abandon(&self, entry: &SessionEntry, cause: &str) -> Result<(), AssemblyError> {
        let id = entry.id();
        let session = entry.with(|s| {
            s.fail(cause, OffsetDateTime::now_utc())?;
            Ok::<_, depot_core::Error>(s.clone())
        })?;
        if let Err(e) = self.sessions.persist(&session).await {
            warn!(upload_id = %id, error = %e, "failed to persist failed session");
        }

        UPLOAD_SESSIONS_FAILED.inc();
        error!(upload_id = %id, cause = %cause, "assembly failed, chunks retained");
        Ok(())
    }

    /// Stream every chunk in index order into the artifact and verify it.
    ///
    /// On failure the partial artifact is discarded and the cause returned.
    async fn merge(&self, session: &UploadSession) -> Result<ArtifactHandle, String> {
        let key = artifact_key(&session.id, &session.file_name);
        let store = self.sessions.chunks().object_store();

        let mut upload = store
            .put_stream(&key)
            .await
            .map_err(|e| format!("failed to open artifact: {e}"))?;

        let sha256 = match self.copy_chunks(session, upload.as_mut()).await {
            Ok(sha256) => sha256,
            Err(cause) => {
                if let Err(e) = upload.abort().await {
                    warn!(key = %key, error = %e, "failed to abort partial artifact");
                }
                return Err(cause);
            }
        };

        let size = upload
            .finish()
            .await
            .map_err(|e| format!("failed to write artifact: {e}"))?;

        let expected = session.received_bytes();
        let verified = if size != expected {
            Err(format!("artifact is {size} bytes, expected {expected}"))
        } else if let Some(checksum) = session.checksum
            && checksum != sha256
        {
            Err(format!("checksum mismatch: expected {checksum}, got {sha256}"))
        } else {
            Ok(())
        };

        if let Err(cause) = verified {
            if let Err(e) = store.delete(&key).await {
                warn!(key = %key, error = %e, "failed to delete unverified artifact");
            }
            return Err(cause);
        }

        Ok(ArtifactHandle {
            upload_id: session.id,
            key,
            size,
            sha256,
        })
    }

    async fn copy_chunks(
        &self,
        session: &UploadSession,
        upload: &mut dyn StreamingUpload,
    ) -> Result<ContentHash, String> {
        let chunks = self.sessions.chunks();
        let mut hasher = ContentHash::hasher();

        for index in 0..session.total_chunks {
            let expected = session
                .chunk_size(index)
                .ok_or_else(|| format!("chunk {index} was never received"))?;
            let mut stream = chunks
                .read_stream(&session.id, index)
                .await
                .map_err(|e| format!("chunk {index} unreadable: {e}"))?;

            let mut read = 0u64;
            while let Some(bytes) = stream.next().await {
                let bytes = bytes.map_err(|e| format!("chunk {index} unreadable: {e}"))?;
                read += bytes.len() as u64;
                hasher.update(&bytes);
                upload
                    .write(bytes)
                    .await
                    .map_err(|e| format!("failed to write artifact: {e}"))?;
            }

            if read != expected {
                return Err(format!("chunk {index} is {read} bytes, expected {expected}"));
            }
        }

        Ok(hasher.finalize())
    }
}

//! Periodic reclamation of upload storage.

use crate::metrics::{GC_BYTES_RECLAIMED, GC_DELETE_FAILURES, GC_SESSIONS_RECLAIMED, GC_SWEEP_DURATION};
use crate::sessions::{SessionEntry, UploadSessionManager};
use depot_core::config::GcConfig;
use depot_core::{UploadId, UploadState};
use depot_storage::chunk_store::{artifacts_prefix, upload_prefix};
use depot_storage::{PrefixDeletion, StorageError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counts from one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// Open sessions that passed the upload timeout during this sweep.
    pub sessions_expired: u64,
    /// Expired or failed sessions whose storage was deleted.
    pub sessions_reclaimed: u64,
    /// Complete sessions whose retained record was dropped.
    pub records_dropped: u64,
    /// Complete sessions whose chunks were reclaimed on retry.
    pub chunks_retried: u64,
    pub objects_deleted: u64,
    pub bytes_reclaimed: u64,
    /// Deletions that failed and will be retried next sweep.
    pub errors: u64,
}

/// Reclaims chunk storage for finished, expired and failed uploads.
///
/// Never deletes anything that belongs to an `Open` or `Assembling` session.
pub struct GarbageCollector {
    sessions: Arc<UploadSessionManager>,
    config: GcConfig,
    upload_timeout: Duration,
}

impl GarbageCollector {
    pub fn new(sessions: Arc<UploadSessionManager>, config: GcConfig, upload_timeout: Duration) -> Self {
        Self {
            sessions,
            config,
            upload_timeout,
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Delete the chunks of a completed upload.
    ///
    /// Called right after assembly succeeds and retried by the sweep when
    /// that first attempt fails. A no-op for sessions in any other state.
    pub async fn reclaim(&self, id: &UploadId) -> Result<PrefixDeletion, StorageError> {
        let Some(entry) = self.sessions.get(id) else {
            return Ok(PrefixDeletion::default());
        };
        let eligible = entry.with(|s| s.state == UploadState::Complete && !s.chunks_cleared);
        if !eligible {
            return Ok(PrefixDeletion::default());
        }

        let deleted = self.sessions.chunks().delete_all(id).await.inspect_err(|e| {
            GC_DELETE_FAILURES.inc();
            warn!(upload_id = %id, error = %e, "failed to reclaim chunks, will retry");
        })?;

        let session = entry.with(|s| {
            s.chunks_cleared = true;
            s.clone()
        });
        if let Err(e) = self.sessions.persist(&session).await {
            warn!(upload_id = %id, error = %e, "failed to persist cleared-chunks flag");
        }

        GC_BYTES_RECLAIMED.inc_by(deleted.bytes);
        debug!(
            upload_id = %id,
            objects = deleted.objects,
            bytes = deleted.bytes,
            "reclaimed chunks of completed upload"
        );
        Ok(deleted)
    }

    /// Run one sweep over every registered session.
    pub async fn sweep(&self, now: OffsetDateTime) -> SweepStats {
        let started = Instant::now();
        let mut stats = SweepStats {
            sessions_expired: self
                .sessions
                .expire_stale(now, self.upload_timeout)
                .await
                .len() as u64,
            ..SweepStats::default()
        };

        for entry in self.sessions.entries() {
            self.sweep_one(&entry, now, &mut stats).await;
        }

        GC_SWEEP_DURATION.observe(started.elapsed().as_secs_f64());
        info!(
            expired = stats.sessions_expired,
            reclaimed = stats.sessions_reclaimed,
            records_dropped = stats.records_dropped,
            bytes = stats.bytes_reclaimed,
            errors = stats.errors,
            "gc sweep finished"
        );
        stats
    }

    async fn sweep_one(&self, entry: &SessionEntry, now: OffsetDateTime, stats: &mut SweepStats) {
        let id = entry.id();
        let (state, age, chunks_cleared) =
            entry.with(|s| (s.state, s.time_in_state(now), s.chunks_cleared));

        match state {
            UploadState::Open | UploadState::Assembling => {}
            UploadState::Complete if !chunks_cleared => match self.reclaim(&id).await {
                Ok(deleted) => {
                    stats.chunks_retried += 1;
                    stats.objects_deleted += deleted.objects;
                    stats.bytes_reclaimed += deleted.bytes;
                }
                Err(_) => stats.errors += 1,
            },
            UploadState::Complete => {
                if age < self.config.complete_retention() {
                    return;
                }
                // Only the record is left; the artifact lives elsewhere.
                match self.delete_prefixes(&id, false).await {
                    Ok(_) => {
                        self.sessions.remove(&id);
                        stats.records_dropped += 1;
                        debug!(upload_id = %id, "dropped retained session record");
                    }
                    Err(_) => stats.errors += 1,
                }
            }
            UploadState::Expired | UploadState::Failed => {
                if age < self.config.grace_period() {
                    return;
                }
                match self.delete_prefixes(&id, state == UploadState::Failed).await {
                    Ok(deleted) => {
                        self.sessions.remove(&id);
                        stats.sessions_reclaimed += 1;
                        stats.objects_deleted += deleted.objects;
                        stats.bytes_reclaimed += deleted.bytes;
                        GC_SESSIONS_RECLAIMED.inc();
                        GC_BYTES_RECLAIMED.inc_by(deleted.bytes);
                        info!(
                            upload_id = %id,
                            state = %state,
                            bytes = deleted.bytes,
                            "reclaimed upload session"
                        );
                    }
                    Err(_) => stats.errors += 1,
                }
            }
        }
    }

    /// Delete everything stored under the session, and optionally the
    /// leftover artifact directory of a failed assembly.
    async fn delete_prefixes(
        &self,
        id: &UploadId,
        with_artifacts: bool,
    ) -> Result<PrefixDeletion, StorageError> {
        let store = self.sessions.chunks().object_store();
        let mut deleted = PrefixDeletion::default();

        let mut prefixes = vec![upload_prefix(id)];
        if with_artifacts {
            prefixes.push(artifacts_prefix(id));
        }
        for prefix in prefixes {
            deleted += store.delete_prefix(&prefix).await.inspect_err(|e| {
                GC_DELETE_FAILURES.inc();
                warn!(upload_id = %id, prefix = %prefix, error = %e, "delete failed, will retry");
            })?;
        }
        Ok(deleted)
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "gc sweep loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; recovery just ran.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let gc = self.clone();
                // Run each sweep in its own task so a panic is reported
                // and the loop keeps going.
                let sweep = tokio::spawn(async move { gc.sweep(OffsetDateTime::now_utc()).await });
                if let Err(e) = sweep.await {
                    error!(error = %e, "gc sweep panicked");
                }
            }
        })
    }
}

//! Application state shared across handlers.

use crate::assembly::AssemblyCoordinator;
use crate::gc::GarbageCollector;
use crate::sessions::{SessionLimits, UploadSessionManager};
use depot_core::config::AppConfig;
use depot_storage::{ChunkStore, ObjectStore};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Registry of upload sessions.
    pub sessions: Arc<UploadSessionManager>,
    /// Chunk merger.
    pub assembler: Arc<AssemblyCoordinator>,
    /// Storage reclamation.
    pub gc: Arc<GarbageCollector>,
}

impl AppState {
    /// Wire the session manager, assembler and collector onto `storage`.
    ///
    /// The configuration is expected to be validated already.
    pub fn new(config: AppConfig, storage: Arc<dyn ObjectStore>) -> Self {
        let sessions = Arc::new(UploadSessionManager::new(
            ChunkStore::new(storage.clone()),
            SessionLimits::from(&config.server),
        ));
        let gc = Arc::new(GarbageCollector::new(
            sessions.clone(),
            config.gc.clone(),
            config.server.upload_timeout(),
        ));
        let assembler = Arc::new(AssemblyCoordinator::new(sessions.clone(), gc.clone()));

        Self {
            config: Arc::new(config),
            storage,
            sessions,
            assembler,
            gc,
        }
    }
}

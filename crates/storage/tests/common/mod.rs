pub mod fixtures;

use depot_storage::{ChunkStore, FilesystemBackend};
use std::sync::Arc;
use tempfile::TempDir;

/// A chunk store on a fresh temp directory. Keep the `TempDir` alive.
#[allow(dead_code)]
pub async fn temp_chunk_store() -> (TempDir, Arc<FilesystemBackend>, ChunkStore) {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
    let chunks = ChunkStore::new(backend.clone());
    (dir, backend, chunks)
}

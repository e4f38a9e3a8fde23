//! Per-upload chunk persistence and the storage key layout.
//!
//! Layout under the storage root:
//!
//! ```text
//! uploads/<upload_id>/session.json
//! uploads/<upload_id>/chunks/<index, 10 digits>
//! artifacts/<upload_id>/<file_name>
//! ```

use crate::error::StorageResult;
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, PrefixDeletion};
use bytes::Bytes;
use depot_core::{ChunkIndex, FileName, UploadId};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Prefix holding every upload session.
pub const UPLOADS_PREFIX: &str = "uploads/";

/// Prefix holding assembled artifacts.
pub const ARTIFACTS_PREFIX: &str = "artifacts/";

/// Prefix for everything stored for one upload session.
pub fn upload_prefix(id: &UploadId) -> String {
    format!("{UPLOADS_PREFIX}{id}/")
}

/// Key of the durable session record.
pub fn session_key(id: &UploadId) -> String {
    format!("{UPLOADS_PREFIX}{id}/session.json")
}

/// Prefix holding an upload's chunks.
pub fn chunks_prefix(id: &UploadId) -> String {
    format!("{UPLOADS_PREFIX}{id}/chunks/")
}

/// Key of one chunk. Zero-padded so lexical order matches index order.
pub fn chunk_key(id: &UploadId, index: ChunkIndex) -> String {
    format!("{UPLOADS_PREFIX}{id}/chunks/{index:010}")
}

/// Prefix holding an upload's artifact.
pub fn artifacts_prefix(id: &UploadId) -> String {
    format!("{ARTIFACTS_PREFIX}{id}/")
}

/// Key of an assembled artifact.
pub fn artifact_key(id: &UploadId, file_name: &FileName) -> String {
    format!("{ARTIFACTS_PREFIX}{id}/{file_name}")
}

/// Parse a chunk index from the last key segment. Temp files and
/// anything else that is not exactly ten digits yield `None`.
fn parse_chunk_index(name: &str) -> Option<ChunkIndex> {
    if name.len() != 10 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Stores chunk payloads for upload sessions on an [`ObjectStore`].
///
/// Each chunk is one object. Writing an index that already exists replaces
/// it atomically, so concurrent duplicates leave exactly one whole payload.
#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn ObjectStore>,
}

impl ChunkStore {
    /// Create a chunk store on top of `store`.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// The underlying object store.
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Persist one chunk, replacing any earlier payload for the same index.
    #[instrument(skip(self, data), fields(upload_id = %id, size = data.len()))]
    pub async fn write(&self, id: &UploadId, index: ChunkIndex, data: Bytes) -> StorageResult<()> {
        self.store.put(&chunk_key(id, index), data).await
    }

    /// Read a whole chunk.
    pub async fn read(&self, id: &UploadId, index: ChunkIndex) -> StorageResult<Bytes> {
        self.store.get(&chunk_key(id, index)).await
    }

    /// Stream a chunk's bytes.
    pub async fn read_stream(&self, id: &UploadId, index: ChunkIndex) -> StorageResult<ByteStream> {
        self.store.get_stream(&chunk_key(id, index)).await
    }

    /// Size and modification time of a stored chunk.
    pub async fn head(&self, id: &UploadId, index: ChunkIndex) -> StorageResult<ObjectMeta> {
        self.store.head(&chunk_key(id, index)).await
    }

    /// Delete one chunk. Deleting a missing chunk succeeds.
    pub async fn delete(&self, id: &UploadId, index: ChunkIndex) -> StorageResult<()> {
        match self.store.delete(&chunk_key(id, index)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete every chunk of an upload, leaving the session record.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn delete_all(&self, id: &UploadId) -> StorageResult<PrefixDeletion> {
        let deleted = self.store.delete_prefix(&chunks_prefix(id)).await?;
        debug!(
            objects = deleted.objects,
            bytes = deleted.bytes,
            "deleted upload chunks"
        );
        Ok(deleted)
    }

    /// Indices of the chunks currently stored for an upload, ascending.
    pub async fn list_indices(&self, id: &UploadId) -> StorageResult<Vec<ChunkIndex>> {
        let prefix = chunks_prefix(id);
        let keys = self.store.list(&prefix).await?;

        let mut indices: Vec<ChunkIndex> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(parse_chunk_index)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

/// Map a missing object to `None`.
pub fn optional<T>(result: StorageResult<T>) -> StorageResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

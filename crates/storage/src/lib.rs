//! Object storage abstraction and backends for depot.
//!
//! This crate provides:
//! - An object store trait with atomic puts and streaming uploads
//! - A local filesystem backend
//! - Chunk persistence for upload sessions and the on-disk key layout

pub mod backends;
pub mod chunk_store;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use chunk_store::ChunkStore;
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, PrefixDeletion, StreamingUpload};

use depot_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}

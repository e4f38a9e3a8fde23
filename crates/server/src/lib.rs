//! HTTP ingest service for chunked large-file uploads.
//!
//! This crate provides:
//! - The upload session registry and chunk ingest path
//! - Exactly-once assembly of fully received uploads
//! - Periodic reclamation of expired, failed and finished uploads
//! - The HTTP API and the `depotd` binary

pub mod assembly;
pub mod error;
pub mod gc;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod sessions;
pub mod state;

pub use assembly::{AssembleOutcome, AssemblyCoordinator, AssemblyError};
pub use error::ApiError;
pub use gc::{GarbageCollector, SweepStats};
pub use routes::create_router;
pub use sessions::{SessionError, UploadSessionManager};
pub use state::AppState;

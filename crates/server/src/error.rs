//! API error types.

use crate::assembly::AssemblyError;
use crate::metrics::record_upload_error;
use crate::sessions::SessionError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use depot_core::ChunkIndex;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always false.
    pub success: bool,
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Chunk indices still outstanding, for incomplete uploads.
    #[serde(rename = "missingChunks", skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<ChunkIndex>>,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("incomplete upload: {} of {total} chunks missing", missing.len())]
    IncompleteUpload { missing: Vec<ChunkIndex>, total: u32 },

    #[error("assembly failed: {0}")]
    AssemblyFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] depot_storage::StorageError),

    #[error("{0}")]
    Core(#[from] depot_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::IncompleteUpload { .. } => "incomplete_upload",
            Self::AssemblyFailed(_) => "assembly_failed",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
            Self::Core(e) => match e {
                depot_core::Error::SessionNotOpen(_) => "session_not_open",
                depot_core::Error::InvalidStateTransition { .. } => "invalid_state",
                depot_core::Error::UploadTooLarge { .. } => "upload_too_large",
                depot_core::Error::InconsistentTotalChunks { .. } => "inconsistent_total_chunks",
                depot_core::Error::ChunkIndexOutOfRange { .. } => "chunk_index_out_of_range",
                _ => "validation_error",
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::AssemblyFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                depot_storage::StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(e) => match e {
                depot_core::Error::SessionNotOpen(_)
                | depot_core::Error::InvalidStateTransition { .. } => StatusCode::CONFLICT,
                depot_core::Error::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            },
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(id) => Self::NotFound(format!("upload session {id}")),
            SessionError::Core(e) => Self::Core(e),
            SessionError::Storage(e) => Self::Storage(e),
            SessionError::Encode(e) => Self::Internal(format!("failed to encode session: {e}")),
        }
    }
}

impl From<AssemblyError> for ApiError {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::NotFound(id) => Self::NotFound(format!("upload session {id}")),
            AssemblyError::Incomplete { missing, total } => {
                Self::IncompleteUpload { missing, total }
            }
            AssemblyError::NotAssemblable(state) => {
                Self::Conflict(format!("upload cannot be assembled while {state}"))
            }
            AssemblyError::Failed { cause } => Self::AssemblyFailed(cause),
            AssemblyError::Session(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        record_upload_error(code);

        if status.is_server_error() {
            tracing::error!(code, error = %self, "request failed");
        } else {
            tracing::debug!(code, error = %self, "request rejected");
        }

        let missing_chunks = match &self {
            Self::IncompleteUpload { missing, .. } => Some(missing.clone()),
            _ => None,
        };
        let body = ErrorResponse {
            success: false,
            code: code.to_string(),
            message: self.to_string(),
            missing_chunks,
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

//! Chunked upload handlers.

use crate::error::{ApiError, ApiResult};
use crate::metrics::CHUNK_UPLOAD_DURATION;
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use depot_core::{ArtifactHandle, ChunkIndex, ContentHash, FileName, UploadId, UploadState};
use serde::Serialize;
use std::time::Instant;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Reference to an assembled artifact.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactResponse {
    pub upload_id: String,
    /// Object store key of the artifact.
    pub key: String,
    pub size: u64,
    pub sha256: String,
}

impl From<&ArtifactHandle> for ArtifactResponse {
    fn from(handle: &ArtifactHandle) -> Self {
        Self {
            upload_id: handle.upload_id.to_string(),
            key: handle.key.clone(),
            size: handle.size,
            sha256: handle.sha256.to_hex(),
        }
    }
}

/// Response to an accepted chunk.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub message: String,
    /// Session the chunk was recorded against. Clients send this back with
    /// every further chunk; it differs from the one sent when a fresh
    /// session had to be started.
    pub upload_id: String,
    pub received_chunks: usize,
    pub total_chunks: u32,
    /// True once the artifact has been assembled.
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactResponse>,
}

/// Response to a finalize request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub success: bool,
    pub message: String,
    pub upload_id: String,
    pub artifact: ArtifactResponse,
}

/// Upload progress.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub file_name: String,
    pub state: UploadState,
    pub total_chunks: u32,
    pub received_chunks: usize,
    pub missing_chunks: Vec<ChunkIndex>,
    pub bytes_received: u64,
    pub created_at: String,
    pub last_chunk_at: String,
    /// When an open session expires if no further chunk arrives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactResponse>,
}

/// Raw multipart fields of a chunk upload.
#[derive(Default)]
struct ChunkForm {
    chunk: Option<Bytes>,
    chunk_file_name: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    file_name: Option<String>,
    upload_id: Option<String>,
    checksum: Option<String>,
}

/// A validated chunk upload.
#[derive(Debug)]
struct ChunkRequest {
    data: Bytes,
    index: ChunkIndex,
    total_chunks: u32,
    file_name: FileName,
    upload_id: Option<UploadId>,
    checksum: Option<ContentHash>,
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(e.body_text())
    } else {
        ApiError::BadRequest(e.body_text())
    }
}

async fn read_form(mut multipart: Multipart) -> ApiResult<ChunkForm> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => {
                form.chunk_file_name = field.file_name().map(str::to_string);
                form.chunk = Some(field.bytes().await.map_err(multipart_error)?);
            }
            "chunkIndex" => form.chunk_index = Some(field.text().await.map_err(multipart_error)?),
            "totalChunks" => form.total_chunks = Some(field.text().await.map_err(multipart_error)?),
            "fileName" => form.file_name = Some(field.text().await.map_err(multipart_error)?),
            "uploadId" => form.upload_id = Some(field.text().await.map_err(multipart_error)?),
            "checksum" => form.checksum = Some(field.text().await.map_err(multipart_error)?),
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    Ok(form)
}

/// Treat absent and blank text fields alike.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_count(field: &str, value: Option<String>) -> ApiResult<u32> {
    let value = non_blank(value)
        .ok_or_else(|| ApiError::BadRequest(format!("missing field `{field}`")))?;
    value.parse::<u32>().map_err(|_| {
        ApiError::BadRequest(format!(
            "`{field}` must be a non-negative integer, got {value:?}"
        ))
    })
}

impl ChunkForm {
    fn validate(self, max_chunk_size: u64) -> ApiResult<ChunkRequest> {
        let data = self
            .chunk
            .ok_or_else(|| ApiError::BadRequest("missing field `chunk`".to_string()))?;
        if data.len() as u64 > max_chunk_size {
            return Err(ApiError::PayloadTooLarge(format!(
                "chunk is {} bytes (max {max_chunk_size})",
                data.len()
            )));
        }

        let index = parse_count("chunkIndex", self.chunk_index)?;
        let total_chunks = parse_count("totalChunks", self.total_chunks)?;
        if total_chunks == 0 {
            return Err(ApiError::BadRequest("`totalChunks` must be positive".to_string()));
        }
        if index >= total_chunks {
            return Err(depot_core::Error::ChunkIndexOutOfRange {
                index,
                total: total_chunks,
            }
            .into());
        }

        let raw_name = non_blank(self.file_name)
            .or(self.chunk_file_name)
            .ok_or_else(|| ApiError::BadRequest("missing field `fileName`".to_string()))?;
        let file_name = FileName::parse(&raw_name)?;

        let upload_id = non_blank(self.upload_id)
            .map(|id| UploadId::parse(&id))
            .transpose()?;
        let checksum = non_blank(self.checksum)
            .map(|hex| ContentHash::from_hex(&hex))
            .transpose()?;

        Ok(ChunkRequest {
            data,
            index,
            total_chunks,
            file_name,
            upload_id,
            checksum,
        })
    }
}

fn format_time(at: OffsetDateTime) -> ApiResult<String> {
    at.format(&Rfc3339)
        .map_err(|e| ApiError::Internal(format!("failed to format timestamp: {e}")))
}

fn parse_upload_id(raw: &str) -> ApiResult<UploadId> {
    UploadId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// POST /v1/uploads/chunks - Upload one chunk.
///
/// The first chunk of an upload omits `uploadId` and gets one back. The
/// request that completes the received set also assembles the artifact.
#[tracing::instrument(
    skip(state, multipart),
    fields(upload_id = tracing::field::Empty, chunk_index = tracing::field::Empty)
)]
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ChunkUploadResponse>> {
    let start_time = Instant::now();
    let multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let request = read_form(multipart)
        .await?
        .validate(state.config.server.max_chunk_size)?;
    let span = tracing::Span::current();
    span.record("chunk_index", request.index);

    let entry = state
        .sessions
        .get_or_create(
            request.upload_id,
            request.total_chunks,
            &request.file_name,
            request.checksum,
        )
        .await?;
    span.record("upload_id", tracing::field::display(entry.id()));

    let receipt = state
        .sessions
        .receive_chunk(&entry, request.index, request.data)
        .await?;
    CHUNK_UPLOAD_DURATION.observe(start_time.elapsed().as_secs_f64());

    if !receipt.is_now_complete {
        return Ok(Json(ChunkUploadResponse {
            success: true,
            message: format!(
                "chunk {} received ({} of {})",
                request.index, receipt.received_chunks, receipt.total_chunks
            ),
            upload_id: receipt.upload_id.to_string(),
            received_chunks: receipt.received_chunks,
            total_chunks: receipt.total_chunks,
            complete: false,
            artifact: None,
        }));
    }

    tracing::info!(upload_id = %receipt.upload_id, "all chunks received, assembling");
    let outcome = state.assembler.assemble(&receipt.upload_id).await?;

    Ok(Json(ChunkUploadResponse {
        success: true,
        message: "upload complete".to_string(),
        upload_id: receipt.upload_id.to_string(),
        received_chunks: receipt.received_chunks,
        total_chunks: receipt.total_chunks,
        complete: true,
        artifact: Some(outcome.handle().into()),
    }))
}

/// POST /v1/uploads/{upload_id}/finalize - Assemble a fully received upload.
///
/// Idempotent: finalizing a completed upload returns the same artifact.
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn finalize_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<FinalizeResponse>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let outcome = state.assembler.assemble(&upload_id).await?;

    let message = if outcome.is_fresh() {
        "upload assembled"
    } else {
        "upload already assembled"
    };

    Ok(Json(FinalizeResponse {
        success: true,
        message: message.to_string(),
        upload_id: upload_id.to_string(),
        artifact: outcome.handle().into(),
    }))
}

/// GET /v1/uploads/{upload_id} - Query upload progress.
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let upload_id = parse_upload_id(&upload_id)?;
    let session = state
        .sessions
        .snapshot(&upload_id)
        .ok_or_else(|| ApiError::NotFound(format!("upload session {upload_id}")))?;

    let expires_at = match session.expires_at(state.config.server.upload_timeout()) {
        Some(at) if session.state == UploadState::Open => Some(format_time(at)?),
        _ => None,
    };

    Ok(Json(UploadStatusResponse {
        upload_id: session.id.to_string(),
        file_name: session.file_name.to_string(),
        state: session.state,
        total_chunks: session.total_chunks,
        received_chunks: session.received_count(),
        missing_chunks: session.missing_chunks(),
        bytes_received: session.received_bytes(),
        created_at: format_time(session.created_at)?,
        last_chunk_at: format_time(session.last_chunk_at)?,
        expires_at,
        failure: session.failure.clone(),
        artifact: session.artifact.as_ref().map(ArtifactResponse::from),
    }))
}

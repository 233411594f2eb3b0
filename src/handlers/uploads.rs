//! Resumable upload endpoints.
//!
//! Thin wrappers over [`crate::upload::SessionRegistry`]: they pull the
//! owner out of request extensions, validate the wire arguments, and hand
//! everything else to the registry.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::{Extension, Json};
use garde::Validate;
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use super::query_params;
use crate::errors::UploadError;
use crate::identity::Owner;
use crate::upload::{BeginOutcome, ChunkOutcome, SessionStatus};
use crate::AppState;

/// Body of `POST /api/upload-init`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeginUploadRequest {
    /// Target name; a single path component.
    #[garde(length(min = 1, max = 255), pattern(r"^[^/\\\x00]+$"))]
    pub filename: String,
    /// Total size of the file in bytes.
    #[garde(range(min = 1))]
    pub file_size: u64,
    /// Chunk size in bytes; the server default applies when omitted.
    #[garde(range(min = 1))]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct SessionQuery {
    /// Session id returned by `upload-init`.
    pub session_id: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ChunkQuery {
    pub session_id: String,
    /// Zero-based chunk index.
    pub chunk_index: u64,
}

/// `POST /api/upload-init` -- begin or resume an upload.
#[utoipa::path(
    post,
    path = "/api/upload-init",
    tag = "Upload",
    operation_id = "BeginUpload",
    request_body = BeginUploadRequest,
    responses(
        (status = 200, description = "Session created or rejoined", body = BeginOutcome),
        (status = 400, description = "Invalid file or chunk size"),
        (status = 401, description = "No identity"),
        (status = 409, description = "Another upload of this file is open with a different layout"),
        (status = 413, description = "File exceeds the configured maximum")
    )
)]
pub async fn begin_upload(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    request: Result<Json<BeginUploadRequest>, JsonRejection>,
) -> Result<Json<BeginOutcome>, UploadError> {
    let Json(request) =
        request.map_err(|rejection| UploadError::invalid_chunk(rejection.body_text()))?;
    request
        .validate()
        .map_err(|report| UploadError::invalid_chunk(report.to_string()))?;

    let chunk_size = request
        .chunk_size
        .unwrap_or(state.config.uploads.chunk_size);
    let outcome = state
        .registry
        .create(owner.as_str(), &request.filename, request.file_size, chunk_size)
        .await?;
    Ok(Json(outcome))
}

/// `GET /api/upload-status` -- which chunks have arrived.
#[utoipa::path(
    get,
    path = "/api/upload-status",
    tag = "Upload",
    operation_id = "UploadStatus",
    params(SessionQuery),
    responses(
        (status = 200, description = "Session status", body = SessionStatus),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> Result<Json<SessionStatus>, UploadError> {
    let query = query_params(query)?;
    let status = state.registry.status(&query.session_id, owner.as_str())?;
    Ok(Json(status))
}

/// `POST /api/upload-resumable` -- stage one chunk.
#[utoipa::path(
    post,
    path = "/api/upload-resumable",
    tag = "Upload",
    operation_id = "UploadChunk",
    params(ChunkQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Chunk stored", body = ChunkOutcome),
        (status = 400, description = "Chunk index or length invalid"),
        (status = 404, description = "Unknown session"),
        (status = 500, description = "Write or promotion failed")
    )
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    query: Result<Query<ChunkQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Json<ChunkOutcome>, UploadError> {
    let query = query_params(query)?;
    let outcome = state
        .registry
        .submit_chunk(&query.session_id, owner.as_str(), query.chunk_index, body)
        .await?;
    Ok(Json(outcome))
}

/// `POST /api/upload-complete` -- retry finalization of a fully staged
/// session.
#[utoipa::path(
    post,
    path = "/api/upload-complete",
    tag = "Upload",
    operation_id = "CompleteUpload",
    params(SessionQuery),
    responses(
        (status = 200, description = "File finalized", body = ChunkOutcome),
        (status = 400, description = "Chunks still missing"),
        (status = 404, description = "Unknown session"),
        (status = 500, description = "Promotion failed")
    )
)]
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> Result<Json<ChunkOutcome>, UploadError> {
    let query = query_params(query)?;
    state
        .registry
        .complete(&query.session_id, owner.as_str())
        .await?;
    Ok(Json(ChunkOutcome {
        success: true,
        complete: true,
        progress_percent: 100.0,
    }))
}

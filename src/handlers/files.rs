//! Whole-file endpoints: non-resumable upload, download, and ping.

use std::io;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use super::query_params;
use crate::errors::UploadError;
use crate::identity::Owner;
use crate::storage::backend::ExceedsLimit;
use crate::storage::validate_name;
use crate::AppState;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct FileQuery {
    /// Name of the file within the caller's storage root.
    pub filename: String,
}

impl FileQuery {
    fn checked(self) -> Result<String, UploadError> {
        validate_name(&self.filename)
            .map_err(|e| UploadError::bad_request(format!("invalid filename: {e}")))?;
        Ok(self.filename)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadReceipt {
    pub success: bool,
    pub filename: String,
    pub size: u64,
}

/// `POST /api/upload` -- store a whole file in one request.
///
/// The body is streamed to a private name and renamed into place, so a
/// reader never sees a partially written file and the server never holds
/// the whole body in memory.
#[utoipa::path(
    post,
    path = "/api/upload",
    tag = "Files",
    operation_id = "UploadFile",
    params(FileQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "File stored", body = UploadReceipt),
        (status = 400, description = "Invalid filename"),
        (status = 413, description = "File exceeds the configured maximum")
    )
)]
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    query: Result<Query<FileQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadReceipt>, UploadError> {
    let filename = query_params(query)?.checked()?;
    let limit = state.config.server.max_file_size;
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(UploadError::TooLarge { limit });
    }

    let source = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let size = state
        .storage
        .put(owner.as_str(), &filename, Box::pin(source), limit)
        .await
        .map_err(|e| match e.downcast_ref::<ExceedsLimit>() {
            Some(_) => UploadError::TooLarge { limit },
            None => UploadError::IoFailure(e),
        })?;
    info!(owner = %owner.as_str(), filename = %filename, size, "whole file stored");

    Ok(Json(UploadReceipt {
        success: true,
        filename,
        size,
    }))
}

/// `GET /api/download` -- fetch a finalized file.
#[utoipa::path(
    get,
    path = "/api/download",
    tag = "Files",
    operation_id = "DownloadFile",
    params(FileQuery),
    responses(
        (status = 200, description = "File contents"),
        (status = 404, description = "No such file")
    )
)]
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Extension(owner): Extension<Owner>,
    query: Result<Query<FileQuery>, QueryRejection>,
) -> Result<Response, UploadError> {
    let filename = query_params(query)?.checked()?;
    let file = state
        .storage
        .open(owner.as_str(), &filename)
        .await
        .map_err(UploadError::IoFailure)?
        .ok_or_else(|| UploadError::FileNotFound {
            filename: filename.clone(),
        })?;

    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', "_"));
    let disposition =
        HeaderValue::from_str(&disposition).map_err(|e| UploadError::InternalError(e.into()))?;

    let body = Body::from_stream(ReaderStream::new(file.reader));
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.len));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// `GET|HEAD|POST /api/ping` -- liveness and bandwidth probe.
///
/// A POST body is read fully and its length echoed in
/// `x-received-bytes`, which lets a client time an upload of known size.
#[utoipa::path(
    post,
    path = "/api/ping",
    tag = "Files",
    operation_id = "Ping",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Alive")
    )
)]
pub async fn ping(method: Method, body: Bytes) -> Response {
    let mut response = (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"pong":true}"#,
    )
        .into_response();
    if method == Method::POST {
        response
            .headers_mut()
            .insert("x-received-bytes", HeaderValue::from(body.len()));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_query_rejects_traversal() {
        let bad = FileQuery {
            filename: "../secret".to_string(),
        };
        assert!(matches!(bad.checked(), Err(UploadError::BadRequest { .. })));

        let staging = FileQuery {
            filename: ".staging".to_string(),
        };
        assert!(staging.checked().is_err());

        let ok = FileQuery {
            filename: "report.pdf".to_string(),
        };
        assert_eq!(ok.checked().unwrap(), "report.pdf");
    }
}

//! Upload error types.
//!
//! Every variant maps to a stable error code and HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(UploadError::NotFound { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the upload core and the request layer.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The session does not exist, has expired, or belongs to another owner.
    #[error("Upload session {session_id} does not exist; start a new upload")]
    NotFound { session_id: String },

    /// Out-of-range chunk index, wrong chunk length, or a malformed
    /// size/chunk-size pair at creation.
    #[error("{message}")]
    InvalidChunk { message: String },

    /// An upload of the same file with a different layout is still open.
    #[error("An upload of {filename} with a different size or chunk size is already in progress")]
    SessionConflict { filename: String },

    /// The underlying storage write or promotion failed.
    #[error("Storage operation failed; the request can be retried")]
    IoFailure(anyhow::Error),

    /// No identity could be resolved for the request.
    #[error("Unauthorized")]
    Unauthorized,

    /// A request argument is missing or malformed.
    #[error("{message}")]
    BadRequest { message: String },

    /// The requested finalized file does not exist.
    #[error("File not found: {filename}")]
    FileNotFound { filename: String },

    /// The declared or received size exceeds the configured limit.
    #[error("Upload exceeds the maximum allowed size of {limit} bytes")]
    TooLarge { limit: u64 },

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl UploadError {
    /// Return the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::NotFound { .. } => "NotFound",
            UploadError::InvalidChunk { .. } => "InvalidChunk",
            UploadError::SessionConflict { .. } => "SessionConflict",
            UploadError::IoFailure(_) => "IOFailure",
            UploadError::Unauthorized => "Unauthorized",
            UploadError::BadRequest { .. } => "BadRequest",
            UploadError::FileNotFound { .. } => "FileNotFound",
            UploadError::TooLarge { .. } => "TooLarge",
            UploadError::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::NotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::InvalidChunk { .. } => StatusCode::BAD_REQUEST,
            UploadError::SessionConflict { .. } => StatusCode::CONFLICT,
            UploadError::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Unauthorized => StatusCode::UNAUTHORIZED,
            UploadError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            UploadError::FileNotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn invalid_chunk(message: impl Into<String>) -> Self {
        UploadError::InvalidChunk {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(session_id: &str) -> Self {
        UploadError::NotFound {
            session_id: session_id.to_string(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        UploadError::BadRequest {
            message: message.into(),
        }
    }
}

/// JSON error body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    request_id: &'a str,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(code = self.code(), request_id = %request_id, "{:#}", log_detail(&self));
        }

        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            request_id: &request_id,
        };
        let body = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id),
            ],
            body,
        )
            .into_response()
    }
}

/// The underlying cause for server-side logging; the public message stays generic.
fn log_detail(err: &UploadError) -> String {
    match err {
        UploadError::IoFailure(e) | UploadError::InternalError(e) => format!("{e:#}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_status_codes() {
        let not_found = UploadError::NotFound {
            session_id: "abc".to_string(),
        };
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.code(), "NotFound");

        let invalid = UploadError::invalid_chunk("index 7 out of range");
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.to_string(), "index 7 out of range");

        let io = UploadError::IoFailure(anyhow::anyhow!("disk full"));
        assert_eq!(io.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(io.code(), "IOFailure");
    }

    #[tokio::test]
    async fn test_into_response_renders_json() {
        let response = UploadError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("x-request-id"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Unauthorized");
        assert_eq!(json["requestId"].as_str().unwrap().len(), 16);
    }
}

//! HTTP handlers.
//!
//! - [`uploads`] -- the resumable session endpoints (`/api/upload-*`).
//! - [`files`] -- whole-file upload, download, and the ping probe.

pub mod files;
pub mod uploads;

use axum::extract::rejection::QueryRejection;
use axum::extract::Query;

use crate::errors::UploadError;

/// Unwrap a query extractor, turning a missing or malformed parameter
/// into a JSON `BadRequest` instead of axum's plain-text rejection.
pub(crate) fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, UploadError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| UploadError::bad_request(rejection.body_text()))
}

//! Abstract storage backend trait.
//!
//! Every storage backend must implement [`StorageBackend`].  Staging
//! operations are positional: a chunk write names its byte offset and
//! never depends on a shared file cursor, so writes to disjoint ranges of
//! one staging file may run concurrently.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Byte source handed to and returned from a backend.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// A finalized file opened for reading.
pub struct StoredFile {
    /// Length in bytes, known before the first read.
    pub len: u64,
    pub reader: ByteReader,
}

/// A staging file found on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    pub owner: String,
    pub filename: String,
    /// Last time a chunk landed in it.
    pub modified: DateTime<Utc>,
}

/// Returned by [`StorageBackend::put`] when the source holds more than the
/// allowed number of bytes.  Nothing is left behind.
#[derive(Debug, thiserror::Error)]
#[error("file exceeds {limit} bytes")]
pub struct ExceedsLimit {
    pub limit: u64,
}

/// Async storage contract, scoped by `(owner, filename)`.
pub trait StorageBackend: Send + Sync + 'static {
    /// Write `data` into the staging file for `(owner, filename)` starting
    /// at `offset`, creating the file if absent.  Bytes outside
    /// `[offset, offset + data.len())` are left untouched.
    fn write_at(
        &self,
        owner: &str,
        filename: &str,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Current byte length of the staging file, or `None` if it does not
    /// exist.
    fn staged_len(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>>;

    /// Atomically rename the staging file for `(owner, filename)` to the
    /// finalized file `(owner, target)`, first trimming it to `size` bytes.
    ///
    /// Fails if the rename cannot be performed atomically; callers never
    /// retry automatically.
    fn promote(
        &self,
        owner: &str,
        filename: &str,
        target: &str,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Delete the staging file for `(owner, filename)`.  Deleting a missing
    /// file succeeds.
    fn discard(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Every staging file currently on the backend, whether or not a
    /// session refers to it.
    fn list_staging(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<StagedEntry>>> + Send + '_>>;

    /// Copy `source` into a complete file in one step (temp file, then
    /// rename) and return its length.  Fails with [`ExceedsLimit`] without
    /// touching the target once more than `limit` bytes have been read.
    fn put(
        &self,
        owner: &str,
        filename: &str,
        source: ByteReader,
        limit: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    /// Open a finalized file for streaming, or `None` if it does not exist.
    fn open(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredFile>>> + Send + '_>>;
}

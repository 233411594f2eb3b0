//! Upload session records and chunk arithmetic.

use std::collections::BTreeSet;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::UploadError;

/// How a file of `total_size` bytes is cut into fixed-size chunks.
///
/// Chunk `i` covers bytes `[i * chunk_size, min((i + 1) * chunk_size, total_size))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl ChunkLayout {
    /// Build a layout, rejecting empty files and zero-sized chunks.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::invalid_chunk("chunkSize must be greater than zero"));
        }
        if total_size == 0 {
            return Err(UploadError::invalid_chunk("fileSize must be greater than zero"));
        }
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks: total_size.div_ceil(chunk_size),
        })
    }

    /// Byte range of chunk `index`, or `None` if it is out of range.
    pub fn chunk_range(&self, index: u64) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Some(start..end)
    }

    /// Length in bytes of chunk `index`, or `None` if it is out of range.
    pub fn chunk_len(&self, index: u64) -> Option<u64> {
        self.chunk_range(index).map(|r| r.end - r.start)
    }

    /// Chunks whose start offset lies below `len`.
    pub fn chunks_below(&self, len: u64) -> BTreeSet<u64> {
        let covered = len.div_ceil(self.chunk_size).min(self.total_chunks);
        (0..covered).collect()
    }
}

/// Percentage of `total` represented by `done`, in `[0, 100]`.
pub fn progress_percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    done as f64 * 100.0 / total as f64
}

/// Immutable description of one upload, fixed at creation.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: String,
    pub owner: String,
    pub filename: String,
    pub layout: ChunkLayout,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(owner: &str, filename: &str, layout: ChunkLayout) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            owner: owner.to_string(),
            filename: filename.to_string(),
            layout,
            created_at: Utc::now(),
        }
    }
}

/// Where a session is in its lifecycle.
///
/// `Open -> Finalizing -> Finalized` or `Open -> Expired`.  A failed
/// promotion moves `Finalizing` back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Open,
    Finalizing,
    Finalized,
    Expired,
}

impl SessionPhase {
    /// True once the session has left the registry for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Finalized | SessionPhase::Expired)
    }
}

/// Mutable per-session state.
#[derive(Debug)]
pub struct SessionProgress {
    pub completed: BTreeSet<u64>,
    pub last_activity_at: DateTime<Utc>,
    pub phase: SessionPhase,
}

impl SessionProgress {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            completed: BTreeSet::new(),
            last_activity_at: now,
            phase: SessionPhase::Open,
        }
    }
}

/// Result of beginning (or rejoining) a session.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeginOutcome {
    pub session_id: String,
    pub total_chunks: u64,
    pub chunk_size: u64,
    /// Chunk indices already present; a resuming client skips these.
    #[serde(rename = "uploadedChunks")]
    pub already_complete: Vec<u64>,
    /// True if the file was finalized during this call.
    pub complete: bool,
}

/// Read-only view of a session.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub filename: String,
    pub total_chunks: u64,
    #[serde(rename = "uploadedChunks")]
    pub completed_chunks: Vec<u64>,
    #[serde(rename = "progress")]
    pub progress_percent: f64,
}

/// Result of an accepted chunk.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOutcome {
    pub success: bool,
    /// True once the permanent file exists.
    pub complete: bool,
    #[serde(rename = "progress")]
    pub progress_percent: f64,
}

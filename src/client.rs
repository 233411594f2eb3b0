//! HTTP client for the resumable upload API.
//!
//! [`ChunkedUploader`] begins (or resumes) a session, skips the chunks the
//! server already has, and sends the rest through a fixed pool of workers.
//! Each worker claims the next unsent chunk from a shared cursor, so no
//! chunk is sent twice and at most `concurrency` requests are in flight.
//! Nothing is retried: the first failure stops the run, and calling
//! [`ChunkedUploader::upload`] again resumes where the server left off.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Parallel chunk requests per upload unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BeginRequest<'a> {
    filename: &'a str,
    file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeginResponse {
    session_id: String,
    total_chunks: u64,
    chunk_size: u64,
    uploaded_chunks: Vec<u64>,
    complete: bool,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    complete: bool,
    progress: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// What a finished [`ChunkedUploader::upload`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub session_id: String,
    pub total_chunks: u64,
    /// Chunks the server already had.
    pub skipped: usize,
    /// Chunks sent by this run.
    pub sent: usize,
}

/// Uploads local files through the resumable API.
#[derive(Debug, Clone)]
pub struct ChunkedUploader {
    http: reqwest::Client,
    base_url: String,
    token: String,
    concurrency: usize,
    chunk_size: Option<u64>,
}

impl ChunkedUploader {
    /// `base_url` is the server root, e.g. `http://localhost:8000`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Declare a chunk size instead of taking the server's default.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Upload `path` as `filename`, resuming any session the server holds.
    pub async fn upload(&self, path: &Path, filename: &str) -> anyhow::Result<UploadReport> {
        let file_size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?
            .len();

        let begun: BeginResponse = self
            .send(
                self.http
                    .post(self.url("/api/upload-init"))
                    .json(&BeginRequest {
                        filename,
                        file_size,
                        chunk_size: self.chunk_size,
                    }),
            )
            .await?
            .json()
            .await?;
        info!(
            session_id = %begun.session_id,
            total_chunks = begun.total_chunks,
            already_present = begun.uploaded_chunks.len(),
            "upload session ready"
        );

        let mut report = UploadReport {
            session_id: begun.session_id.clone(),
            total_chunks: begun.total_chunks,
            skipped: begun.uploaded_chunks.len(),
            sent: 0,
        };
        if begun.complete {
            return Ok(report);
        }

        let pending: Vec<u64> = (0..begun.total_chunks)
            .filter(|i| !begun.uploaded_chunks.contains(i))
            .collect();
        report.sent = pending.len();

        let job = Arc::new(Job {
            uploader: self.clone(),
            path: path.to_path_buf(),
            session_id: begun.session_id,
            file_size,
            chunk_size: begun.chunk_size,
            pending,
            cursor: AtomicUsize::new(0),
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency.min(job.pending.len()) {
            let job = Arc::clone(&job);
            workers.spawn(async move { job.run_worker().await });
        }

        let mut complete = false;
        while let Some(joined) = workers.join_next().await {
            match joined.context("upload worker panicked")? {
                Ok(saw_complete) => complete |= saw_complete,
                Err(e) => {
                    workers.abort_all();
                    return Err(e);
                }
            }
        }

        // Every chunk landed but the promotion was not confirmed; ask again.
        if !complete {
            self.send(self.http.post(self.url(&format!(
                "/api/upload-complete?sessionId={}",
                job.session_id
            ))))
            .await?;
        }
        Ok(report)
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Send with the bearer token and turn error responses into errors.
    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<reqwest::Response> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(e) => format!("{}: {}", e.error, e.message),
            Err(_) => body,
        };
        anyhow::bail!("server returned {status}: {detail}")
    }
}

/// Shared state of one upload's worker pool.
struct Job {
    uploader: ChunkedUploader,
    path: PathBuf,
    session_id: String,
    file_size: u64,
    chunk_size: u64,
    pending: Vec<u64>,
    cursor: AtomicUsize,
}

impl Job {
    /// Claim and send chunks until none are left.  Returns whether the
    /// server reported the file complete.
    async fn run_worker(&self) -> anyhow::Result<bool> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("cannot open {}", self.path.display()))?;
        let mut complete = false;

        loop {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(&index) = self.pending.get(slot) else {
                return Ok(complete);
            };

            let offset = index * self.chunk_size;
            let len = self.chunk_size.min(self.file_size - offset);
            let mut buf = vec![0u8; usize::try_from(len)?];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf)
                .await
                .with_context(|| format!("cannot read chunk {index}"))?;

            let url = self.uploader.url(&format!(
                "/api/upload-resumable?sessionId={}&chunkIndex={index}",
                self.session_id
            ));
            let outcome: ChunkResponse = self
                .uploader
                .send(self.uploader.http.post(url).body(buf))
                .await
                .with_context(|| format!("chunk {index} failed"))?
                .json()
                .await?;
            debug!(index, progress = outcome.progress, "chunk sent");
            complete |= outcome.complete;
        }
    }
}

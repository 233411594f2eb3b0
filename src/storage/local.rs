//! Local filesystem storage backend.
//!
//! Each owner gets a directory under the configured root.  Finalized files
//! sit directly in it; staging files live in its `.staging/` subdirectory,
//! so promotion is a rename within one directory tree on one volume.
//!
//! Chunk writes are positional (`pwrite`), run on the blocking pool, and
//! are fsynced before returning: a chunk that reports success is durable.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;

use anyhow::Context;
use tokio::io::AsyncReadExt;

use super::backend::{ByteReader, ExceedsLimit, StagedEntry, StorageBackend, StoredFile};
use super::{validate_name, STAGING_DIR, STAGING_SUFFIX};

/// Stores files on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all owners.
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding `owner`'s finalized files.
    fn owner_dir(&self, owner: &str) -> anyhow::Result<PathBuf> {
        validate_name(owner).map_err(|e| anyhow::anyhow!("invalid owner id: {e}"))?;
        Ok(self.root.join(owner))
    }

    /// Resolve the finalized path of `(owner, filename)`.
    fn object_path(&self, owner: &str, filename: &str) -> anyhow::Result<PathBuf> {
        validate_name(filename).map_err(|e| anyhow::anyhow!("invalid filename: {e}"))?;
        Ok(self.owner_dir(owner)?.join(filename))
    }

    /// Resolve the staging path of `(owner, filename)`.
    fn staging_path(&self, owner: &str, filename: &str) -> anyhow::Result<PathBuf> {
        validate_name(filename).map_err(|e| anyhow::anyhow!("invalid filename: {e}"))?;
        Ok(self
            .owner_dir(owner)?
            .join(STAGING_DIR)
            .join(format!("{filename}{STAGING_SUFFIX}")))
    }

    /// Temp path for a one-shot `put`; never collides with a staging file.
    fn temp_path(&self, owner: &str) -> anyhow::Result<PathBuf> {
        let id = uuid::Uuid::new_v4();
        Ok(self
            .owner_dir(owner)?
            .join(STAGING_DIR)
            .join(format!(".put-{id}")))
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl StorageBackend for LocalBackend {
    fn write_at(
        &self,
        owner: &str,
        filename: &str,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.staging_path(owner, filename);
        Box::pin(async move {
            let path = path?;
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                // No truncate: other chunks of the same file may already be on disk.
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .with_context(|| format!("open staging file {}", path.display()))?;
                write_all_at(&file, &data, offset)
                    .with_context(|| format!("write {} bytes at offset {offset}", data.len()))?;
                file.sync_data()?;
                Ok(())
            })
            .await?
        })
    }

    fn staged_len(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>> {
        let path = self.staging_path(owner, filename);
        Box::pin(async move {
            match tokio::fs::metadata(path?).await {
                Ok(meta) => Ok(Some(meta.len())),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn promote(
        &self,
        owner: &str,
        filename: &str,
        target: &str,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let paths = self
            .staging_path(owner, filename)
            .and_then(|staging| Ok((staging, self.object_path(owner, target)?)));
        Box::pin(async move {
            let (staging, final_path) = paths?;
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let file = OpenOptions::new()
                    .write(true)
                    .open(&staging)
                    .with_context(|| format!("open staging file {}", staging.display()))?;
                if file.metadata()?.len() != size {
                    file.set_len(size)?;
                }
                file.sync_all()?;
                drop(file);

                // Same-directory-tree rename; a cross-device layout fails here
                // rather than degrading to copy + delete.
                std::fs::rename(&staging, &final_path).with_context(|| {
                    format!(
                        "atomic rename {} -> {} failed",
                        staging.display(),
                        final_path.display()
                    )
                })?;
                Ok(())
            })
            .await?
        })
    }

    fn discard(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.staging_path(owner, filename);
        Box::pin(async move {
            match tokio::fs::remove_file(path?).await {
                Ok(()) => Ok(()),
                // Idempotent: if the file doesn't exist, that's fine.
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list_staging(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<StagedEntry>>> + Send + '_>> {
        let root = self.root.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<StagedEntry>> {
                let mut entries = Vec::new();
                for owner_entry in std::fs::read_dir(&root)? {
                    let owner_entry = owner_entry?;
                    let Some(owner) = owner_entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if validate_name(&owner).is_err() || !owner_entry.file_type()?.is_dir() {
                        continue;
                    }
                    let staging_dir = owner_entry.path().join(STAGING_DIR);
                    let listing = match std::fs::read_dir(&staging_dir) {
                        Ok(listing) => listing,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    for file in listing {
                        let file = file?;
                        let name = file.file_name();
                        // Skips in-flight `put` temp files and anything foreign.
                        let Some(filename) = name
                            .to_str()
                            .and_then(|n| n.strip_suffix(STAGING_SUFFIX))
                            .filter(|n| validate_name(n).is_ok())
                        else {
                            continue;
                        };
                        let meta = file.metadata()?;
                        if !meta.is_file() {
                            continue;
                        }
                        entries.push(StagedEntry {
                            owner: owner.clone(),
                            filename: filename.to_string(),
                            modified: DateTime::<Utc>::from(meta.modified()?),
                        });
                    }
                }
                Ok(entries)
            })
            .await?
        })
    }

    fn put(
        &self,
        owner: &str,
        filename: &str,
        mut source: ByteReader,
        limit: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let paths = self
            .temp_path(owner)
            .and_then(|tmp| Ok((tmp, self.object_path(owner, filename)?)));
        Box::pin(async move {
            let (tmp_path, final_path) = paths?;
            if let Some(parent) = tmp_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // Crash-only: temp-fsync-rename pattern.
            let result = async {
                let mut file = tokio::fs::File::create(&tmp_path).await?;
                let written = tokio::io::copy(&mut (&mut source).take(limit.saturating_add(1)), &mut file)
                    .await
                    .with_context(|| format!("write {}", tmp_path.display()))?;
                if written > limit {
                    return Err(ExceedsLimit { limit }.into());
                }
                file.sync_all().await?;
                drop(file);
                tokio::fs::rename(&tmp_path, &final_path).await?;
                Ok::<_, anyhow::Error>(written)
            }
            .await;
            if result.is_err() {
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
            result
        })
    }

    fn open(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredFile>>> + Send + '_>> {
        let path = self.object_path(owner, filename);
        Box::pin(async move {
            let file = match tokio::fs::File::open(path?).await {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let len = file.metadata().await?.len();
            Ok(Some(StoredFile {
                len,
                reader: Box::pin(file),
            }))
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_all, reader};
    use std::sync::Arc;

    fn test_backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let backend = LocalBackend::new(dir.path()).expect("failed to create backend");
        (dir, backend)
    }

    #[tokio::test]
    async fn test_write_at_creates_staging_file() {
        let (dir, backend) = test_backend();

        backend
            .write_at("alice", "movie.mkv", 0, Bytes::from("hello"))
            .await
            .unwrap();

        let staging = dir.path().join("alice/.staging/movie.mkv.part");
        assert_eq!(std::fs::read(&staging).unwrap(), b"hello");
        // Not visible as a finalized file yet.
        assert!(read_all(&backend, "alice", "movie.mkv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_at_out_of_order_offsets() {
        let (_dir, backend) = test_backend();

        backend
            .write_at("alice", "f.bin", 4, Bytes::from("5678"))
            .await
            .unwrap();
        assert_eq!(backend.staged_len("alice", "f.bin").await.unwrap(), Some(8));

        backend
            .write_at("alice", "f.bin", 0, Bytes::from("1234"))
            .await
            .unwrap();
        backend.promote("alice", "f.bin", "f.bin", 8).await.unwrap();

        let data = read_all(&backend, "alice", "f.bin").await.unwrap().unwrap();
        assert_eq!(data, Bytes::from("12345678"));
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_writes_do_not_clobber() {
        let (_dir, backend) = test_backend();
        let backend = Arc::new(backend);
        let chunk = 4096usize;

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let data = Bytes::from(vec![i; chunk]);
                backend
                    .write_at("alice", "big.bin", i as u64 * chunk as u64, data)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        backend
            .promote("alice", "big.bin", "big.bin", 16 * chunk as u64)
            .await
            .unwrap();
        let data = read_all(backend.as_ref(), "alice", "big.bin").await.unwrap().unwrap();
        assert_eq!(data.len(), 16 * chunk);
        for (i, block) in data.chunks(chunk).enumerate() {
            assert!(block.iter().all(|b| *b == i as u8), "block {i} clobbered");
        }
    }

    #[tokio::test]
    async fn test_rewrite_same_range_is_idempotent() {
        let (_dir, backend) = test_backend();

        for _ in 0..2 {
            backend
                .write_at("alice", "f.bin", 3, Bytes::from("abc"))
                .await
                .unwrap();
        }
        assert_eq!(backend.staged_len("alice", "f.bin").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_staged_len_absent() {
        let (_dir, backend) = test_backend();
        assert_eq!(backend.staged_len("alice", "none.bin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_promote_trims_to_size() {
        let (_dir, backend) = test_backend();

        backend
            .write_at("alice", "f.bin", 0, Bytes::from("0123456789"))
            .await
            .unwrap();
        backend.promote("alice", "f.bin", "f.bin", 4).await.unwrap();

        let data = read_all(&backend, "alice", "f.bin").await.unwrap().unwrap();
        assert_eq!(data, Bytes::from("0123"));
        assert_eq!(backend.staged_len("alice", "f.bin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_promote_without_staging_fails() {
        let (_dir, backend) = test_backend();
        assert!(backend.promote("alice", "f.bin", "f.bin", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_discard() {
        let (_dir, backend) = test_backend();

        backend
            .write_at("alice", "f.bin", 0, Bytes::from("x"))
            .await
            .unwrap();
        backend.discard("alice", "f.bin").await.unwrap();
        assert_eq!(backend.staged_len("alice", "f.bin").await.unwrap(), None);

        // Deleting again should succeed (idempotent).
        backend.discard("alice", "f.bin").await.unwrap();
    }

    #[tokio::test]
    async fn test_put_and_open_roundtrip() {
        let (dir, backend) = test_backend();

        let written = backend
            .put("bob", "notes.txt", reader("hello world"), 1024)
            .await
            .unwrap();
        assert_eq!(written, 11);

        let opened = backend.open("bob", "notes.txt").await.unwrap().unwrap();
        assert_eq!(opened.len, 11);
        let data = read_all(&backend, "bob", "notes.txt").await.unwrap().unwrap();
        assert_eq!(data, Bytes::from("hello world"));

        // The temp file was renamed away.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("bob/.staging"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_put_over_limit_leaves_nothing() {
        let (dir, backend) = test_backend();

        let err = backend
            .put("bob", "big.txt", reader(vec![7u8; 11]), 10)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ExceedsLimit>().is_some());
        assert!(backend.open("bob", "big.txt").await.unwrap().is_none());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("bob/.staging"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());

        // Exactly at the limit is fine.
        assert_eq!(
            backend
                .put("bob", "big.txt", reader(vec![7u8; 10]), 10)
                .await
                .unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn test_owners_are_isolated() {
        let (_dir, backend) = test_backend();

        backend.put("alice", "a.txt", reader("a"), 16).await.unwrap();
        assert!(backend.open("bob", "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_staging_reports_part_files_only() {
        let (dir, backend) = test_backend();

        let before = Utc::now() - chrono::Duration::seconds(5);
        backend
            .write_at("alice", "a.bin", 0, Bytes::from("x"))
            .await
            .unwrap();
        backend
            .write_at("bob", "b.bin", 0, Bytes::from("y"))
            .await
            .unwrap();
        backend.put("bob", "done.txt", reader("z"), 16).await.unwrap();
        std::fs::write(dir.path().join("bob/.staging/.put-stray"), b"?").unwrap();
        std::fs::write(dir.path().join("loose-file"), b"?").unwrap();

        let mut entries = backend.list_staging().await.unwrap();
        entries.sort_by(|a, b| a.owner.cmp(&b.owner));
        let names: Vec<(&str, &str)> = entries
            .iter()
            .map(|e| (e.owner.as_str(), e.filename.as_str()))
            .collect();
        assert_eq!(names, vec![("alice", "a.bin"), ("bob", "b.bin")]);
        assert!(entries.iter().all(|e| e.modified > before));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (_dir, backend) = test_backend();

        assert!(backend
            .write_at("alice", "../escape", 0, Bytes::from("x"))
            .await
            .is_err());
        assert!(backend.put("..", "f.txt", reader("x"), 16).await.is_err());
        assert!(backend.open("alice", ".staging").await.is_err());
    }
}

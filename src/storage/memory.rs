//! In-memory storage backend.
//!
//! Stores staging and finalized files in a `RwLock<HashMap>` with no
//! persistence. Useful for testing and ephemeral deployments.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use tokio::io::AsyncReadExt;

use super::backend::{ByteReader, ExceedsLimit, StagedEntry, StorageBackend, StoredFile};
use super::validate_name;

#[derive(Debug)]
struct StagedBuf {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Staging files keyed by `(owner, filename)`.
    staging: HashMap<(String, String), StagedBuf>,
    /// Finalized files keyed by `(owner, filename)`.
    objects: HashMap<(String, String), Bytes>,
}

/// Keeps every file in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(owner: &str, filename: &str) -> anyhow::Result<(String, String)> {
    validate_name(owner).map_err(|e| anyhow::anyhow!("invalid owner id: {e}"))?;
    validate_name(filename).map_err(|e| anyhow::anyhow!("invalid filename: {e}"))?;
    Ok((owner.to_string(), filename.to_string()))
}

impl StorageBackend for MemoryBackend {
    fn write_at(
        &self,
        owner: &str,
        filename: &str,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key(owner, filename);
        Box::pin(async move {
            let key = key?;
            let start = usize::try_from(offset)?;
            let end = start + data.len();
            let mut inner = self.inner.write().expect("rwlock poisoned");
            let file = inner.staging.entry(key).or_insert_with(|| StagedBuf {
                data: Vec::new(),
                modified: Utc::now(),
            });
            if file.data.len() < end {
                file.data.resize(end, 0);
            }
            file.data[start..end].copy_from_slice(&data);
            file.modified = Utc::now();
            Ok(())
        })
    }

    fn staged_len(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>> {
        let key = key(owner, filename);
        Box::pin(async move {
            let key = key?;
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.staging.get(&key).map(|f| f.data.len() as u64))
        })
    }

    fn promote(
        &self,
        owner: &str,
        filename: &str,
        target: &str,
        size: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let keys = key(owner, filename).and_then(|k| Ok((k, key(owner, target)?)));
        Box::pin(async move {
            let (staging_key, object_key) = keys?;
            let size = usize::try_from(size)?;
            let mut inner = self.inner.write().expect("rwlock poisoned");
            let mut file = inner
                .staging
                .remove(&staging_key)
                .ok_or_else(|| {
                    anyhow::anyhow!("no staging file for {}/{}", staging_key.0, staging_key.1)
                })?
                .data;
            file.resize(size, 0);
            inner.objects.insert(object_key, Bytes::from(file));
            Ok(())
        })
    }

    fn discard(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key(owner, filename);
        Box::pin(async move {
            let key = key?;
            self.inner
                .write()
                .expect("rwlock poisoned")
                .staging
                .remove(&key);
            Ok(())
        })
    }

    fn list_staging(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<StagedEntry>>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner
                .staging
                .iter()
                .map(|((owner, filename), file)| StagedEntry {
                    owner: owner.clone(),
                    filename: filename.clone(),
                    modified: file.modified,
                })
                .collect())
        })
    }

    fn put(
        &self,
        owner: &str,
        filename: &str,
        source: ByteReader,
        limit: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let key = key(owner, filename);
        Box::pin(async move {
            let key = key?;
            let mut data = Vec::new();
            source
                .take(limit.saturating_add(1))
                .read_to_end(&mut data)
                .await?;
            let len = data.len() as u64;
            if len > limit {
                return Err(ExceedsLimit { limit }.into());
            }
            self.inner
                .write()
                .expect("rwlock poisoned")
                .objects
                .insert(key, Bytes::from(data));
            Ok(len)
        })
    }

    fn open(
        &self,
        owner: &str,
        filename: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<StoredFile>>> + Send + '_>> {
        let key = key(owner, filename);
        Box::pin(async move {
            let key = key?;
            let inner = self.inner.read().expect("rwlock poisoned");
            Ok(inner.objects.get(&key).cloned().map(|data| StoredFile {
                len: data.len() as u64,
                reader: Box::pin(std::io::Cursor::new(data)) as ByteReader,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_all, reader};

    #[tokio::test]
    async fn test_write_at_zero_fills_gaps() {
        let backend = MemoryBackend::new();

        backend
            .write_at("alice", "f.bin", 4, Bytes::from("xy"))
            .await
            .unwrap();
        assert_eq!(backend.staged_len("alice", "f.bin").await.unwrap(), Some(6));

        backend.promote("alice", "f.bin", "f.bin", 6).await.unwrap();
        let data = read_all(&backend, "alice", "f.bin").await.unwrap().unwrap();
        assert_eq!(&data[..], b"\0\0\0\0xy");
    }

    #[tokio::test]
    async fn test_promote_moves_staging_out() {
        let backend = MemoryBackend::new();

        backend
            .write_at("alice", "f.bin", 0, Bytes::from("abc"))
            .await
            .unwrap();
        backend.promote("alice", "f.bin", "f.bin", 3).await.unwrap();

        assert_eq!(backend.staged_len("alice", "f.bin").await.unwrap(), None);
        assert!(backend.promote("alice", "f.bin", "f.bin", 3).await.is_err());
    }

    #[tokio::test]
    async fn test_discard_and_put() {
        let backend = MemoryBackend::new();

        backend
            .write_at("alice", "f.bin", 0, Bytes::from("abc"))
            .await
            .unwrap();
        backend.discard("alice", "f.bin").await.unwrap();
        backend.discard("alice", "f.bin").await.unwrap();
        assert_eq!(backend.staged_len("alice", "f.bin").await.unwrap(), None);

        backend.put("alice", "g.txt", reader("g"), 1).await.unwrap();
        assert_eq!(
            read_all(&backend, "alice", "g.txt").await.unwrap(),
            Some(Bytes::from("g"))
        );
        assert_eq!(read_all(&backend, "bob", "g.txt").await.unwrap(), None);

        let err = backend.put("alice", "h.txt", reader("hh"), 1).await.unwrap_err();
        assert!(err.downcast_ref::<ExceedsLimit>().is_some());
        assert!(backend.open("alice", "h.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_staging_tracks_last_write() {
        let backend = MemoryBackend::new();
        assert!(backend.list_staging().await.unwrap().is_empty());

        backend
            .write_at("alice", "f.bin", 0, Bytes::from("a"))
            .await
            .unwrap();
        let first = backend.list_staging().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].owner, "alice");
        assert_eq!(first[0].filename, "f.bin");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        backend
            .write_at("alice", "f.bin", 1, Bytes::from("b"))
            .await
            .unwrap();
        let second = backend.list_staging().await.unwrap();
        assert!(second[0].modified > first[0].modified);

        backend.promote("alice", "f.bin", "f.bin", 2).await.unwrap();
        assert!(backend.list_staging().await.unwrap().is_empty());
    }
}

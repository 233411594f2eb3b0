//! Seeding a new session from a staging file left on disk.
//!
//! The shipped probe infers present chunks from the staging file's length
//! alone: chunk `i` counts as present iff `i * chunk_size < len`.  Nothing
//! is read back or checksummed, so a chunk whose write died halfway (file
//! already long enough, bytes not all there) is reported as present.  A
//! ledger of committed indices would close that gap; it can be dropped in
//! behind [`RecoveryProbe`] without touching the session contract.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use super::session::ChunkLayout;
use crate::storage::backend::StorageBackend;

/// Reports which chunks of `(owner, filename)` are already staged.
pub trait RecoveryProbe: Send + Sync + 'static {
    fn probe(
        &self,
        owner: &str,
        filename: &str,
        layout: ChunkLayout,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BTreeSet<u64>>> + Send + '_>>;
}

/// Offset-existence heuristic over the staging file length.
pub struct StagedLengthProbe {
    storage: Arc<dyn StorageBackend>,
}

impl StagedLengthProbe {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

impl RecoveryProbe for StagedLengthProbe {
    fn probe(
        &self,
        owner: &str,
        filename: &str,
        layout: ChunkLayout,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BTreeSet<u64>>> + Send + '_>> {
        let owner = owner.to_string();
        let filename = filename.to_string();
        Box::pin(async move {
            let len = self
                .storage
                .staged_len(&owner, &filename)
                .await?
                .unwrap_or(0);
            let present = layout.chunks_below(len);
            if !present.is_empty() {
                info!(
                    owner = %owner,
                    filename = %filename,
                    staged_bytes = len,
                    recovered_chunks = present.len(),
                    "recovered chunks from existing staging file (length only, contents unverified)"
                );
            }
            Ok(present)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_absent_staging_file_recovers_nothing() {
        let probe = StagedLengthProbe::new(Arc::new(MemoryBackend::new()));
        let layout = ChunkLayout::new(100, 10).unwrap();
        assert!(probe.probe("alice", "f.bin", layout).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_chunk_counts_as_present() {
        let storage = Arc::new(MemoryBackend::new());
        // 25 bytes: chunks 0 and 1 fully, chunk 2 only halfway.
        storage
            .write_at("alice", "f.bin", 0, Bytes::from(vec![7u8; 25]))
            .await
            .unwrap();

        let probe = StagedLengthProbe::new(storage);
        let layout = ChunkLayout::new(100, 10).unwrap();
        let present = probe.probe("alice", "f.bin", layout).await.unwrap();
        assert_eq!(present.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_oversized_staging_file_caps_at_total_chunks() {
        let storage = Arc::new(MemoryBackend::new());
        storage
            .write_at("alice", "f.bin", 0, Bytes::from(vec![0u8; 500]))
            .await
            .unwrap();

        let probe = StagedLengthProbe::new(storage);
        let layout = ChunkLayout::new(30, 10).unwrap();
        let present = probe.probe("alice", "f.bin", layout).await.unwrap();
        assert_eq!(present.len(), 3);
    }
}

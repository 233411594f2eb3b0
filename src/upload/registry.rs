//! Process-wide table of upload sessions.
//!
//! Each session lives in its own [`SessionSlot`].  The table lock only
//! guards insertion, lookup and removal and is never held across an
//! `.await`, so sessions never contend with each other.  Within a slot:
//!
//! - `gate` is held shared by chunk writers and exclusively by
//!   finalization and eviction, so neither can run under a live write.
//! - `progress` is a short critical section that owns the chunk set and
//!   the lifecycle phase.  The `Open -> Finalizing` transition is only
//!   ever taken inside it, which is what makes promotion happen once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::RwLockWriteGuard;
use tracing::{debug, info, warn};

use super::finalize::Finalizer;
use super::recovery::{RecoveryProbe, StagedLengthProbe};
use super::session::{
    progress_percent, BeginOutcome, ChunkLayout, ChunkOutcome, SessionPhase, SessionProgress,
    SessionStatus, UploadSession,
};
use crate::config::Config;
use crate::errors::UploadError;
use crate::metrics::{
    ACTIVE_SESSIONS, BYTES_STAGED_TOTAL, CHUNKS_ACCEPTED_TOTAL, SESSIONS_CREATED_TOTAL,
    SESSIONS_EXPIRED_TOTAL,
};
use crate::storage::backend::StorageBackend;
use crate::storage::{discard_best_effort, validate_name};

/// Bounds applied when a session is created.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_file_size: u64,
    pub max_chunk_size: u64,
    pub max_chunks: u64,
}

impl From<&Config> for SessionLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_file_size: config.server.max_file_size,
            max_chunk_size: config.uploads.max_chunk_size,
            max_chunks: config.uploads.max_chunks,
        }
    }
}

struct SessionSlot {
    session: UploadSession,
    gate: tokio::sync::RwLock<()>,
    progress: Mutex<SessionProgress>,
}

impl SessionSlot {
    fn new(session: UploadSession) -> Self {
        Self {
            progress: Mutex::new(SessionProgress::new(session.created_at)),
            session,
            gate: tokio::sync::RwLock::new(()),
        }
    }

    /// Slot that only holds a target while its leftover staging file is
    /// deleted.  It never accepts chunks.
    fn reclaiming(owner: &str, filename: &str) -> Self {
        let layout = ChunkLayout {
            total_size: 1,
            chunk_size: 1,
            total_chunks: 1,
        };
        let slot = Self::new(UploadSession::new(owner, filename, layout));
        slot.progress().phase = SessionPhase::Expired;
        slot
    }

    fn progress(&self) -> MutexGuard<'_, SessionProgress> {
        self.progress.lock().expect("mutex poisoned")
    }
}

#[derive(Default)]
struct Table {
    by_id: HashMap<String, Arc<SessionSlot>>,
    /// `(owner, filename)` -> session id; at most one session per target.
    by_target: HashMap<(String, String), String>,
}

enum Claim {
    Inserted,
    Existing(Arc<SessionSlot>),
}

/// Single source of truth for which chunks of which upload have arrived.
pub struct SessionRegistry {
    table: RwLock<Table>,
    storage: Arc<dyn StorageBackend>,
    probe: Arc<dyn RecoveryProbe>,
    finalizer: Finalizer,
    limits: SessionLimits,
}

impl SessionRegistry {
    /// Registry using the staging-length recovery heuristic.
    pub fn new(storage: Arc<dyn StorageBackend>, limits: SessionLimits) -> Self {
        let probe = Arc::new(StagedLengthProbe::new(Arc::clone(&storage)));
        Self::with_probe(storage, probe, limits)
    }

    pub fn with_probe(
        storage: Arc<dyn StorageBackend>,
        probe: Arc<dyn RecoveryProbe>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            finalizer: Finalizer::new(Arc::clone(&storage)),
            storage,
            probe,
            limits,
        }
    }

    /// Number of sessions currently held.
    pub fn len(&self) -> usize {
        self.table.read().expect("rwlock poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Begin an upload of `filename` for `owner`, or rejoin the open one.
    ///
    /// A new session is seeded from any staging file already on disk.  If
    /// that covers every chunk, the file is finalized before returning.
    /// An open session for the same target is returned as-is when its
    /// layout matches and rejected with `SessionConflict` otherwise.
    pub async fn create(
        &self,
        owner: &str,
        filename: &str,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<BeginOutcome, UploadError> {
        validate_name(owner)
            .map_err(|e| UploadError::invalid_chunk(format!("invalid owner id: {e}")))?;
        validate_name(filename)
            .map_err(|e| UploadError::invalid_chunk(format!("invalid filename: {e}")))?;
        if total_size > self.limits.max_file_size {
            return Err(UploadError::TooLarge {
                limit: self.limits.max_file_size,
            });
        }
        if chunk_size > self.limits.max_chunk_size {
            return Err(UploadError::invalid_chunk(format!(
                "chunkSize must not exceed {} bytes",
                self.limits.max_chunk_size
            )));
        }
        let layout = ChunkLayout::new(total_size, chunk_size)?;
        if layout.total_chunks > self.limits.max_chunks {
            return Err(UploadError::invalid_chunk(format!(
                "{} chunks exceeds the limit of {}; use a larger chunkSize",
                layout.total_chunks, self.limits.max_chunks
            )));
        }

        loop {
            let slot = Arc::new(SessionSlot::new(UploadSession::new(
                owner, filename, layout,
            )));
            // Held until seeding is done so no chunk lands on a half-built slot.
            let gate = slot.gate.write().await;
            match self.claim(&slot) {
                Claim::Inserted => return self.seed(&slot, gate).await,
                Claim::Existing(existing) => {
                    drop(gate);
                    if let Some(outcome) = self.rejoin(&existing, layout).await? {
                        return Ok(outcome);
                    }
                    // The existing session left the table meanwhile.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Snapshot of a session.  Does not extend its lifetime.
    pub fn status(&self, session_id: &str, owner: &str) -> Result<SessionStatus, UploadError> {
        let slot = self.lookup(session_id, owner)?;
        let progress = slot.progress();
        if progress.phase.is_terminal() {
            return Err(UploadError::not_found(session_id));
        }
        let total = slot.session.layout.total_chunks;
        Ok(SessionStatus {
            session_id: slot.session.id.clone(),
            filename: slot.session.filename.clone(),
            total_chunks: total,
            completed_chunks: progress.completed.iter().copied().collect(),
            progress_percent: progress_percent(progress.completed.len() as u64, total),
        })
    }

    /// Stage chunk `index` and finalize the upload if it was the last one.
    ///
    /// `data` must be exactly the chunk's length.  The index is recorded
    /// only after the full write succeeded.
    pub async fn submit_chunk(
        &self,
        session_id: &str,
        owner: &str,
        index: u64,
        data: Bytes,
    ) -> Result<ChunkOutcome, UploadError> {
        let slot = self.lookup(session_id, owner)?;
        let session = &slot.session;
        let total = session.layout.total_chunks;

        let range = session.layout.chunk_range(index).ok_or_else(|| {
            UploadError::invalid_chunk(format!(
                "chunk index {index} is outside [0, {total})"
            ))
        })?;
        let expected = range.end - range.start;
        let len = data.len() as u64;
        if len != expected {
            return Err(UploadError::invalid_chunk(format!(
                "chunk {index} must be {expected} bytes, got {len}"
            )));
        }

        {
            let _gate = slot.gate.read().await;
            let phase = slot.progress().phase;
            if phase.is_terminal() {
                return Err(UploadError::not_found(session_id));
            }
            if let Err(e) = self
                .storage
                .write_at(&session.owner, &session.filename, range.start, data)
                .await
            {
                warn!(session_id, index, error = %e, "chunk write failed");
                return Err(UploadError::IoFailure(e));
            }
            let mut progress = slot.progress();
            progress.completed.insert(index);
            progress.last_activity_at = Utc::now();
        }
        counter!(CHUNKS_ACCEPTED_TOTAL).increment(1);
        counter!(BYTES_STAGED_TOTAL).increment(len);
        debug!(session_id, index, bytes = len, "chunk staged");

        let finalized_here = self.finalize_if_complete(&slot).await?;
        let done = slot.progress().completed.len() as u64;
        let complete = if finalized_here {
            true
        } else if done == total {
            self.wait_settled(&slot).await == SessionPhase::Finalized
        } else {
            false
        };

        Ok(ChunkOutcome {
            success: true,
            complete,
            progress_percent: progress_percent(done, total),
        })
    }

    /// Finalize a session whose chunks are all present.
    ///
    /// Retries the promotion after an earlier failure.  Succeeds without
    /// work if a concurrent caller finalizes first.
    pub async fn complete(&self, session_id: &str, owner: &str) -> Result<(), UploadError> {
        let slot = self.lookup(session_id, owner)?;
        let total = slot.session.layout.total_chunks;
        let (phase, done) = {
            let progress = slot.progress();
            (progress.phase, progress.completed.len() as u64)
        };
        if phase.is_terminal() {
            return Err(UploadError::not_found(session_id));
        }
        if done < total {
            return Err(UploadError::invalid_chunk(format!(
                "{} of {total} chunks are still missing",
                total - done
            )));
        }

        match self.settle(&slot).await? {
            SessionPhase::Finalized => Ok(()),
            _ => Err(UploadError::not_found(session_id)),
        }
    }

    /// Evict every session idle for longer than `max_age` as of `now` and
    /// delete its staging file.  Sessions with work in flight are skipped
    /// until the next pass.  Returns the evicted session ids.
    pub async fn expire_idle(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let candidates: Vec<Arc<SessionSlot>> = self
            .table
            .read()
            .expect("rwlock poisoned")
            .by_id
            .values()
            .cloned()
            .collect();

        let mut evicted = Vec::new();
        for slot in candidates {
            let Ok(_gate) = slot.gate.try_write() else {
                continue;
            };
            let expired = {
                let mut progress = slot.progress();
                let idle = idle_longer_than(now, progress.last_activity_at, max_age);
                if idle && progress.phase == SessionPhase::Open {
                    progress.phase = SessionPhase::Expired;
                    true
                } else {
                    false
                }
            };
            if !expired {
                continue;
            }

            // Discard before removal: a begin for the same target waits on
            // this slot until it leaves the table, so it never probes a
            // staging file that is about to disappear.
            let session = &slot.session;
            discard_best_effort(self.storage.as_ref(), &session.owner, &session.filename).await;
            self.remove(&slot);
            counter!(SESSIONS_EXPIRED_TOTAL).increment(1);
            info!(
                session_id = %session.id,
                owner = %session.owner,
                filename = %session.filename,
                "expired idle upload session"
            );
            evicted.push(session.id.clone());
        }
        evicted
    }

    /// Delete staging files that no session claims and that have not been
    /// written for longer than `max_age` as of `now`, such as those left
    /// by a previous process.  Returns how many were deleted.
    pub async fn reclaim_orphans(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let entries = match self.storage.list_staging().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list staging files");
                return 0;
            }
        };

        let mut reclaimed = 0;
        for entry in entries {
            if !idle_longer_than(now, entry.modified, max_age) {
                continue;
            }
            // Claim the target like a session would: a concurrent begin
            // waits on this slot instead of probing a file being deleted.
            let slot = Arc::new(SessionSlot::reclaiming(&entry.owner, &entry.filename));
            let _gate = slot.gate.write().await;
            if let Claim::Existing(_) = self.claim(&slot) {
                continue;
            }
            discard_best_effort(self.storage.as_ref(), &entry.owner, &entry.filename).await;
            self.remove(&slot);
            info!(
                owner = %entry.owner,
                filename = %entry.filename,
                modified = %entry.modified,
                "reclaimed orphaned staging file"
            );
            reclaimed += 1;
        }
        reclaimed
    }

    fn lookup(&self, session_id: &str, owner: &str) -> Result<Arc<SessionSlot>, UploadError> {
        let table = self.table.read().expect("rwlock poisoned");
        match table.by_id.get(session_id) {
            Some(slot) if slot.session.owner == owner => Ok(Arc::clone(slot)),
            _ => Err(UploadError::not_found(session_id)),
        }
    }

    fn claim(&self, slot: &Arc<SessionSlot>) -> Claim {
        let mut table = self.table.write().expect("rwlock poisoned");
        let target = (slot.session.owner.clone(), slot.session.filename.clone());
        if let Some(existing) = table
            .by_target
            .get(&target)
            .and_then(|id| table.by_id.get(id))
        {
            return Claim::Existing(Arc::clone(existing));
        }
        table.by_target.insert(target, slot.session.id.clone());
        table
            .by_id
            .insert(slot.session.id.clone(), Arc::clone(slot));
        gauge!(ACTIVE_SESSIONS).set(table.by_id.len() as f64);
        Claim::Inserted
    }

    fn remove(&self, slot: &Arc<SessionSlot>) {
        let mut table = self.table.write().expect("rwlock poisoned");
        let id = &slot.session.id;
        if !table.by_id.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            return;
        }
        table.by_id.remove(id);
        let target = (slot.session.owner.clone(), slot.session.filename.clone());
        if table.by_target.get(&target) == Some(id) {
            table.by_target.remove(&target);
        }
        gauge!(ACTIVE_SESSIONS).set(table.by_id.len() as f64);
    }

    async fn seed(
        &self,
        slot: &Arc<SessionSlot>,
        _gate: RwLockWriteGuard<'_, ()>,
    ) -> Result<BeginOutcome, UploadError> {
        let session = &slot.session;
        let layout = session.layout;
        let recovered = match self
            .probe
            .probe(&session.owner, &session.filename, layout)
            .await
        {
            Ok(recovered) => recovered,
            Err(e) => {
                slot.progress().phase = SessionPhase::Expired;
                self.remove(slot);
                return Err(UploadError::IoFailure(e));
            }
        };

        let (already_complete, all_present) = {
            let mut progress = slot.progress();
            progress.completed = recovered;
            let all_present = progress.completed.len() as u64 == layout.total_chunks;
            if all_present {
                progress.phase = SessionPhase::Finalizing;
            }
            (
                progress.completed.iter().copied().collect::<Vec<_>>(),
                all_present,
            )
        };
        counter!(SESSIONS_CREATED_TOTAL).increment(1);
        info!(
            session_id = %session.id,
            owner = %session.owner,
            filename = %session.filename,
            total_size = layout.total_size,
            total_chunks = layout.total_chunks,
            recovered = already_complete.len(),
            "upload session created"
        );

        if all_present {
            self.promote_locked(slot).await?;
        }
        Ok(BeginOutcome {
            session_id: session.id.clone(),
            total_chunks: layout.total_chunks,
            chunk_size: layout.chunk_size,
            already_complete,
            complete: all_present,
        })
    }

    /// Outcome for a caller beginning an upload of `layout` that is
    /// already open, or `None` if that session is gone.
    async fn rejoin(
        &self,
        slot: &Arc<SessionSlot>,
        layout: ChunkLayout,
    ) -> Result<Option<BeginOutcome>, UploadError> {
        if self.wait_settled(slot).await != SessionPhase::Open {
            return Ok(None);
        }
        if slot.session.layout != layout {
            return Err(UploadError::SessionConflict {
                filename: slot.session.filename.clone(),
            });
        }
        let already_complete: Vec<u64> = {
            let progress = slot.progress();
            progress.completed.iter().copied().collect()
        };
        // Every chunk is staged: the client has nothing left to send, so
        // finish the promotion here or wait for whoever owns it.
        let complete = if already_complete.len() as u64 == layout.total_chunks {
            match self.settle(slot).await? {
                SessionPhase::Finalized => true,
                _ => return Ok(None),
            }
        } else {
            false
        };
        debug!(session_id = %slot.session.id, "rejoined open upload session");
        Ok(Some(BeginOutcome {
            session_id: slot.session.id.clone(),
            total_chunks: layout.total_chunks,
            chunk_size: layout.chunk_size,
            already_complete,
            complete,
        }))
    }

    /// Take the `Open -> Finalizing` transition if every chunk is present
    /// and promote.  Returns false if the session is incomplete or another
    /// caller owns the transition.  Must not be called with the gate held.
    async fn finalize_if_complete(&self, slot: &Arc<SessionSlot>) -> Result<bool, UploadError> {
        let claimed = {
            let mut progress = slot.progress();
            let ready = progress.phase == SessionPhase::Open
                && progress.completed.len() as u64 == slot.session.layout.total_chunks;
            if ready {
                progress.phase = SessionPhase::Finalizing;
            }
            ready
        };
        if !claimed {
            return Ok(false);
        }
        let _gate = slot.gate.write().await;
        self.promote_locked(slot).await?;
        Ok(true)
    }

    /// Promote a slot in `Finalizing`.  The caller holds the gate exclusively.
    async fn promote_locked(&self, slot: &Arc<SessionSlot>) -> Result<(), UploadError> {
        match self.finalizer.finalize(&slot.session).await {
            Ok(()) => {
                slot.progress().phase = SessionPhase::Finalized;
                self.remove(slot);
                Ok(())
            }
            Err(e) => {
                slot.progress().phase = SessionPhase::Open;
                Err(e)
            }
        }
    }

    /// Promote a session whose chunks are all present, or wait for the
    /// caller that owns the promotion, retrying after a failed attempt.
    /// Returns the phase the session settled in.
    async fn settle(&self, slot: &Arc<SessionSlot>) -> Result<SessionPhase, UploadError> {
        loop {
            if self.finalize_if_complete(slot).await? {
                return Ok(SessionPhase::Finalized);
            }
            match self.wait_settled(slot).await {
                SessionPhase::Open => continue,
                phase => return Ok(phase),
            }
        }
    }

    /// Wait out an in-flight finalization and report where it landed.
    async fn wait_settled(&self, slot: &Arc<SessionSlot>) -> SessionPhase {
        loop {
            {
                let _gate = slot.gate.read().await;
                let phase = slot.progress().phase;
                if phase != SessionPhase::Finalizing {
                    return phase;
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

fn idle_longer_than(now: DateTime<Utc>, since: DateTime<Utc>, max_age: Duration) -> bool {
    now.signed_duration_since(since)
        .to_std()
        .is_ok_and(|idle| idle > max_age)
}

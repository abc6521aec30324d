//! Checkpoint persistence seam used by the reconciler.

use crate::domain::{
    Address, BoundedFingerprintSet, Checkpoint, CheckpointAdvance, FillRecord, Fingerprint, TimeMs,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointPersistError {
    #[error("checkpoint database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("checkpoint encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// A fill committed to the checkpoint whose sink delivery was not yet
/// acknowledged. Replayed first on the next start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub fingerprint: Fingerprint,
    pub fill: FillRecord,
}

/// Checkpoint state as read back from durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub checkpoint: Checkpoint,
    pub pending: Option<PendingDelivery>,
}

/// Durable checkpoint storage for monitored accounts.
///
/// Only the reconciler writes through this trait, one call at a time.
#[async_trait]
pub trait CheckpointStore: Send + Sync + fmt::Debug {
    /// Load the checkpoint for `user`, or an empty one on first run.
    async fn load(
        &self,
        user: &Address,
        capacity: usize,
    ) -> Result<StoredCheckpoint, CheckpointPersistError>;

    /// Atomically apply `advance` and record `fill` as the pending delivery.
    ///
    /// The stored timestamp is max-merged, so it can never move backward even
    /// if a caller passes a stale value. At most `capacity` fingerprints are
    /// retained.
    async fn commit(
        &self,
        user: &Address,
        advance: &CheckpointAdvance,
        capacity: usize,
        fill: &FillRecord,
    ) -> Result<(), CheckpointPersistError>;

    /// Clear the pending delivery if it still refers to `fingerprint`.
    async fn clear_pending(
        &self,
        user: &Address,
        fingerprint: &Fingerprint,
    ) -> Result<(), CheckpointPersistError>;
}

#[derive(Debug, Default, Clone)]
struct MemoryEntry {
    last_processed: TimeMs,
    fingerprints: Vec<Fingerprint>,
    pending: Option<PendingDelivery>,
}

/// In-process checkpoint store with failure injection.
///
/// Clones share state, which lets a test "restart" a pipeline on top of the
/// state a previous instance committed.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    entries: Arc<Mutex<HashMap<Address, MemoryEntry>>>,
    failing_commits: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with `Unavailable`.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Stored timestamp for `user`, if any commit happened.
    pub fn last_processed(&self, user: &Address) -> Option<TimeMs> {
        self.lock().get(user).map(|e| e.last_processed)
    }

    /// Stored pending delivery for `user`.
    pub fn pending(&self, user: &Address) -> Option<PendingDelivery> {
        self.lock().get(user).and_then(|e| e.pending.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Address, MemoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        user: &Address,
        capacity: usize,
    ) -> Result<StoredCheckpoint, CheckpointPersistError> {
        let entry = self.lock().get(user).cloned().unwrap_or_default();
        let recent = BoundedFingerprintSet::from_oldest_first(capacity, entry.fingerprints);
        Ok(StoredCheckpoint {
            checkpoint: Checkpoint::from_parts(entry.last_processed, recent),
            pending: entry.pending,
        })
    }

    async fn commit(
        &self,
        user: &Address,
        advance: &CheckpointAdvance,
        capacity: usize,
        fill: &FillRecord,
    ) -> Result<(), CheckpointPersistError> {
        let remaining = self.failing_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_commits.store(remaining - 1, Ordering::SeqCst);
            return Err(CheckpointPersistError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }

        let mut entries = self.lock();
        let entry = entries.entry(user.clone()).or_default();
        entry.last_processed = entry.last_processed.max(advance.last_processed);
        if !entry.fingerprints.contains(&advance.added) {
            entry.fingerprints.push(advance.added.clone());
        }
        let overflow = entry.fingerprints.len().saturating_sub(capacity.max(1));
        entry.fingerprints.drain(..overflow);
        entry.pending = Some(PendingDelivery {
            fingerprint: advance.added.clone(),
            fill: fill.clone(),
        });
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_pending(
        &self,
        user: &Address,
        fingerprint: &Fingerprint,
    ) -> Result<(), CheckpointPersistError> {
        if let Some(entry) = self.lock().get_mut(user) {
            if entry
                .pending
                .as_ref()
                .is_some_and(|p| &p.fingerprint == fingerprint)
            {
                entry.pending = None;
            }
        }
        Ok(())
    }
}

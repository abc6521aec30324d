//! Ingestion progress marker: last processed timestamp plus recent fingerprints.

use crate::domain::{Fingerprint, TimeMs};
use std::collections::{HashSet, VecDeque};

/// Default number of fingerprints retained per account.
pub const DEFAULT_FINGERPRINT_CAPACITY: usize = 2000;

/// Insertion-ordered set of fingerprints with FIFO eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedFingerprintSet {
    capacity: usize,
    order: VecDeque<Fingerprint>,
    members: HashSet<Fingerprint>,
}

impl BoundedFingerprintSet {
    /// Create an empty set. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Rebuild a set from stored fingerprints, oldest first.
    ///
    /// Keeps only the newest `capacity` entries if storage holds more.
    pub fn from_oldest_first(capacity: usize, stored: impl IntoIterator<Item = Fingerprint>) -> Self {
        let mut set = Self::new(capacity);
        for fp in stored {
            set.insert(fp);
        }
        set
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.members.contains(fp)
    }

    /// Insert a fingerprint, returning the evicted oldest entry if the set was full.
    ///
    /// Inserting a fingerprint that is already present is a no-op.
    pub fn insert(&mut self, fp: Fingerprint) -> Option<Fingerprint> {
        if self.members.contains(&fp) {
            return None;
        }
        let evicted = if self.order.len() == self.capacity {
            self.order.pop_front().inspect(|old| {
                self.members.remove(old);
            })
        } else {
            None
        };
        self.members.insert(fp.clone());
        self.order.push_back(fp);
        evicted
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.order.iter()
    }
}

/// Durable ingestion progress for one monitored account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    last_processed: TimeMs,
    recent: BoundedFingerprintSet,
}

/// The change produced by accepting one fill, as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointAdvance {
    pub last_processed: TimeMs,
    pub added: Fingerprint,
    pub evicted: Option<Fingerprint>,
}

impl Checkpoint {
    /// Empty checkpoint, as created on first run.
    pub fn empty(capacity: usize) -> Self {
        Self {
            last_processed: TimeMs::default(),
            recent: BoundedFingerprintSet::new(capacity),
        }
    }

    pub fn from_parts(last_processed: TimeMs, recent: BoundedFingerprintSet) -> Self {
        Self {
            last_processed,
            recent,
        }
    }

    pub fn last_processed(&self) -> TimeMs {
        self.last_processed
    }

    pub fn recent(&self) -> &BoundedFingerprintSet {
        &self.recent
    }

    /// True if the fingerprint was already accepted.
    pub fn has_seen(&self, fp: &Fingerprint) -> bool {
        self.recent.contains(fp)
    }

    /// True if nothing was ever accepted for this account.
    pub fn is_fresh(&self) -> bool {
        self.last_processed == TimeMs::default() && self.recent.is_empty()
    }

    /// Compute the checkpoint that results from accepting a fill, without
    /// mutating `self`.
    ///
    /// The timestamp only moves forward: an out-of-order fill keeps the current
    /// value and is remembered through its fingerprint alone.
    pub fn advanced(&self, time_ms: TimeMs, fp: Fingerprint) -> (Checkpoint, CheckpointAdvance) {
        let mut next = self.clone();
        next.last_processed = self.last_processed.max(time_ms);
        let evicted = next.recent.insert(fp.clone());
        let advance = CheckpointAdvance {
            last_processed: next.last_processed,
            added: fp,
            evicted,
        };
        (next, advance)
    }
}

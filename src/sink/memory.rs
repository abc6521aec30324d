//! In-process sink that records deliveries.

use super::{NotificationSink, SinkError};
use crate::domain::{FillRecord, Fingerprint};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records every accepted delivery. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    delivered: Arc<Mutex<Vec<(FillRecord, Fingerprint)>>>,
    failing: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` delivery attempts.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    /// Accepted deliveries in order.
    pub fn delivered(&self) -> Vec<(FillRecord, Fingerprint)> {
        self.lock().clone()
    }

    /// Timestamps of accepted deliveries in order.
    pub fn delivered_times(&self) -> Vec<i64> {
        self.lock().iter().map(|(f, _)| f.time_ms.as_i64()).collect()
    }

    /// All delivery attempts, including rejected ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(FillRecord, Fingerprint)>> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(
        &self,
        fill: &FillRecord,
        fingerprint: &Fingerprint,
    ) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError("injected sink failure".to_string()));
        }
        self.lock().push((fill.clone(), fingerprint.clone()));
        Ok(())
    }
}

//! Mock data source for testing without network calls.

use super::{DataSourceError, FillHistorySource};
use crate::domain::{Address, FillRecord};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    fills: Vec<FillRecord>,
    failures: VecDeque<DataSourceError>,
    calls: usize,
    preserve_order: bool,
    latency: Option<Duration>,
}

/// Mock history source returning predefined fills.
///
/// Clones share state, so a test can keep a handle and add fills or inject
/// failures after the source was handed to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct MockDataSource {
    state: Arc<Mutex<MockState>>,
}

impl MockDataSource {
    /// Create a new mock data source with empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fill to the history.
    pub fn with_fill(self, fill: FillRecord) -> Self {
        self.push_fill(fill);
        self
    }

    /// Add multiple fills to the history.
    pub fn with_fills(self, fills: Vec<FillRecord>) -> Self {
        for fill in fills {
            self.push_fill(fill);
        }
        self
    }

    /// Return fills in insertion order instead of newest-first, to simulate an
    /// upstream that breaks its ordering guarantee.
    pub fn with_insertion_order(self) -> Self {
        self.lock().preserve_order = true;
        self
    }

    /// Delay every response.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    /// Add a fill after construction (e.g. one that happened during an outage).
    pub fn push_fill(&self, fill: FillRecord) {
        self.lock().fills.push(fill);
    }

    /// Fail the next call with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, err: DataSourceError) {
        self.lock().failures.push_back(err);
    }

    /// Number of fetch calls made so far.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FillHistorySource for MockDataSource {
    async fn fetch_user_fills(&self, _user: &Address) -> Result<Vec<FillRecord>, DataSourceError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.calls += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let mut fills = state.fills.clone();
        if !state.preserve_order {
            fills.sort_by(|a, b| b.time_ms.cmp(&a.time_ms));
        }
        Ok(fills)
    }
}

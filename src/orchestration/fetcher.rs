//! Recovery pass fetching: pull the full fill history and cut it down to what
//! happened since the checkpoint.

use crate::datasource::{DataSourceError, FillHistorySource};
use crate::domain::{sort_fills_deterministic, Address, FillRecord, TimeMs};
use crate::retry::RetryPolicy;
use backoff::future::retry;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on a single history request, including reading the body.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How much of the newest-first history a recovery pass inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryScan {
    /// Stop at the first fill older than the checkpoint. Relies on the
    /// exchange returning fills strictly newest-first.
    EarlyStop,
    /// Inspect every returned fill.
    Full,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("recovery fetch failed after {attempts} attempt(s): {source}")]
    FetchFailed {
        attempts: u32,
        #[source]
        source: DataSourceError,
    },
}

/// Fills selected by one recovery pass, oldest first.
#[derive(Debug, Clone, Default)]
pub struct RecoverySet {
    pub fills: Vec<FillRecord>,
    /// Number of history entries inspected.
    pub scanned: usize,
    /// True if the pass inspected the whole history.
    pub full_scan: bool,
}

/// Bulk history fetcher for one monitored account.
#[derive(Debug)]
pub struct BulkFetcher {
    source: Arc<dyn FillHistorySource>,
    user: Address,
    policy: RetryPolicy,
    scan: RecoveryScan,
    attempt_timeout: Duration,
    ordering_violated: AtomicBool,
}

impl BulkFetcher {
    pub fn new(
        source: Arc<dyn FillHistorySource>,
        user: Address,
        policy: RetryPolicy,
        scan: RecoveryScan,
    ) -> Self {
        Self {
            source,
            user,
            policy,
            scan,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            ordering_violated: AtomicBool::new(false),
        }
    }

    /// Give up on a single attempt after `timeout`. An expired attempt counts
    /// as a transient network failure against the retry budget.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Scan mode the next pass will use.
    pub fn effective_scan(&self) -> RecoveryScan {
        if self.ordering_violated.load(Ordering::Relaxed) {
            RecoveryScan::Full
        } else {
            self.scan
        }
    }

    /// Fetch every fill at or after `since`, oldest first.
    ///
    /// Fills stamped exactly `since` are kept: other fills may share the
    /// checkpoint's timestamp, and the reconciler filters the ones already
    /// seen by fingerprint.
    ///
    /// # Errors
    /// `FetchFailed` once the retry budget is spent or a permanent error occurs.
    pub async fn fetch_recovery_set(&self, since: TimeMs) -> Result<RecoverySet, FetchError> {
        let history = self.fetch_with_retry().await?;
        let set = self.select_since(history, since);
        info!(
            user = %self.user,
            since = since.as_i64(),
            scanned = set.scanned,
            selected = set.fills.len(),
            full_scan = set.full_scan,
            "Recovery set fetched"
        );
        Ok(set)
    }

    async fn fetch_with_retry(&self) -> Result<Vec<FillRecord>, FetchError> {
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let source = &self.source;
        let user = &self.user;
        let policy = self.policy;
        let deadline = self.attempt_timeout;

        retry(policy.to_backoff(), move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let result = match tokio::time::timeout(deadline, source.fetch_user_fills(user)).await {
                Ok(result) => result,
                Err(_) => Err(DataSourceError::NetworkError(format!(
                    "fill history request timed out after {}ms",
                    deadline.as_millis()
                ))),
            };
            result.map_err(|err| {
                if !err.is_transient() || !policy.allows_another(attempt) {
                    return backoff::Error::permanent(err);
                }
                warn!(attempt, error = %err, "Fill history fetch failed, retrying");
                match err.retry_after() {
                    Some(delay) => backoff::Error::retry_after(err, delay),
                    None => backoff::Error::transient(err),
                }
            })
        })
        .await
        .map_err(|source| FetchError::FetchFailed {
            attempts: attempts.load(Ordering::SeqCst),
            source,
        })
    }

    fn select_since(&self, newest_first: Vec<FillRecord>, since: TimeMs) -> RecoverySet {
        let total = newest_first.len();
        if self.effective_scan() == RecoveryScan::EarlyStop {
            match take_newer_prefix(&newest_first, since) {
                Some(count) => {
                    let mut fills: Vec<FillRecord> =
                        newest_first.into_iter().take(count).collect();
                    sort_fills_deterministic(&mut fills);
                    return RecoverySet {
                        fills,
                        scanned: (count + 1).min(total),
                        full_scan: false,
                    };
                }
                None => {
                    warn!(
                        user = %self.user,
                        "Fill history is not newest-first; switching recovery to full scans"
                    );
                    self.ordering_violated.store(true, Ordering::Relaxed);
                }
            }
        }

        debug!(user = %self.user, total, "Full recovery scan");
        let mut fills: Vec<FillRecord> = newest_first
            .into_iter()
            .filter(|f| f.time_ms >= since)
            .collect();
        sort_fills_deterministic(&mut fills);
        RecoverySet {
            fills,
            scanned: total,
            full_scan: true,
        }
    }
}

/// Length of the newest-first prefix at or after `since`.
///
/// Returns `None` if an ordering inversion shows up before the cut-off, in
/// which case the early stop cannot be trusted.
fn take_newer_prefix(newest_first: &[FillRecord], since: TimeMs) -> Option<usize> {
    let mut prev: Option<TimeMs> = None;
    for (i, fill) in newest_first.iter().enumerate() {
        if prev.is_some_and(|p| fill.time_ms > p) {
            return None;
        }
        if fill.time_ms < since {
            return Some(i);
        }
        prev = Some(fill.time_ms);
    }
    Some(newest_first.len())
}

//! The reconciler: single owner of the checkpoint.
//!
//! Merges the live stream and recovery passes into one ordered,
//! deduplicated delivery sequence. Every accepted fill is committed to the
//! checkpoint store (together with a pending-delivery slot) before the sink
//! sees it, and the in-memory checkpoint only moves after that commit.

use crate::db::{CheckpointPersistError, CheckpointStore, PendingDelivery};
use crate::domain::{
    sort_fills_deterministic, Address, Checkpoint, ConnectionState, FillRecord, Fingerprint,
    TimeMs,
};
use crate::orchestration::fetcher::{BulkFetcher, FetchError, RecoverySet};
use crate::retry::RetryPolicy;
use crate::sink::{NotificationSink, SinkError};
use backoff::future::retry;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Events fed into the reconciler.
#[derive(Debug, Clone)]
pub enum ReconcilerInput {
    StreamFill(FillRecord),
    Connection(ConnectionState),
    /// Operator-requested recovery pass.
    RecoveryRequested,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub fingerprint_capacity: usize,
    pub sink_retry: RetryPolicy,
    /// Periodic safety sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
    /// How often a paused delivery tries to resume.
    pub resume_retry: Duration,
    /// On a fresh checkpoint, only recover fills newer than `now - lookback`.
    pub lookback: Option<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            fingerprint_capacity: crate::domain::DEFAULT_FINGERPRINT_CAPACITY,
            sink_retry: RetryPolicy::sink_delivery(),
            sweep_interval: Some(Duration::from_secs(300)),
            resume_retry: Duration::from_secs(10),
            lookback: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Persist(#[from] CheckpointPersistError),
    #[error("sink delivery failed after {attempts} attempt(s): {source}")]
    SinkExhausted {
        attempts: u32,
        #[source]
        source: SinkError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    CheckpointPersist,
    SinkDelivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    Startup,
    Degraded,
    Resubscribed,
    Sweep,
    Requested,
    Coalesced,
}

impl fmt::Display for RecoveryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryTrigger::Startup => "startup",
            RecoveryTrigger::Degraded => "degraded",
            RecoveryTrigger::Resubscribed => "resubscribed",
            RecoveryTrigger::Sweep => "sweep",
            RecoveryTrigger::Requested => "requested",
            RecoveryTrigger::Coalesced => "coalesced",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Completed {
        finished_at: TimeMs,
        selected: usize,
        full_scan: bool,
    },
    Failed {
        finished_at: TimeMs,
        error: String,
    },
}

/// Point-in-time view of the reconciler, published after every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcilerStatus {
    pub user: Address,
    pub connection: ConnectionState,
    pub last_processed_time_ms: TimeMs,
    pub fingerprint_count: usize,
    pub pending_delivery: Option<Fingerprint>,
    pub paused: Option<PauseReason>,
    pub delivered: u64,
    pub duplicates_dropped: u64,
    pub held: usize,
    pub recovery_in_flight: bool,
    pub last_recovery: Option<RecoveryOutcome>,
}

impl ReconcilerStatus {
    fn initial(user: Address) -> Self {
        Self {
            user,
            connection: ConnectionState::Disconnected,
            last_processed_time_ms: TimeMs::default(),
            fingerprint_count: 0,
            pending_delivery: None,
            paused: None,
            delivered: 0,
            duplicates_dropped: 0,
            held: 0,
            recovery_in_flight: false,
            last_recovery: None,
        }
    }
}

type RecoveryTask = JoinHandle<Result<RecoverySet, FetchError>>;

pub struct Reconciler {
    user: Address,
    config: ReconcilerConfig,
    fetcher: Arc<BulkFetcher>,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn NotificationSink>,

    checkpoint: Checkpoint,
    /// Committed but not yet acknowledged by the sink. Mirrors the store.
    pending: Option<PendingDelivery>,
    /// Fills waiting for an in-flight recovery or a paused delivery.
    held: Vec<FillRecord>,
    paused: Option<PauseReason>,
    /// Lower bound for recovery passes when a lookback applies.
    floor: TimeMs,

    connection: ConnectionState,
    gap: bool,
    recovery: Option<RecoveryTask>,
    recovery_queued: bool,
    last_recovery: Option<RecoveryOutcome>,

    delivered: u64,
    duplicates: u64,
    status_tx: watch::Sender<ReconcilerStatus>,
}

impl Reconciler {
    pub fn new(
        user: Address,
        config: ReconcilerConfig,
        fetcher: Arc<BulkFetcher>,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ReconcilerStatus::initial(user.clone()));
        let capacity = config.fingerprint_capacity;
        Self {
            user,
            config,
            fetcher,
            store,
            sink,
            checkpoint: Checkpoint::empty(capacity),
            pending: None,
            held: Vec::new(),
            paused: None,
            floor: TimeMs::default(),
            connection: ConnectionState::Disconnected,
            // Nothing is known about continuity until the first subscription.
            gap: true,
            recovery: None,
            recovery_queued: false,
            last_recovery: None,
            delivered: 0,
            duplicates: 0,
            status_tx,
        }
    }

    /// Receiver for status snapshots.
    pub fn subscribe_status(&self) -> watch::Receiver<ReconcilerStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> ReconcilerStatus {
        ReconcilerStatus {
            user: self.user.clone(),
            connection: self.connection,
            last_processed_time_ms: self.checkpoint.last_processed(),
            fingerprint_count: self.checkpoint.recent().len(),
            pending_delivery: self.pending.as_ref().map(|p| p.fingerprint.clone()),
            paused: self.paused,
            delivered: self.delivered,
            duplicates_dropped: self.duplicates,
            held: self.held.len(),
            recovery_in_flight: self.recovery.is_some(),
            last_recovery: self.last_recovery.clone(),
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Run the actor until shutdown or until every input sender is gone.
    ///
    /// # Errors
    /// Only a failure to load the stored checkpoint at startup is fatal.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ReconcilerInput>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ReconcileError> {
        self.bootstrap().await?;

        let mut sweep = self.config.sweep_interval.map(periodic);
        let mut resume = periodic(self.config.resume_retry);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                joined = join_recovery(&mut self.recovery) => {
                    self.recovery = None;
                    self.finish_recovery(joined).await;
                }
                input = inbox.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => break,
                },
                _ = tick(&mut sweep) => self.request_recovery(RecoveryTrigger::Sweep),
                _ = resume.tick(), if self.paused.is_some() => self.try_resume().await,
            }
            self.publish();
        }

        inbox.close();
        self.stop();
        Ok(())
    }

    /// Load the checkpoint, replay an unacknowledged delivery and start the
    /// startup recovery pass.
    ///
    /// # Errors
    /// Fails if the checkpoint cannot be loaded.
    pub async fn bootstrap(&mut self) -> Result<(), ReconcileError> {
        let stored = self
            .store
            .load(&self.user, self.config.fingerprint_capacity)
            .await?;
        self.checkpoint = stored.checkpoint;
        self.pending = stored.pending;

        if self.checkpoint.is_fresh() {
            if let Some(lookback) = self.config.lookback {
                let lookback_ms = i64::try_from(lookback.as_millis()).unwrap_or(i64::MAX);
                self.floor = TimeMs::new(TimeMs::now().as_i64().saturating_sub(lookback_ms));
                info!(user = %self.user, floor = self.floor.as_i64(), "First run, bounding recovery by lookback");
            }
        }

        info!(
            user = %self.user,
            last_processed = self.checkpoint.last_processed().as_i64(),
            fingerprints = self.checkpoint.recent().len(),
            pending = self.pending.is_some(),
            "Checkpoint loaded"
        );

        if let Some(fingerprint) = self.pending.as_ref().map(|p| p.fingerprint.clone()) {
            info!(user = %self.user, fingerprint = %fingerprint, "Redelivering unacknowledged fill");
            if let Err(e) = self.push_pending().await {
                self.pause(PauseReason::SinkDelivery, &e);
            }
        }

        self.request_recovery(RecoveryTrigger::Startup);
        self.publish();
        Ok(())
    }

    /// Apply one inbound event.
    pub async fn handle_input(&mut self, input: ReconcilerInput) {
        match input {
            ReconcilerInput::StreamFill(fill) => {
                if self.recovery.is_some() || self.paused.is_some() {
                    debug!(user = %self.user, time_ms = fill.time_ms.as_i64(), "Holding stream fill");
                    self.held.push(fill);
                } else {
                    self.deliver_sorted(vec![fill]).await;
                }
            }
            ReconcilerInput::Connection(state) => self.on_connection(state),
            ReconcilerInput::RecoveryRequested => self.request_recovery(RecoveryTrigger::Requested),
        }
        self.publish();
    }

    /// Wait for the in-flight recovery pass, if any, and apply its result.
    /// Returns false if there was none.
    pub async fn settle_recovery(&mut self) -> bool {
        let Some(task) = self.recovery.take() else {
            return false;
        };
        let joined = task.await;
        self.finish_recovery(joined).await;
        self.publish();
        true
    }

    /// Try to leave a paused state.
    pub async fn try_resume(&mut self) {
        let Some(reason) = self.paused.take() else {
            return;
        };
        info!(user = %self.user, ?reason, held = self.held.len(), "Resuming delivery");

        if self.pending.is_some() {
            if let Err(e) = self.push_pending().await {
                self.pause(PauseReason::SinkDelivery, &e);
                return;
            }
        }

        let held = std::mem::take(&mut self.held);
        self.deliver_sorted(held).await;

        if self.paused.is_none() && self.recovery_queued {
            self.recovery_queued = false;
            self.start_recovery(RecoveryTrigger::Coalesced);
        }
    }

    fn on_connection(&mut self, state: ConnectionState) {
        let previous = self.connection;
        self.connection = state;
        debug!(user = %self.user, from = %previous, to = %state, "Stream state");

        if state.signals_gap() {
            self.gap = true;
        }
        match state {
            ConnectionState::Degraded => self.request_recovery(RecoveryTrigger::Degraded),
            ConnectionState::Subscribed if self.gap => {
                self.gap = false;
                self.request_recovery(RecoveryTrigger::Resubscribed);
            }
            ConnectionState::Subscribed
            | ConnectionState::Connecting
            | ConnectionState::Disconnected => {}
        }
    }

    fn request_recovery(&mut self, trigger: RecoveryTrigger) {
        if self.recovery.is_some() || self.paused.is_some() {
            debug!(user = %self.user, %trigger, "Recovery pass queued");
            self.recovery_queued = true;
            return;
        }
        self.start_recovery(trigger);
    }

    fn start_recovery(&mut self, trigger: RecoveryTrigger) {
        let since = self.checkpoint.last_processed().max(self.floor);
        info!(user = %self.user, %trigger, since = since.as_i64(), "Starting recovery pass");
        let fetcher = Arc::clone(&self.fetcher);
        self.recovery = Some(tokio::spawn(async move {
            fetcher.fetch_recovery_set(since).await
        }));
    }

    async fn finish_recovery(&mut self, joined: Result<Result<RecoverySet, FetchError>, JoinError>) {
        let finished_at = TimeMs::now();
        match joined {
            Ok(Ok(set)) => {
                self.last_recovery = Some(RecoveryOutcome::Completed {
                    finished_at,
                    selected: set.fills.len(),
                    full_scan: set.full_scan,
                });
                let mut merged = set.fills;
                merged.append(&mut self.held);
                self.release(merged).await;
            }
            Ok(Err(e)) => {
                warn!(user = %self.user, error = %e, "Recovery pass incomplete, waiting for next trigger");
                self.last_recovery = Some(RecoveryOutcome::Failed {
                    finished_at,
                    error: e.to_string(),
                });
                let held = std::mem::take(&mut self.held);
                self.release(held).await;
            }
            Err(e) if e.is_cancelled() => {
                debug!(user = %self.user, "Recovery pass cancelled");
            }
            Err(e) => {
                error!(user = %self.user, error = %e, "Recovery task panicked");
                self.last_recovery = Some(RecoveryOutcome::Failed {
                    finished_at,
                    error: e.to_string(),
                });
                let held = std::mem::take(&mut self.held);
                self.release(held).await;
            }
        }

        if self.recovery_queued && self.paused.is_none() {
            self.recovery_queued = false;
            self.start_recovery(RecoveryTrigger::Coalesced);
        }
    }

    /// Deliver `fills` now, or keep holding them while paused.
    async fn release(&mut self, fills: Vec<FillRecord>) {
        if self.paused.is_some() {
            self.held.extend(fills);
        } else {
            self.deliver_sorted(fills).await;
        }
    }

    /// Sort and deliver a batch. Stops at the first failure, pausing and
    /// holding whatever was not yet committed.
    async fn deliver_sorted(&mut self, mut fills: Vec<FillRecord>) {
        sort_fills_deterministic(&mut fills);
        let mut queue = fills.into_iter();
        while let Some(fill) = queue.next() {
            match self.deliver_one(&fill).await {
                Ok(()) => {}
                Err(e @ ReconcileError::Persist(_)) => {
                    self.held.push(fill);
                    self.held.extend(queue);
                    self.pause(PauseReason::CheckpointPersist, &e);
                    return;
                }
                Err(e @ ReconcileError::SinkExhausted { .. }) => {
                    self.held.extend(queue);
                    self.pause(PauseReason::SinkDelivery, &e);
                    return;
                }
            }
        }
    }

    async fn deliver_one(&mut self, fill: &FillRecord) -> Result<(), ReconcileError> {
        let fingerprint = fill.fingerprint();
        if self.checkpoint.has_seen(&fingerprint) {
            self.duplicates += 1;
            debug!(user = %self.user, fingerprint = %fingerprint, "Duplicate fill dropped");
            return Ok(());
        }
        if fill.time_ms < self.checkpoint.last_processed() {
            info!(
                user = %self.user,
                fingerprint = %fingerprint,
                time_ms = fill.time_ms.as_i64(),
                last_processed = self.checkpoint.last_processed().as_i64(),
                "Accepting late fill"
            );
        }

        let (next, advance) = self.checkpoint.advanced(fill.time_ms, fingerprint.clone());
        self.store
            .commit(&self.user, &advance, self.config.fingerprint_capacity, fill)
            .await?;
        self.checkpoint = next;
        self.pending = Some(PendingDelivery {
            fingerprint,
            fill: fill.clone(),
        });

        self.push_pending().await
    }

    /// Hand the pending fill to the sink and clear the outbox slot.
    async fn push_pending(&mut self) -> Result<(), ReconcileError> {
        let Some(pending) = self.pending.clone() else {
            return Ok(());
        };
        self.deliver_with_retry(&pending.fill, &pending.fingerprint)
            .await?;
        self.pending = None;
        self.delivered += 1;
        debug!(
            user = %self.user,
            fingerprint = %pending.fingerprint,
            time_ms = pending.fill.time_ms.as_i64(),
            "Fill delivered"
        );

        // A stale slot only costs one repeated delivery after a restart.
        if let Err(e) = self
            .store
            .clear_pending(&self.user, &pending.fingerprint)
            .await
        {
            warn!(user = %self.user, fingerprint = %pending.fingerprint, error = %e, "Failed to clear pending delivery");
        }
        Ok(())
    }

    async fn deliver_with_retry(
        &self,
        fill: &FillRecord,
        fingerprint: &Fingerprint,
    ) -> Result<(), ReconcileError> {
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let sink = &self.sink;
        let policy = self.config.sink_retry;

        retry(policy.to_backoff(), move || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            sink.deliver(fill, fingerprint).await.map_err(|err| {
                if !policy.allows_another(attempt) {
                    return backoff::Error::permanent(err);
                }
                warn!(attempt, fingerprint = %fingerprint, error = %err, "Sink delivery failed, retrying");
                backoff::Error::transient(err)
            })
        })
        .await
        .map_err(|source| ReconcileError::SinkExhausted {
            attempts: attempts.load(Ordering::SeqCst),
            source,
        })
    }

    fn pause(&mut self, reason: PauseReason, err: &ReconcileError) {
        self.paused = Some(reason);
        error!(
            alert = true,
            user = %self.user,
            ?reason,
            held = self.held.len(),
            error = %err,
            "Delivery paused"
        );
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn stop(&mut self) {
        if let Some(task) = self.recovery.take() {
            task.abort();
            info!(user = %self.user, "Aborted in-flight recovery pass");
        }
        self.publish();
        info!(
            user = %self.user,
            last_processed = self.checkpoint.last_processed().as_i64(),
            held = self.held.len(),
            "Reconciler stopped"
        );
    }
}

fn periodic(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn join_recovery(
    task: &mut Option<RecoveryTask>,
) -> Result<Result<RecoverySet, FetchError>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{DataSourceError, MockDataSource};
    use crate::db::MemoryCheckpointStore;
    use crate::domain::{Coin, Decimal, Direction, Side};
    use crate::orchestration::fetcher::RecoveryScan;
    use crate::sink::MemorySink;

    fn make_fill(time_ms: i64, tid: i64) -> FillRecord {
        FillRecord {
            symbol: Coin::new("BTC".to_string()),
            side: Side::Buy,
            size: Decimal::from_str_canonical("1").unwrap(),
            price: Decimal::from_str_canonical("100").unwrap(),
            time_ms: TimeMs::new(time_ms),
            direction: Direction::OpenLong,
            realized_pnl: Decimal::zero(),
            fee: Decimal::zero(),
            fee_asset: "USDC".to_string(),
            order_id: tid,
            trade_id: tid,
            tx_hash: String::new(),
            crossed_spread: true,
            liquidation: false,
            builder_fee: None,
            start_position: None,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            factor: 2.0,
            cap: Duration::from_millis(2),
            max_attempts: Some(max_attempts),
        }
    }

    struct Harness {
        source: MockDataSource,
        store: MemoryCheckpointStore,
        sink: MemorySink,
        fetch_timeout: Duration,
    }

    impl Harness {
        fn new(fills: Vec<FillRecord>) -> Self {
            Self {
                source: MockDataSource::new().with_fills(fills),
                store: MemoryCheckpointStore::new(),
                sink: MemorySink::new(),
                fetch_timeout: crate::orchestration::fetcher::DEFAULT_ATTEMPT_TIMEOUT,
            }
        }

        fn reconciler(&self) -> Reconciler {
            self.reconciler_with(ReconcilerConfig {
                fingerprint_capacity: 16,
                sink_retry: fast_retry(3),
                sweep_interval: None,
                resume_retry: Duration::from_millis(5),
                lookback: None,
            })
        }

        fn reconciler_with(&self, config: ReconcilerConfig) -> Reconciler {
            let user = Address::new("0xabc".to_string());
            let fetcher = BulkFetcher::new(
                Arc::new(self.source.clone()),
                user.clone(),
                fast_retry(2),
                RecoveryScan::EarlyStop,
            )
            .with_attempt_timeout(self.fetch_timeout);
            Reconciler::new(
                user,
                config,
                Arc::new(fetcher),
                Arc::new(self.store.clone()),
                Arc::new(self.sink.clone()),
            )
        }
    }

    #[tokio::test]
    async fn test_startup_recovery_delivers_in_order() {
        let h = Harness::new(vec![make_fill(100, 1), make_fill(300, 3), make_fill(200, 2)]);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        assert!(r.settle_recovery().await);

        assert_eq!(h.sink.delivered_times(), vec![100, 200, 300]);
        assert_eq!(r.checkpoint().last_processed(), TimeMs::new(300));
        assert_eq!(r.status().pending_delivery, None);
        assert!(h.store.pending(&Address::new("0xabc".to_string())).is_none());
    }

    #[tokio::test]
    async fn test_stream_fill_during_recovery_is_merged() {
        let h = Harness::new(vec![make_fill(100, 1), make_fill(200, 2), make_fill(300, 3)]);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();

        r.handle_input(ReconcilerInput::StreamFill(make_fill(250, 25)))
            .await;
        r.handle_input(ReconcilerInput::StreamFill(make_fill(300, 3)))
            .await;
        assert!(h.sink.delivered().is_empty(), "held while recovery runs");
        assert_eq!(r.status().held, 2);

        r.settle_recovery().await;
        assert_eq!(h.sink.delivered_times(), vec![100, 200, 250, 300]);
        assert_eq!(r.status().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_duplicate_after_delivery_is_dropped() {
        let h = Harness::new(vec![make_fill(100, 1)]);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        r.settle_recovery().await;

        r.handle_input(ReconcilerInput::StreamFill(make_fill(100, 1)))
            .await;
        r.handle_input(ReconcilerInput::StreamFill(make_fill(150, 2)))
            .await;
        assert_eq!(h.sink.delivered_times(), vec![100, 150]);
    }

    #[tokio::test]
    async fn test_late_fill_accepted_without_moving_checkpoint_back() {
        let h = Harness::new(vec![make_fill(500, 5)]);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        r.settle_recovery().await;

        r.handle_input(ReconcilerInput::StreamFill(make_fill(400, 4)))
            .await;
        assert_eq!(h.sink.delivered_times(), vec![500, 400]);
        assert_eq!(r.checkpoint().last_processed(), TimeMs::new(500));
    }

    #[tokio::test]
    async fn test_resubscription_after_gap_triggers_recovery() {
        let h = Harness::new(vec![make_fill(100, 1)]);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        r.settle_recovery().await;

        r.handle_input(ReconcilerInput::Connection(ConnectionState::Connecting))
            .await;
        r.handle_input(ReconcilerInput::Connection(ConnectionState::Subscribed))
            .await;
        assert!(r.settle_recovery().await, "first subscription is checked");

        r.handle_input(ReconcilerInput::Connection(ConnectionState::Disconnected))
            .await;
        h.source.push_fill(make_fill(200, 2));
        h.source.push_fill(make_fill(210, 3));
        assert!(!r.status().recovery_in_flight);

        r.handle_input(ReconcilerInput::Connection(ConnectionState::Connecting))
            .await;
        r.handle_input(ReconcilerInput::Connection(ConnectionState::Subscribed))
            .await;
        assert!(r.settle_recovery().await);
        assert_eq!(h.sink.delivered_times(), vec![100, 200, 210]);

        r.handle_input(ReconcilerInput::Connection(ConnectionState::Subscribed))
            .await;
        assert!(!r.status().recovery_in_flight, "no gap, no pass");
    }

    #[tokio::test]
    async fn test_requests_during_recovery_are_coalesced() {
        let h = Harness::new(vec![make_fill(100, 1)]);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();

        r.handle_input(ReconcilerInput::Connection(ConnectionState::Degraded))
            .await;
        r.handle_input(ReconcilerInput::RecoveryRequested).await;
        r.handle_input(ReconcilerInput::RecoveryRequested).await;

        assert!(r.settle_recovery().await);
        assert!(r.settle_recovery().await, "one queued pass follows");
        assert!(!r.settle_recovery().await);
        assert_eq!(h.source.calls(), 2);
        assert_eq!(h.sink.delivered_times(), vec![100]);
    }

    #[tokio::test]
    async fn test_fetch_failure_releases_held_fills() {
        let h = Harness::new(vec![]);
        h.source.fail_next(DataSourceError::HttpError {
            status: 400,
            message: "bad request".to_string(),
        });
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        r.handle_input(ReconcilerInput::StreamFill(make_fill(100, 1)))
            .await;
        r.settle_recovery().await;

        assert_eq!(h.sink.delivered_times(), vec![100]);
        assert!(matches!(
            r.status().last_recovery,
            Some(RecoveryOutcome::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_hung_recovery_fetch_releases_live_fills() {
        let mut h = Harness::new(vec![]);
        h.source = MockDataSource::new().with_latency(Duration::from_secs(10 * 24 * 3600));
        h.fetch_timeout = Duration::from_millis(20);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();

        r.handle_input(ReconcilerInput::StreamFill(make_fill(100, 1)))
            .await;
        assert_eq!(r.status().held, 1);

        let settled = tokio::time::timeout(Duration::from_secs(5), r.settle_recovery())
            .await
            .expect("recovery pass never gave up on the hung fetch");
        assert!(settled);

        assert_eq!(h.sink.delivered_times(), vec![100]);
        let status = r.status();
        assert_eq!(status.held, 0);
        assert!(!status.recovery_in_flight);
        assert!(matches!(
            status.last_recovery,
            Some(RecoveryOutcome::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_persist_failure_pauses_then_resumes() {
        let h = Harness::new(vec![make_fill(100, 1), make_fill(200, 2)]);
        h.store.fail_next_commits(1);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        r.settle_recovery().await;

        assert!(h.sink.delivered().is_empty());
        assert_eq!(r.status().paused, Some(PauseReason::CheckpointPersist));
        assert_eq!(r.checkpoint().last_processed(), TimeMs::default());

        r.handle_input(ReconcilerInput::StreamFill(make_fill(300, 3)))
            .await;
        assert_eq!(r.status().held, 3);

        r.try_resume().await;
        assert_eq!(r.status().paused, None);
        assert_eq!(h.sink.delivered_times(), vec![100, 200, 300]);
        assert_eq!(r.checkpoint().last_processed(), TimeMs::new(300));
    }

    #[tokio::test]
    async fn test_recovery_requested_while_paused_runs_after_resume() {
        let h = Harness::new(vec![make_fill(100, 1)]);
        h.sink.fail_next(3);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        r.settle_recovery().await;
        assert_eq!(r.status().paused, Some(PauseReason::SinkDelivery));

        h.source.push_fill(make_fill(200, 2));
        r.handle_input(ReconcilerInput::RecoveryRequested).await;
        assert!(!r.status().recovery_in_flight, "no pass starts while paused");

        r.try_resume().await;
        assert_eq!(r.status().paused, None);
        assert_eq!(h.sink.delivered_times(), vec![100]);
        assert!(r.status().recovery_in_flight, "queued pass starts on resume");

        assert!(r.settle_recovery().await);
        assert_eq!(h.sink.delivered_times(), vec![100, 200]);
    }

    #[tokio::test]
    async fn test_sink_exhaustion_keeps_pending_and_redelivers_on_restart() {
        let h = Harness::new(vec![make_fill(100, 1), make_fill(200, 2)]);
        h.sink.fail_next(3);
        let mut r = h.reconciler();
        r.bootstrap().await.unwrap();
        r.settle_recovery().await;

        let user = Address::new("0xabc".to_string());
        assert_eq!(r.status().paused, Some(PauseReason::SinkDelivery));
        assert_eq!(h.sink.attempts(), 3);
        assert_eq!(
            h.store.pending(&user).map(|p| p.fill.time_ms),
            Some(TimeMs::new(100))
        );
        assert_eq!(r.checkpoint().last_processed(), TimeMs::new(100));
        drop(r);

        let mut restarted = h.reconciler();
        restarted.bootstrap().await.unwrap();
        restarted.settle_recovery().await;
        assert_eq!(h.sink.delivered_times(), vec![100, 200]);
        assert!(h.store.pending(&user).is_none());
        assert_eq!(restarted.status().delivered, 2);
    }

    #[tokio::test]
    async fn test_lookback_bounds_first_recovery() {
        let now = TimeMs::now().as_i64();
        let h = Harness::new(vec![make_fill(now - 3_600_000, 1), make_fill(now - 1_000, 2)]);
        let mut r = h.reconciler_with(ReconcilerConfig {
            fingerprint_capacity: 16,
            sink_retry: fast_retry(1),
            sweep_interval: None,
            resume_retry: Duration::from_millis(5),
            lookback: Some(Duration::from_secs(60)),
        });
        r.bootstrap().await.unwrap();
        r.settle_recovery().await;
        assert_eq!(h.sink.delivered_times(), vec![now - 1_000]);
    }

    #[tokio::test]
    async fn test_run_loop_publishes_status_and_stops() {
        let mut h = Harness::new(vec![]);
        h.source = MockDataSource::new()
            .with_fills(vec![make_fill(100, 1), make_fill(200, 2)])
            .with_latency(Duration::from_millis(50));
        let r = h.reconciler();
        let mut status = r.subscribe_status();
        let (tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(rx, stop_rx));

        tx.send(ReconcilerInput::StreamFill(make_fill(150, 15)))
            .await
            .unwrap();
        let seen = tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.delivered == 3 && !s.recovery_in_flight),
        )
        .await
        .expect("status never caught up")
        .unwrap()
        .clone();
        assert_eq!(seen.last_processed_time_ms, TimeMs::new(200));
        assert_eq!(h.sink.delivered_times(), vec![100, 150, 200]);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_periodic_sweep_picks_up_missed_fills() {
        let h = Harness::new(vec![make_fill(100, 1)]);
        let r = h.reconciler_with(ReconcilerConfig {
            fingerprint_capacity: 16,
            sink_retry: fast_retry(3),
            sweep_interval: Some(Duration::from_millis(30)),
            resume_retry: Duration::from_millis(5),
            lookback: None,
        });
        let mut status = r.subscribe_status();
        let (_tx, rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(r.run(rx, stop_rx));

        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.delivered == 1),
        )
        .await
        .expect("startup pass never delivered")
        .unwrap();

        // No connection event follows; only the sweep can find this one.
        h.source.push_fill(make_fill(200, 2));
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.delivered == 2),
        )
        .await
        .expect("sweep never picked up the missed fill")
        .unwrap();

        assert_eq!(h.sink.delivered_times(), vec![100, 200]);
        assert!(h.source.calls() >= 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}

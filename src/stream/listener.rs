//! Subscription lifecycle: connect, keep alive, reconnect.

use super::{parse_frame, FeedMessage, Frame, StreamConnector, StreamError, StreamSession};
use crate::domain::{Address, ConnectionState};
use crate::orchestration::reconciler::ReconcilerInput;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// Silence after which a subscription counts as degraded.
    pub heartbeat_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect: RetryPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(45),
            ping_interval: Duration::from_secs(20),
            reconnect: RetryPolicy::reconnect(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Shutdown,
}

/// Long-running stream task for one account.
///
/// Forwards live fills and every connection state change to the reconciler.
/// Snapshot frames and frames for other accounts are dropped.
#[derive(Debug)]
pub struct StreamListener {
    connector: Arc<dyn StreamConnector>,
    user: Address,
    config: ListenerConfig,
    tx: mpsc::Sender<ReconcilerInput>,
    state: ConnectionState,
}

impl StreamListener {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        user: Address,
        config: ListenerConfig,
        tx: mpsc::Sender<ReconcilerInput>,
    ) -> Self {
        Self {
            connector,
            user,
            config,
            tx,
            state: ConnectionState::Disconnected,
        }
    }

    /// Run until `shutdown` flips or the reconciler goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        while !*shutdown.borrow() {
            if !self.set_state(ConnectionState::Connecting).await {
                return;
            }

            let connected = tokio::select! {
                res = self.connector.connect(&self.user) => res,
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::Disconnected).await;
                    break;
                }
            };

            match connected {
                Ok(session) => {
                    if self.drive(session, &mut shutdown, &mut attempt).await
                        == SessionEnd::Shutdown
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(user = %self.user, error = %e, "Stream connect failed");
                    if !self.set_state(ConnectionState::Disconnected).await {
                        return;
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.reconnect.jittered_delay_for(attempt);
            info!(user = %self.user, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting stream");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(user = %self.user, "Stream listener stopped");
    }

    async fn drive(
        &mut self,
        mut session: Box<dyn StreamSession>,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> SessionEnd {
        let heartbeat = self.config.heartbeat_timeout;
        let deadline = sleep_until(Instant::now() + heartbeat);
        tokio::pin!(deadline);
        let mut ping = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    session.close().await;
                    break SessionEnd::Shutdown;
                }
                _ = &mut deadline => {
                    warn!(
                        user = %self.user,
                        timeout_ms = heartbeat.as_millis() as u64,
                        state = %self.state,
                        "Stream heartbeat timed out"
                    );
                    if self.state == ConnectionState::Subscribed
                        && !self.set_state(ConnectionState::Degraded).await
                    {
                        break SessionEnd::Shutdown;
                    }
                    session.close().await;
                    break SessionEnd::Lost;
                }
                _ = ping.tick() => {
                    if let Err(e) = session.ping().await {
                        warn!(user = %self.user, error = %e, "Stream ping failed");
                        break SessionEnd::Lost;
                    }
                }
                frame = session.next_frame() => {
                    match frame {
                        None => {
                            info!(user = %self.user, "Stream closed by peer");
                            break SessionEnd::Lost;
                        }
                        Some(Err(StreamError::Deserialization(e))) => {
                            deadline.as_mut().reset(Instant::now() + heartbeat);
                            warn!(user = %self.user, error = %e, "Skipping malformed frame");
                        }
                        Some(Err(e)) => {
                            warn!(user = %self.user, error = %e, "Stream transport failure");
                            break SessionEnd::Lost;
                        }
                        Some(Ok(frame)) => {
                            deadline.as_mut().reset(Instant::now() + heartbeat);
                            if let Frame::Text(text) = frame {
                                if !self.handle_text(&text, attempt).await {
                                    session.close().await;
                                    break SessionEnd::Shutdown;
                                }
                            }
                        }
                    }
                }
            }
        };

        if !self.set_state(ConnectionState::Disconnected).await {
            return SessionEnd::Shutdown;
        }
        end
    }

    /// Returns false once the reconciler is gone.
    async fn handle_text(&mut self, text: &str, attempt: &mut u32) -> bool {
        let message = match parse_frame(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(user = %self.user, error = %e, "Skipping malformed frame");
                return true;
            }
        };

        match message {
            FeedMessage::SubscriptionAck => {
                if self.state == ConnectionState::Connecting {
                    *attempt = 0;
                    info!(user = %self.user, "Fill subscription active");
                    return self.set_state(ConnectionState::Subscribed).await;
                }
                true
            }
            FeedMessage::Fills {
                is_snapshot,
                user,
                fills,
                skipped,
            } => {
                if user.as_ref().is_some_and(|u| u != &self.user) {
                    debug!(user = %self.user, other = ?user, "Ignoring fills for another account");
                    return true;
                }
                if is_snapshot {
                    debug!(
                        user = %self.user,
                        count = fills.len(),
                        "Dropping snapshot frame; recovery covers it"
                    );
                    return true;
                }
                if skipped > 0 {
                    warn!(user = %self.user, skipped, "Frame carried malformed fills");
                }
                for fill in fills {
                    if self.tx.send(ReconcilerInput::StreamFill(fill)).await.is_err() {
                        return false;
                    }
                }
                true
            }
            FeedMessage::Pong => true,
            FeedMessage::Error(reason) => {
                warn!(user = %self.user, reason, "Exchange reported stream error");
                true
            }
            FeedMessage::Other(channel) => {
                debug!(user = %self.user, channel, "Ignoring channel");
                true
            }
        }
    }

    /// Move to `next` and tell the reconciler. Returns false once the
    /// reconciler is gone.
    async fn set_state(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return true;
        }
        self.state = match self.state.transition(next) {
            Ok(state) => state,
            Err(e) => {
                error!(user = %self.user, error = %e, "Forcing connection state");
                next
            }
        };
        debug!(user = %self.user, state = %self.state, "Connection state changed");
        self.tx
            .send(ReconcilerInput::Connection(self.state))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ScriptStep, ScriptedConnector};
    use tokio::time::timeout;

    const USER: &str = "0xabc";

    fn ack() -> ScriptStep {
        ScriptStep::Text(r#"{"channel":"subscriptionResponse","data":{}}"#.to_string())
    }

    fn fills_frame(user: &str, snapshot: bool, tids: &[i64]) -> ScriptStep {
        let fills: Vec<serde_json::Value> = tids
            .iter()
            .map(|tid| {
                serde_json::json!({
                    "coin": "BTC", "px": "100", "sz": "1", "side": "B",
                    "time": tid * 100, "oid": 1, "tid": tid
                })
            })
            .collect();
        ScriptStep::Text(
            serde_json::json!({
                "channel": "userFills",
                "data": { "isSnapshot": snapshot, "user": user, "fills": fills }
            })
            .to_string(),
        )
    }

    fn fast_config() -> ListenerConfig {
        ListenerConfig {
            heartbeat_timeout: Duration::from_millis(80),
            ping_interval: Duration::from_millis(30),
            reconnect: RetryPolicy {
                base: Duration::from_millis(1),
                factor: 2.0,
                cap: Duration::from_millis(5),
                max_attempts: None,
            },
        }
    }

    fn spawn(
        connector: ScriptedConnector,
    ) -> (
        mpsc::Receiver<ReconcilerInput>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = StreamListener::new(
            Arc::new(connector),
            Address::new(USER.to_string()),
            fast_config(),
            tx,
        );
        (rx, stop_tx, tokio::spawn(listener.run(stop_rx)))
    }

    async fn next(rx: &mut mpsc::Receiver<ReconcilerInput>) -> ReconcilerInput {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("listener produced nothing")
            .expect("listener channel closed")
    }

    fn state(input: ReconcilerInput) -> ConnectionState {
        match input {
            ReconcilerInput::Connection(s) => s,
            other => panic!("expected state change, got {other:?}"),
        }
    }

    fn trade_id(input: ReconcilerInput) -> i64 {
        match input {
            ReconcilerInput::StreamFill(f) => f.trade_id,
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forwards_live_fills_and_drops_snapshots() {
        let connector = ScriptedConnector::new().session(vec![
            ack(),
            fills_frame(USER, true, &[1, 2]),
            fills_frame("0xother", false, &[9]),
            ScriptStep::Text("garbage".to_string()),
            fills_frame(USER, false, &[3, 4]),
            ScriptStep::Stall,
        ]);
        let (mut rx, stop, handle) = spawn(connector);

        assert_eq!(state(next(&mut rx).await), ConnectionState::Connecting);
        assert_eq!(state(next(&mut rx).await), ConnectionState::Subscribed);
        assert_eq!(trade_id(next(&mut rx).await), 3);
        assert_eq!(trade_id(next(&mut rx).await), 4);

        stop.send(true).unwrap();
        assert_eq!(state(next(&mut rx).await), ConnectionState::Disconnected);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_silence_degrades_then_reconnects() {
        let connector = ScriptedConnector::new()
            .session(vec![ack(), ScriptStep::Stall])
            .session(vec![ack(), ScriptStep::Stall]);
        let handle_connector = connector.clone();
        let (mut rx, stop, handle) = spawn(connector);

        let expected = [
            ConnectionState::Connecting,
            ConnectionState::Subscribed,
            ConnectionState::Degraded,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Subscribed,
        ];
        for want in expected {
            assert_eq!(state(next(&mut rx).await), want);
        }
        assert_eq!(handle_connector.connects(), 2);
        assert!(handle_connector.pings() >= 1, "pings are sent while subscribed");
        assert!(handle_connector.closes() >= 1);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connect_and_peer_close_retry() {
        let connector = ScriptedConnector::new()
            .refuse(StreamError::Transport("refused".to_string()))
            .session(vec![ack(), ScriptStep::Close])
            .session(vec![ack(), ScriptStep::Stall]);
        let (mut rx, stop, handle) = spawn(connector);

        let expected = [
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Subscribed,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Subscribed,
        ];
        for want in expected {
            assert_eq!(state(next(&mut rx).await), want);
        }

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_alive() {
        let connector = ScriptedConnector::new().session(vec![
            ack(),
            ScriptStep::Fail(StreamError::Deserialization("bad utf8".to_string())),
            ScriptStep::Text(r#"{"channel":"userFills","data":{}}"#.to_string()),
            fills_frame(USER, false, &[7]),
            ScriptStep::Stall,
        ]);
        let handle_connector = connector.clone();
        let (mut rx, stop, handle) = spawn(connector);

        assert_eq!(state(next(&mut rx).await), ConnectionState::Connecting);
        assert_eq!(state(next(&mut rx).await), ConnectionState::Subscribed);
        assert_eq!(trade_id(next(&mut rx).await), 7);
        assert_eq!(handle_connector.connects(), 1);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }
}

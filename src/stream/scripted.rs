//! Scripted connector for exercising the listener without a network.

use super::{Frame, StreamConnector, StreamError, StreamSession};
use crate::domain::Address;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One step of a scripted session.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Yield a text frame.
    Text(String),
    /// Yield an error.
    Fail(StreamError),
    /// Pause before the next step.
    Wait(Duration),
    /// Go silent until closed.
    Stall,
    /// Peer closes the connection.
    Close,
}

#[derive(Debug, Default)]
struct ScriptState {
    attempts: VecDeque<Result<Vec<ScriptStep>, StreamError>>,
    connects: usize,
}

/// Connector that plays back one script per connection attempt.
///
/// Once the scripts run out, further connects never complete. Clones share
/// state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ScriptState>>,
    pings: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connection that plays `steps`.
    pub fn session(self, steps: Vec<ScriptStep>) -> Self {
        self.lock().attempts.push_back(Ok(steps));
        self
    }

    /// Queue a failed connection attempt.
    pub fn refuse(self, err: StreamError) -> Self {
        self.lock().attempts.push_back(Err(err));
        self
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, _user: &Address) -> Result<Box<dyn StreamSession>, StreamError> {
        let next = {
            let mut state = self.lock();
            state.connects += 1;
            state.attempts.pop_front()
        };
        match next {
            Some(Ok(steps)) => Ok(Box::new(ScriptedSession {
                steps: steps.into(),
                wait_until: None,
                pings: Arc::clone(&self.pings),
                closes: Arc::clone(&self.closes),
            })),
            Some(Err(e)) => Err(e),
            None => futures::future::pending().await,
        }
    }
}

struct ScriptedSession {
    steps: VecDeque<ScriptStep>,
    // Survives cancellation of `next_frame` mid-wait.
    wait_until: Option<Instant>,
    pings: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamSession for ScriptedSession {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        loop {
            match self.steps.front()? {
                ScriptStep::Wait(pause) => {
                    let deadline = *self.wait_until.get_or_insert(Instant::now() + *pause);
                    tokio::time::sleep_until(deadline).await;
                    self.wait_until = None;
                    self.steps.pop_front();
                }
                ScriptStep::Stall => return futures::future::pending().await,
                ScriptStep::Close => {
                    self.steps.clear();
                    return None;
                }
                ScriptStep::Text(_) | ScriptStep::Fail(_) => {
                    return match self.steps.pop_front()? {
                        ScriptStep::Text(text) => Some(Ok(Frame::Text(text))),
                        ScriptStep::Fail(e) => Some(Err(e)),
                        _ => None,
                    };
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), StreamError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.steps.clear();
    }
}

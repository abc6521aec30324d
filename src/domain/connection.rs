//! Stream connection lifecycle.

use serde::Serialize;
use thiserror::Error;

/// State of the live fill subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    /// Subscribed on paper but silent past the heartbeat timeout.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal connection transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Subscribed)
                | (Connecting, Disconnected)
                | (Subscribed, Disconnected)
                | (Subscribed, Degraded)
                | (Degraded, Disconnected)
        )
    }

    /// Validate and perform a transition.
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, IllegalTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    /// States after which events may have been missed.
    pub fn signals_gap(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Degraded)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

//! Live fill subscription.
//!
//! The listener owns one logical subscription per monitored account and turns
//! raw frames into fills and connection state changes for the reconciler.
//! Transports plug in through [`StreamConnector`] / [`StreamSession`].

use crate::datasource::parse::parse_fill;
use crate::domain::{Address, FillRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::warn;

pub mod hyperliquid;
pub mod listener;
pub mod scripted;

pub use hyperliquid::HyperliquidStreamConnector;
pub use listener::{ListenerConfig, StreamListener};
pub use scripted::{ScriptStep, ScriptedConnector};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream transport error: {0}")]
    Transport(String),
    #[error("malformed stream frame: {0}")]
    Deserialization(String),
    #[error("stream closed")]
    Closed,
}

/// One unit read off a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Transport-level keepalive traffic. Counts for liveness only.
    Keepalive,
}

/// Opens subscribed sessions for an account.
#[async_trait]
pub trait StreamConnector: Send + Sync + fmt::Debug {
    /// Connect and send the fill subscription for `user`.
    ///
    /// The subscription is only confirmed once the session yields an
    /// acknowledgement frame.
    async fn connect(&self, user: &Address) -> Result<Box<dyn StreamSession>, StreamError>;
}

/// An open connection. `next_frame` must be cancel safe: the listener polls it
/// alongside its ping and heartbeat timers.
#[async_trait]
pub trait StreamSession: Send {
    /// Next frame, or `None` once the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>>;

    /// Send an application-level ping.
    async fn ping(&mut self) -> Result<(), StreamError>;

    /// Close the connection. Errors are irrelevant at this point.
    async fn close(&mut self);
}

/// A decoded exchange frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    SubscriptionAck,
    Fills {
        is_snapshot: bool,
        user: Option<Address>,
        fills: Vec<FillRecord>,
        /// Fill objects dropped as malformed.
        skipped: usize,
    },
    Pong,
    Error(String),
    Other(String),
}

/// Subscribe request for the `userFills` channel.
pub fn subscribe_message(user: &Address) -> String {
    serde_json::json!({
        "method": "subscribe",
        "subscription": { "type": "userFills", "user": user.as_str() },
    })
    .to_string()
}

pub fn ping_message() -> String {
    serde_json::json!({ "method": "ping" }).to_string()
}

/// Decode one text frame.
///
/// Individual malformed fills are logged and counted in `skipped`; only a
/// frame that is not a channel envelope at all is an error.
pub fn parse_frame(text: &str) -> Result<FeedMessage, StreamError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| StreamError::Deserialization(e.to_string()))?;
    let channel = value
        .get("channel")
        .and_then(Value::as_str)
        .ok_or_else(|| StreamError::Deserialization("frame without channel".to_string()))?;
    let data = value.get("data").unwrap_or(&Value::Null);

    match channel {
        "subscriptionResponse" => Ok(FeedMessage::SubscriptionAck),
        "pong" => Ok(FeedMessage::Pong),
        "error" => Ok(FeedMessage::Error(
            data.as_str()
                .map(str::to_string)
                .unwrap_or_else(|| data.to_string()),
        )),
        "userFills" => {
            let raw_fills = data
                .get("fills")
                .and_then(Value::as_array)
                .ok_or_else(|| StreamError::Deserialization("userFills without fills".to_string()))?;
            let is_snapshot = data
                .get("isSnapshot")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let user = data
                .get("user")
                .and_then(Value::as_str)
                .map(|u| Address::new(u.to_string()));

            let mut fills = Vec::with_capacity(raw_fills.len());
            let mut skipped = 0;
            for raw in raw_fills {
                match parse_fill(raw) {
                    Ok(fill) => fills.push(fill),
                    Err(e) => {
                        skipped += 1;
                        warn!(error = %e, "Skipping malformed stream fill");
                    }
                }
            }
            Ok(FeedMessage::Fills {
                is_snapshot,
                user,
                fills,
                skipped,
            })
        }
        other => Ok(FeedMessage::Other(other.to_string())),
    }
}

//! Notification sink boundary: the consumer of the ordered, deduplicated
//! fill stream.

use crate::domain::{FillRecord, Fingerprint};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub mod log;
pub mod memory;
pub mod webhook;

pub use self::log::LogSink;
pub use memory::MemorySink;
pub use webhook::WebhookSink;

/// A delivery the sink could not accept right now. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sink delivery failed: {0}")]
pub struct SinkError(pub String);

/// Consumer of delivered fills.
///
/// Fills arrive in delivery order. `deliver` must either accept the fill
/// before returning `Ok` or buffer it durably itself. The same fill can be
/// handed over again after a crash; implementations dedupe on `fingerprint`.
#[async_trait]
pub trait NotificationSink: Send + Sync + fmt::Debug {
    async fn deliver(&self, fill: &FillRecord, fingerprint: &Fingerprint)
        -> Result<(), SinkError>;
}

/// JSON payload handed to external consumers.
#[derive(Debug, Serialize)]
pub struct FillNotification<'a> {
    pub fingerprint: &'a Fingerprint,
    pub fill: &'a FillRecord,
}

impl<'a> FillNotification<'a> {
    pub fn new(fill: &'a FillRecord, fingerprint: &'a Fingerprint) -> Self {
        Self { fingerprint, fill }
    }
}

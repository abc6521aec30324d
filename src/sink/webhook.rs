//! HTTP webhook sink.

use super::{FillNotification, NotificationSink, SinkError};
use crate::domain::{FillRecord, Fingerprint};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Posts each fill as JSON to an external endpoint.
///
/// Any non-2xx response or transport failure is reported as a `SinkError`
/// and retried by the reconciler.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(
        &self,
        fill: &FillRecord,
        fingerprint: &Fingerprint,
    ) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", fingerprint.as_str())
            .json(&FillNotification::new(fill, fingerprint))
            .send()
            .await
            .map_err(|e| SinkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError(format!("webhook responded {}", status.as_u16())));
        }
        debug!(fingerprint = %fingerprint, "Webhook accepted fill");
        Ok(())
    }
}

//! Hyperliquid Info API client for the fill history endpoint.

use super::parse::parse_fill;
use super::{DataSourceError, FillHistorySource};
use crate::domain::{Address, FillRecord};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Hyperliquid data source using the public Info API.
#[derive(Debug, Clone)]
pub struct HyperliquidDataSource {
    client: Client,
    base_url: String,
}

impl HyperliquidDataSource {
    /// Create a new Hyperliquid data source with a 30s request timeout.
    pub fn new(base_url: String) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create a data source whose requests fail with `NetworkError` once
    /// `timeout` elapses.
    pub fn with_timeout(base_url: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_info(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, DataSourceError> {
        let url = format!("{}/info", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DataSourceError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(DataSourceError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(DataSourceError::HttpError {
                status: status.as_u16(),
                message: "Server error".to_string(),
            });
        }
        if !status.is_success() {
            return Err(DataSourceError::HttpError {
                status: status.as_u16(),
                message: "Client error".to_string(),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| DataSourceError::ParseError(e.to_string()))
    }
}

#[async_trait]
impl FillHistorySource for HyperliquidDataSource {
    async fn fetch_user_fills(&self, user: &Address) -> Result<Vec<FillRecord>, DataSourceError> {
        debug!(user = %user, "Fetching fill history");

        let payload = serde_json::json!({
            "type": "userFills",
            "user": user.as_str(),
        });

        let response = self.post_info(payload).await?;
        parse_fill_history(&response)
    }
}

/// Parse the `userFills` response, skipping individual malformed fills.
pub(crate) fn parse_fill_history(
    response: &serde_json::Value,
) -> Result<Vec<FillRecord>, DataSourceError> {
    let fills_json = response
        .as_array()
        .ok_or_else(|| DataSourceError::ParseError("Expected array response".to_string()))?;

    let mut fills = Vec::with_capacity(fills_json.len());
    for fill_json in fills_json {
        match parse_fill(fill_json) {
            Ok(fill) => fills.push(fill),
            Err(e) => warn!(error = %e, "Skipping malformed fill in history"),
        }
    }
    Ok(fills)
}

/// `Retry-After` in delay-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

//! Data source abstraction for the exchange's fill history endpoint.

use crate::domain::{Address, FillRecord};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub mod hyperliquid;
pub mod mock;
pub mod parse;

pub use hyperliquid::HyperliquidDataSource;
pub use mock::MockDataSource;

/// Source of a user's complete fill history.
///
/// A single call is one request against a rate-limited endpoint; callers are
/// responsible for retries so that the retry budget is enforced in one place.
#[async_trait]
pub trait FillHistorySource: Send + Sync + fmt::Debug {
    /// Fetch the user's fill history as returned by the exchange.
    ///
    /// # Returns
    /// Fills newest-first. The exchange offers no time filter, so the whole
    /// retained history comes back on every call.
    async fn fetch_user_fills(&self, user: &Address) -> Result<Vec<FillRecord>, DataSourceError>;
}

/// Error type for data source operations.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSourceError {
    /// Network error (e.g., connection timeout, DNS failure)
    NetworkError(String),
    /// HTTP error status other than 429
    HttpError { status: u16, message: String },
    /// Parsing error (invalid JSON or malformed response)
    ParseError(String),
    /// Rate limit exceeded; `retry_after` is honored when the exchange sends one
    RateLimited { retry_after: Option<Duration> },
}

impl DataSourceError {
    /// Transport failures, rate limits and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            DataSourceError::NetworkError(_) | DataSourceError::RateLimited { .. } => true,
            DataSourceError::HttpError { status, .. } => *status >= 500,
            DataSourceError::ParseError(_) => false,
        }
    }

    /// Explicit delay requested by the exchange, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DataSourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            DataSourceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            DataSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DataSourceError::RateLimited { retry_after: None } => write!(f, "Rate limited"),
            DataSourceError::RateLimited {
                retry_after: Some(d),
            } => write!(f, "Rate limited (retry after {}ms)", d.as_millis()),
        }
    }
}

impl std::error::Error for DataSourceError {}

pub mod api;
pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod error;
pub mod orchestration;
pub mod retry;
pub mod sink;
pub mod stream;

pub use config::Config;
pub use datasource::{DataSourceError, FillHistorySource, HyperliquidDataSource, MockDataSource};
pub use db::{init_db, Repository};
pub use domain::{
    Address, Checkpoint, Coin, ConnectionState, Decimal, Direction, FillRecord, Fingerprint, Side,
    TimeMs,
};
pub use error::AppError;
pub use orchestration::{BulkFetcher, Reconciler, ReconcilerInput, ReconcilerStatus};
pub use retry::RetryPolicy;
pub use sink::{LogSink, MemorySink, NotificationSink, WebhookSink};
pub use stream::{HyperliquidStreamConnector, StreamListener};

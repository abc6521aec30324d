use super::{NotificationSink, SinkError};
use crate::domain::{FillRecord, Fingerprint};
use async_trait::async_trait;
use tracing::info;

/// Sink that reports each fill as a structured log line.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(
        &self,
        fill: &FillRecord,
        fingerprint: &Fingerprint,
    ) -> Result<(), SinkError> {
        info!(
            fingerprint = %fingerprint,
            symbol = %fill.symbol,
            side = %fill.side,
            direction = %fill.direction,
            size = %fill.size,
            price = %fill.price,
            fee = %fill.fee,
            fee_asset = %fill.fee_asset,
            realized_pnl = %fill.realized_pnl,
            time_ms = fill.time_ms.as_i64(),
            liquidation = fill.liquidation,
            "Fill"
        );
        Ok(())
    }
}

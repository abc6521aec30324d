//! FillRecord: the canonical representation of a single execution.

use crate::domain::{Coin, Decimal, Direction, Fingerprint, Side, TimeMs};
use serde::{Deserialize, Serialize};

/// A single trade fill/execution, independent of the transport it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    /// Instrument traded.
    pub symbol: Coin,
    /// Trade side.
    pub side: Side,
    /// Filled quantity.
    pub size: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Execution time; primary ordering key.
    pub time_ms: TimeMs,
    /// Position effect reported by the exchange.
    pub direction: Direction,
    /// PnL realized by this fill.
    pub realized_pnl: Decimal,
    /// Fee charged (negative for rebates).
    pub fee: Decimal,
    /// Asset the fee was charged in.
    pub fee_asset: String,
    pub order_id: i64,
    pub trade_id: i64,
    /// Transaction hash; informational only.
    pub tx_hash: String,
    /// True when the fill took liquidity.
    pub crossed_spread: bool,
    #[serde(default)]
    pub liquidation: bool,
    /// Builder fee, only present on fills routed through a builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_fee: Option<Decimal>,
    /// Signed position size before this fill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<Decimal>,
}

impl FillRecord {
    /// Derive the deduplication key for this fill.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

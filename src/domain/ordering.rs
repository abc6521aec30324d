//! Stable fill ordering for deterministic delivery.

use crate::domain::{FillRecord, Fingerprint};

/// Stable ordering key for fills.
///
/// Ordering: time_ms -> trade_id -> order_id -> fingerprint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FillOrderingKey {
    /// Time in milliseconds (primary sort).
    pub time_ms: i64,
    /// Trade ID (secondary sort).
    pub trade_id: i64,
    /// Order ID (tertiary sort).
    pub order_id: i64,
    /// Fingerprint (fallback sort).
    pub fingerprint: Fingerprint,
}

impl FillOrderingKey {
    /// Create an ordering key from a fill.
    pub fn from_fill(fill: &FillRecord) -> Self {
        FillOrderingKey {
            time_ms: fill.time_ms.as_i64(),
            trade_id: fill.trade_id,
            order_id: fill.order_id,
            fingerprint: fill.fingerprint(),
        }
    }
}

/// Sort fills oldest-first, deterministically.
pub fn sort_fills_deterministic(fills: &mut [FillRecord]) {
    fills.sort_by_cached_key(FillOrderingKey::from_fill);
}

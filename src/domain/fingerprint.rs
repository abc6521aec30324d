//! Stable deduplication key for fills.

use crate::domain::FillRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed-length (32 hex chars) identifier of a real trade.
///
/// Derived only from `(order_id, trade_id, time_ms, symbol, price, size)`, so the
/// same trade observed over the websocket and over the bulk endpoint yields the
/// same value even when optional fields like `builder_fee` differ.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Length of the hex token.
    pub const LEN: usize = 32;

    /// Compute the fingerprint of a fill.
    pub fn of(fill: &FillRecord) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(fill.order_id.to_le_bytes());
        hasher.update(fill.trade_id.to_le_bytes());
        hasher.update(fill.time_ms.as_i64().to_le_bytes());
        update_delimited(&mut hasher, fill.symbol.as_str());
        update_delimited(&mut hasher, &fill.price.to_canonical_string());
        update_delimited(&mut hasher, &fill.size.to_canonical_string());
        let hash = hasher.finalize();
        Fingerprint(hex::encode(&hash[..Self::LEN / 2]))
    }

    /// Rehydrate a fingerprint read back from storage.
    pub fn from_stored(token: String) -> Self {
        Fingerprint(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn update_delimited(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Coin, Decimal, Direction, Side, TimeMs};

    fn make_fill(time_ms: i64, tid: i64, px: &str, sz: &str) -> FillRecord {
        FillRecord {
            symbol: Coin::new("ETH".to_string()),
            side: Side::Sell,
            size: Decimal::from_str_canonical(sz).unwrap(),
            price: Decimal::from_str_canonical(px).unwrap(),
            time_ms: TimeMs::new(time_ms),
            direction: Direction::CloseLong,
            realized_pnl: Decimal::from_str_canonical("3.2").unwrap(),
            fee: Decimal::from_str_canonical("0.4").unwrap(),
            fee_asset: "USDC".to_string(),
            order_id: 900,
            trade_id: tid,
            tx_hash: "0x01".to_string(),
            crossed_spread: false,
            liquidation: false,
            builder_fee: None,
            start_position: None,
        }
    }

    #[test]
    fn test_fingerprint_fixed_length_and_deterministic() {
        let fill = make_fill(1000, 1, "3000", "1");
        let a = Fingerprint::of(&fill);
        let b = Fingerprint::of(&fill.clone());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), Fingerprint::LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_ignores_optional_and_informational_fields() {
        let ws = make_fill(1000, 1, "3000", "1");
        let mut rest = ws.clone();
        rest.builder_fee = Some(Decimal::from_str_canonical("0.01").unwrap());
        rest.start_position = Some(Decimal::from_str_canonical("-2").unwrap());
        rest.tx_hash = "0xffff".to_string();
        rest.fee = Decimal::from_str_canonical("0.41").unwrap();
        rest.liquidation = true;
        assert_eq!(ws.fingerprint(), rest.fingerprint());
    }

    #[test]
    fn test_fingerprint_normalizes_decimal_scale() {
        let a = make_fill(1000, 1, "3000.10", "1.500");
        let b = make_fill(1000, 1, "3000.1", "1.5");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_identity_fields() {
        let base = make_fill(1000, 1, "3000", "1");
        assert_ne!(base.fingerprint(), make_fill(1001, 1, "3000", "1").fingerprint());
        assert_ne!(base.fingerprint(), make_fill(1000, 2, "3000", "1").fingerprint());
        assert_ne!(base.fingerprint(), make_fill(1000, 1, "3001", "1").fingerprint());
        assert_ne!(base.fingerprint(), make_fill(1000, 1, "3000", "2").fingerprint());

        let mut other_symbol = base.clone();
        other_symbol.symbol = Coin::new("BTC".to_string());
        assert_ne!(base.fingerprint(), other_symbol.fingerprint());
    }

    #[test]
    fn test_fingerprint_fields_do_not_alias() {
        // "1" + "23" must not collide with "12" + "3".
        let mut a = make_fill(1000, 1, "1", "23");
        let mut b = make_fill(1000, 1, "12", "3");
        a.symbol = Coin::new("X".to_string());
        b.symbol = Coin::new("X".to_string());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}

//! Parsing of exchange fill objects into `FillRecord`.
//!
//! The REST history endpoint and the websocket `userFills` channel share the
//! same fill object shape, so both transports go through `parse_fill`.

use crate::domain::{Coin, Decimal, Direction, FillRecord, Side, TimeMs};
use serde_json::Value;
use thiserror::Error;

/// A fill object that could not be turned into a `FillRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FillParseError {
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

/// Parse one exchange fill object.
///
/// Identity fields (`coin`, `side`, `px`, `sz`, `time`, `oid`, `tid`) are
/// required. Everything else defaults when absent.
pub fn parse_fill(fill_json: &Value) -> Result<FillRecord, FillParseError> {
    let symbol = required_str(fill_json, "coin")?;

    let side_code = required_str(fill_json, "side")?;
    let side = Side::from_exchange_code(side_code).ok_or_else(|| FillParseError::Invalid {
        field: "side",
        value: side_code.to_string(),
    })?;

    let price = required_decimal(fill_json, "px")?;
    let size = required_decimal(fill_json, "sz")?;
    let time_ms = required_i64(fill_json, "time")?;
    let order_id = required_i64(fill_json, "oid")?;
    let trade_id = required_i64(fill_json, "tid")?;

    let direction = fill_json
        .get("dir")
        .and_then(|v| v.as_str())
        .map(Direction::from_exchange_label)
        .unwrap_or_else(|| Direction::Other(String::new()));

    Ok(FillRecord {
        symbol: Coin::new(symbol.to_string()),
        side,
        size,
        price,
        time_ms: TimeMs::new(time_ms),
        direction,
        realized_pnl: optional_decimal(fill_json, "closedPnl")?.unwrap_or_default(),
        fee: optional_decimal(fill_json, "fee")?.unwrap_or_default(),
        fee_asset: fill_json
            .get("feeToken")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        order_id,
        trade_id,
        tx_hash: fill_json
            .get("hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        crossed_spread: fill_json
            .get("crossed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        liquidation: fill_json
            .get("liquidation")
            .is_some_and(|v| !v.is_null()),
        builder_fee: optional_decimal(fill_json, "builderFee")?,
        start_position: optional_decimal(fill_json, "startPosition")?,
    })
}

fn required_str<'a>(v: &'a Value, field: &'static str) -> Result<&'a str, FillParseError> {
    v.get(field)
        .and_then(|x| x.as_str())
        .ok_or(FillParseError::Missing(field))
}

fn required_i64(v: &Value, field: &'static str) -> Result<i64, FillParseError> {
    let raw = v.get(field).ok_or(FillParseError::Missing(field))?;
    raw.as_i64()
        .or_else(|| raw.as_u64().and_then(|n| i64::try_from(n).ok()))
        .ok_or_else(|| FillParseError::Invalid {
            field,
            value: raw.to_string(),
        })
}

fn required_decimal(v: &Value, field: &'static str) -> Result<Decimal, FillParseError> {
    optional_decimal(v, field)?.ok_or(FillParseError::Missing(field))
}

/// Decimals arrive as strings; a bare JSON number is accepted through its
/// textual form so it never passes through `f64`.
fn optional_decimal(v: &Value, field: &'static str) -> Result<Option<Decimal>, FillParseError> {
    let text = match v.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(FillParseError::Invalid {
                field,
                value: other.to_string(),
            })
        }
    };
    Decimal::from_str_canonical(&text)
        .map(Some)
        .map_err(|_| FillParseError::Invalid { field, value: text })
}

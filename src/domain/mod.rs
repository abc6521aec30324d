//! Domain types for the fill relay.
//!
//! This module provides:
//! - Lossless numeric handling via Decimal wrapper
//! - Domain primitives: TimeMs, Address, Coin, Side, Direction
//! - FillRecord and its Fingerprint
//! - Stable fill ordering key for deterministic delivery
//! - Checkpoint and ConnectionState

pub mod checkpoint;
pub mod connection;
pub mod decimal;
pub mod fill;
pub mod fingerprint;
pub mod ordering;
pub mod primitives;

pub use checkpoint::{
    BoundedFingerprintSet, Checkpoint, CheckpointAdvance, DEFAULT_FINGERPRINT_CAPACITY,
};
pub use connection::{ConnectionState, IllegalTransition};
pub use decimal::Decimal;
pub use fill::FillRecord;
pub use fingerprint::Fingerprint;
pub use ordering::{sort_fills_deterministic, FillOrderingKey};
pub use primitives::{Address, Coin, Direction, Side, TimeMs};

//! Database module for SQLite operations.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - Repository layer for checkpoint persistence
//! - The `CheckpointStore` seam and an in-memory implementation

pub mod migrations;
pub mod repo;
pub mod store;

pub use migrations::init_db;
pub use repo::Repository;
pub use store::{
    CheckpointPersistError, CheckpointStore, MemoryCheckpointStore, PendingDelivery,
    StoredCheckpoint,
};

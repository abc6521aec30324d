//! Pipeline coordination: recovery fetching and the reconciler actor.

pub mod fetcher;
pub mod reconciler;

pub use fetcher::{BulkFetcher, FetchError, RecoveryScan, RecoverySet};
pub use reconciler::{
    PauseReason, ReconcileError, Reconciler, ReconcilerConfig, ReconcilerInput,
    ReconcilerStatus, RecoveryOutcome, RecoveryTrigger,
};

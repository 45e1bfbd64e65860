//! Error types for the ledger.

use crate::checkpoint::CheckpointId;
use crate::fact::OrganizationId;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while ingesting facts or advancing checkpoints.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A fact in an ingestion batch failed validation; nothing was written.
    #[error("invalid fact at batch index {index}: {message}")]
    Validation { index: usize, message: String },

    /// A CSV row could not be turned into a fact or checkpoint.
    #[error("invalid record at row {row}: {message}")]
    InvalidRecord { row: usize, message: String },

    /// Transient storage failure; the whole call may be retried.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Another writer advanced the organization's checkpoint first.
    #[error(
        "checkpoint for organization {organization_id} moved from {expected:?} to {found:?}"
    )]
    ConcurrentUpdateConflict {
        organization_id: OrganizationId,
        expected: Option<CheckpointId>,
        found: Option<CheckpointId>,
    },

    /// The latest checkpoint already covers the requested cutoff.
    #[error("organization {organization_id} is checkpointed at {latest}, not before cutoff {cutoff}")]
    StaleCutoff {
        organization_id: OrganizationId,
        latest: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    },

    /// The requested cutoff is later than the current time.
    #[error("cutoff {cutoff} is in the future (now {now})")]
    FutureCutoff {
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// The call's deadline passed before this organization was committed.
    #[error("recompute timed out before organization {organization_id} was committed")]
    TimedOut { organization_id: OrganizationId },

    /// Balance or token arithmetic left the representable range.
    #[error("arithmetic overflow while aggregating organization {organization_id}")]
    Overflow { organization_id: OrganizationId },

    /// Failed to open, read or write a file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing error
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    /// Returns `true` for errors where repeating the identical call can
    /// succeed.
    ///
    /// `StaleCutoff` is not among them: the same cutoff stays stale, and only
    /// a call with a fresh cutoff gets past it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StorageUnavailable(_)
                | EngineError::ConcurrentUpdateConflict { .. }
                | EngineError::TimedOut { .. }
        )
    }
}

//! Inactive user cleanup.
//!
//! A run takes the named lock, selects candidates (deactivated users and
//! users inactive past the threshold), deletes them in bounded chunks and
//! writes one audit report. Runs come from the scheduler (retried as a
//! whole on failure) or on demand (validated, never retried).
//!
//! Deletions are not rolled back when the report write fails afterwards;
//! such runs are logged with the committed count for reconciliation.

mod deleter;
mod job;
mod lock;
mod params;
mod report;
mod retry;
mod scheduler;
mod selector;

use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

pub use deleter::{ChunkFailure, ChunkedDeleter, ChunkedDeletion};
pub use job::{CleanupJob, DryRunSummary, RunOutcome, RunSummary, RunTrigger};
pub use lock::{
    LockAcquisition, LockBackend, LockError, LockManager, MemoryLockBackend, SqliteLockBackend,
};
pub use params::{RunParameters, RunRequest, ValidationError};
pub use report::ReportRecorder;
pub use retry::{retry_with, RetryPolicy};
pub use scheduler::run_scheduler;
pub use selector::{CandidateSelector, DRY_RUN_SAMPLE_LIMIT};

/// Process-wide defaults the job is constructed with.
#[derive(Debug, Clone)]
pub struct CleanupSettings {
    /// Days without activity before a user becomes a candidate.
    pub threshold_days: u32,
    /// Most IDs deleted per transaction.
    pub chunk_size: NonZeroUsize,
    pub lock_key: String,
    pub lock_ttl: Duration,
    /// Bound on each lock backend call.
    pub lock_timeout: Duration,
    /// Retry policy of the scheduled entry point.
    pub retry: RetryPolicy,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            threshold_days: 30,
            chunk_size: NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
            lock_key: "cleanup_inactive_lock_v1".to_string(),
            lock_ttl: Duration::from_secs(60 * 60),
            lock_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// The step of a run that hit the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SelectingCandidates,
    DeletingChunk(usize),
    CountingActiveUsers,
    RecordingReport,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectingCandidates => f.write_str("selecting candidates"),
            Self::DeletingChunk(index) => write!(f, "deleting chunk {index}"),
            Self::CountingActiveUsers => f.write_str("counting active users"),
            Self::RecordingReport => f.write_str("recording report"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage failure while {stage} ({committed} deletions already committed): {error:#}")]
    Storage {
        stage: Stage,
        /// Rows deleted and committed before the failure.
        committed: u64,
        error: anyhow::Error,
    },
    #[error("cleanup run was cancelled before it finished")]
    Cancelled,
}

impl CleanupError {
    pub(crate) fn storage(stage: Stage, committed: u64, error: anyhow::Error) -> Self {
        Self::Storage {
            stage,
            committed,
            error,
        }
    }
}

impl From<ChunkFailure> for CleanupError {
    fn from(failure: ChunkFailure) -> Self {
        Self::storage(
            Stage::DeletingChunk(failure.chunk),
            failure.committed,
            failure.error,
        )
    }
}

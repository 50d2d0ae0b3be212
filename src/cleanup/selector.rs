//! Candidate selection.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::{self, CandidateSample, CandidateSnapshot};

/// Most candidates a dry run reports back.
pub const DRY_RUN_SAMPLE_LIMIT: i64 = 100;

/// Read-only view of the users eligible for deletion at a fixed cutoff:
/// deactivated, or last active before the cutoff. Every projection is
/// ordered by ascending ID.
#[derive(Debug, Clone, Copy)]
pub struct CandidateSelector<'a> {
    pool: &'a SqlitePool,
    cutoff: DateTime<Utc>,
}

impl<'a> CandidateSelector<'a> {
    #[must_use]
    pub const fn new(pool: &'a SqlitePool, cutoff: DateTime<Utc>) -> Self {
        Self { pool, cutoff }
    }

    /// Number of candidates.
    pub async fn count(&self) -> Result<i64> {
        db::count_cleanup_candidates(self.pool, self.cutoff).await
    }

    /// Up to `limit` candidates, identity and email only.
    pub async fn sample(&self, limit: i64) -> Result<Vec<CandidateSample>> {
        db::get_cleanup_candidate_sample(self.pool, self.cutoff, limit.max(0)).await
    }

    /// All candidate IDs.
    pub async fn ids(&self) -> Result<Vec<i64>> {
        db::get_cleanup_candidate_ids(self.pool, self.cutoff).await
    }

    /// All candidates with identity, email and last activity.
    pub async fn snapshots(&self) -> Result<Vec<CandidateSnapshot>> {
        db::get_cleanup_candidate_snapshots(self.pool, self.cutoff).await
    }
}

//! Audit reports for cleanup runs.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::{self, CleanupReport};

/// Writes and reads [`CleanupReport`] rows. Reports are never updated.
#[derive(Debug, Clone, Copy)]
pub struct ReportRecorder<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ReportRecorder<'a> {
    #[must_use]
    pub const fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert one report, stamped with the current time.
    pub async fn record(&self, users_deleted: u64, active_remaining: i64) -> Result<CleanupReport> {
        let users_deleted =
            i64::try_from(users_deleted).context("Deleted count does not fit in a report")?;
        db::insert_cleanup_report(self.pool, Utc::now(), users_deleted, active_remaining).await
    }

    /// The most recently created report, if any.
    pub async fn latest(&self) -> Result<Option<CleanupReport>> {
        db::get_latest_cleanup_report(self.pool).await
    }
}

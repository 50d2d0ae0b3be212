use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{
    retry_with, CandidateSelector, ChunkedDeleter, CleanupError, CleanupSettings, LockAcquisition,
    LockBackend, LockManager, ReportRecorder, RunParameters, RunRequest, Stage,
    DRY_RUN_SAMPLE_LIMIT,
};
use crate::db::{self, CandidateSample, CandidateSnapshot, CleanupReport, Database};

/// Which entry point started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    /// Timer-driven; retried on failure, no caller to report to.
    Scheduled,
    /// Requested by a caller that wants the deleted users back.
    OnDemand,
}

/// Result of a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunSummary {
    pub candidates: i64,
    pub sample: Vec<CandidateSample>,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub report: CleanupReport,
    pub deleted: u64,
    pub active_remaining: i64,
    pub chunks: usize,
    /// Candidates as they were before deletion. Empty for scheduled runs.
    pub deleted_users: Vec<CandidateSnapshot>,
}

/// How a run ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run holds the lock; nothing was done.
    Locked,
    DryRun(DryRunSummary),
    Completed(RunSummary),
}

/// The cleanup orchestrator.
#[derive(Debug, Clone)]
pub struct CleanupJob {
    db: Database,
    lock: LockManager,
    settings: CleanupSettings,
}

impl CleanupJob {
    #[must_use]
    pub fn new(db: Database, lock_backend: Arc<dyn LockBackend>, settings: CleanupSettings) -> Self {
        let lock = LockManager::new(
            lock_backend,
            settings.lock_key.clone(),
            settings.lock_ttl,
            settings.lock_timeout,
        );
        Self { db, lock, settings }
    }

    #[must_use]
    pub const fn settings(&self) -> &CleanupSettings {
        &self.settings
    }

    #[must_use]
    pub const fn lock(&self) -> &LockManager {
        &self.lock
    }

    /// Run with the configured defaults, retrying failed runs per the retry
    /// policy with real sleeps.
    ///
    /// # Errors
    ///
    /// Returns the last storage error once retries are exhausted.
    pub async fn run_scheduled(&self) -> Result<RunOutcome, CleanupError> {
        self.run_scheduled_with(tokio::time::sleep).await
    }

    /// [`Self::run_scheduled`] with an injected delay between attempts.
    ///
    /// # Errors
    ///
    /// Returns the last storage error once retries are exhausted.
    pub async fn run_scheduled_with<S, F>(&self, sleep: S) -> Result<RunOutcome, CleanupError>
    where
        S: FnMut(Duration) -> F,
        F: Future<Output = ()>,
    {
        let params = RunParameters::scheduled(&self.settings);
        retry_with(
            &self.settings.retry,
            || self.run(params, RunTrigger::Scheduled),
            sleep,
        )
        .await
    }

    /// Validate caller overrides and run once.
    ///
    /// Invalid parameters are rejected before the lock or the store is
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Validation`] for bad parameters and
    /// [`CleanupError::Storage`] if the run fails, and
    /// [`CleanupError::Cancelled`] if the runtime shuts down mid-run.
    pub async fn run_on_demand(&self, request: &RunRequest) -> Result<RunOutcome, CleanupError> {
        let params = RunParameters::from_request(request, &self.settings)?;

        // The run lives on its own task so a caller that goes away (e.g. a
        // disconnected HTTP client) does not stop it between chunks.
        let job = self.clone();
        let handle = tokio::spawn(async move { job.run(params, RunTrigger::OnDemand).await });
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(CleanupError::Cancelled),
        }
    }

    /// Run once under the lock.
    ///
    /// The lock is released on every exit path of the run body, including
    /// errors and panics. If this future is dropped mid-run, the release is
    /// spawned onto the runtime instead. A refused lock returns
    /// [`RunOutcome::Locked`] without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError::Storage`] if selection, deletion or the
    /// report write fails.
    pub async fn run(
        &self,
        params: RunParameters,
        trigger: RunTrigger,
    ) -> Result<RunOutcome, CleanupError> {
        let acquisition = self.lock.acquire().await;
        if !acquisition.may_run() {
            warn!(key = %self.lock.key(), ?trigger, "Another cleanup run is in progress; skipping");
            return Ok(RunOutcome::Locked);
        }

        let mut guard = ReleaseOnDrop::new(&self.lock);
        let body = AssertUnwindSafe(self.run_locked(params, trigger, acquisition));
        let result = body.catch_unwind().await;
        self.lock.release().await;
        guard.disarm();

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                error!(?trigger, "Cleanup run failed: {e}");
                Err(e)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_locked(
        &self,
        params: RunParameters,
        trigger: RunTrigger,
        acquisition: LockAcquisition,
    ) -> Result<RunOutcome, CleanupError> {
        let pool = self.db.pool();
        let selector = CandidateSelector::new(pool, params.cutoff(Utc::now()));
        let select_err = |e: anyhow::Error| CleanupError::storage(Stage::SelectingCandidates, 0, e);

        let candidates = selector.count().await.map_err(select_err)?;
        info!(
            candidates,
            threshold_days = params.threshold_days,
            dry_run = params.dry_run,
            unguarded = acquisition == LockAcquisition::Unguarded,
            "Found cleanup candidates"
        );

        if params.dry_run {
            let sample = selector
                .sample(DRY_RUN_SAMPLE_LIMIT)
                .await
                .map_err(select_err)?;
            return Ok(RunOutcome::DryRun(DryRunSummary { candidates, sample }));
        }

        let (ids, deleted_users) = if candidates == 0 {
            (Vec::new(), Vec::new())
        } else {
            match trigger {
                RunTrigger::Scheduled => (selector.ids().await.map_err(select_err)?, Vec::new()),
                RunTrigger::OnDemand => {
                    let snapshots = selector.snapshots().await.map_err(select_err)?;
                    (snapshots.iter().map(|u| u.id).collect(), snapshots)
                }
            }
        };

        let deletion = ChunkedDeleter::new(pool, params.chunk_size)
            .delete_in_chunks(&ids)
            .await
            .map_err(|failure| {
                error!(
                    chunk = failure.chunk,
                    committed = failure.committed,
                    "Chunk delete failed; earlier chunks stay committed"
                );
                CleanupError::from(failure)
            })?;

        let committed_err = |stage: Stage| {
            move |e: anyhow::Error| {
                if deletion.deleted > 0 {
                    error!(
                        deleted = deletion.deleted,
                        "Deletions committed but no report was written; reconcile from logs"
                    );
                }
                CleanupError::storage(stage, deletion.deleted, e)
            }
        };

        let active_remaining = db::count_active_users(pool)
            .await
            .map_err(committed_err(Stage::CountingActiveUsers))?;

        let report = ReportRecorder::new(pool)
            .record(deletion.deleted, active_remaining)
            .await
            .map_err(committed_err(Stage::RecordingReport))?;

        info!(
            deleted = deletion.deleted,
            chunks = deletion.chunks,
            active_remaining,
            report_id = report.id,
            "Cleanup completed"
        );

        Ok(RunOutcome::Completed(RunSummary {
            report,
            deleted: deletion.deleted,
            active_remaining,
            chunks: deletion.chunks,
            deleted_users,
        }))
    }
}

/// Releases the run lock from a spawned task if dropped while still armed.
struct ReleaseOnDrop<'a> {
    lock: &'a LockManager,
    armed: bool,
}

impl<'a> ReleaseOnDrop<'a> {
    const fn new(lock: &'a LockManager) -> Self {
        Self { lock, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            key = %self.lock.key(),
            "Cleanup run dropped before finishing; releasing lock in the background"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let lock = self.lock.clone();
                handle.spawn(async move { lock.release().await });
            }
            Err(_) => error!(
                key = %self.lock.key(),
                "No runtime to release cleanup lock; it expires after its TTL"
            ),
        }
    }
}

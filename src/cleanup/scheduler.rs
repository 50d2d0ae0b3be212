use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{CleanupJob, RunOutcome};

/// Run a single scheduled cleanup (with retries) and log the result.
async fn cleanup_once(job: &CleanupJob) {
    match job.run_scheduled().await {
        Ok(RunOutcome::Completed(summary)) => {
            if summary.deleted > 0 {
                tracing::info!(
                    deleted = summary.deleted,
                    active_remaining = summary.active_remaining,
                    report_id = summary.report.id,
                    "Scheduled cleanup removed inactive users"
                );
            }
        }
        Ok(RunOutcome::Locked) => {
            tracing::info!("Scheduled cleanup skipped; another run holds the lock");
        }
        Ok(RunOutcome::DryRun(_)) => {}
        Err(e) => {
            tracing::error!("Scheduled cleanup gave up: {e}");
        }
    }
}

/// Run the cleanup scheduler.
///
/// Runs immediately on start, then once per `interval`. Ticks that fall due
/// while a run (including its retry delays) is still going are skipped.
/// Shutdown is checked between runs; a run in progress is never cut short.
pub async fn run_scheduler(job: Arc<CleanupJob>, interval: Duration, shutdown: CancellationToken) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        threshold_days = job.settings().threshold_days,
        chunk_size = job.settings().chunk_size.get(),
        max_retries = job.settings().retry.max_retries,
        "Starting cleanup scheduler"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!("Cleanup scheduler shutting down");
                break;
            }
            _ = ticker.tick() => {
                cleanup_once(&job).await;
            }
        }
    }
}

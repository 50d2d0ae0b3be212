//! Integration tests for the cleanup job against a real SQLite database.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use inactive_user_cleanup::cleanup::{
    CleanupError, CleanupJob, CleanupSettings, LockAcquisition, LockBackend, LockError,
    MemoryLockBackend, RetryPolicy, RunOutcome, RunParameters, RunRequest, RunTrigger,
    SqliteLockBackend, Stage, ValidationError,
};
use inactive_user_cleanup::db::{
    count_active_users, count_cleanup_reports, count_users, get_latest_cleanup_report, get_user,
    insert_user, Database, NewUser,
};
use tempfile::TempDir;
use tokio::sync::Notify;

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

fn settings(chunk_size: usize) -> CleanupSettings {
    CleanupSettings {
        chunk_size: NonZeroUsize::new(chunk_size).unwrap(),
        lock_key: "test_cleanup_lock".to_string(),
        lock_timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            max_retries: 3,
            delay: Duration::from_secs(60),
        },
        ..CleanupSettings::default()
    }
}

fn memory_job(db: &Database, chunk_size: usize) -> CleanupJob {
    CleanupJob::new(
        db.clone(),
        Arc::new(MemoryLockBackend::new()),
        settings(chunk_size),
    )
}

async fn add_user(db: &Database, email: &str, days_ago: Option<i64>, is_active: bool) -> i64 {
    insert_user(
        db.pool(),
        &NewUser {
            email: email.to_string(),
            last_activity_at: days_ago.map(|d| Utc::now() - chrono::Duration::days(d)),
            is_active,
        },
    )
    .await
    .expect("Failed to insert user")
}

/// Insert `n` deactivated users; they are candidates at any threshold.
async fn add_inactive_users(db: &Database, n: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        ids.push(add_user(db, &format!("inactive{i}@example.com"), Some(1), false).await);
    }
    ids
}

fn completed(outcome: RunOutcome) -> inactive_user_cleanup::cleanup::RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

fn on_demand(chunk_size: &str) -> RunRequest {
    RunRequest {
        days: Some("30".to_string()),
        chunk_size: Some(chunk_size.to_string()),
        dry_run: None,
    }
}

async fn lock_is_free(job: &CleanupJob) -> bool {
    let free = job.lock().acquire().await == LockAcquisition::Acquired;
    if free {
        job.lock().release().await;
    }
    free
}

#[tokio::test]
async fn test_example_scenario_deletes_three_in_two_chunks() {
    let (db, _temp_dir) = setup_db().await;
    let inactive_a = add_user(&db, "a@example.com", Some(1), false).await;
    let inactive_b = add_user(&db, "b@example.com", None, false).await;
    let stale = add_user(&db, "stale@example.com", Some(40), true).await;
    let recent = add_user(&db, "recent@example.com", Some(2), true).await;
    let never_seen = add_user(&db, "new@example.com", None, true).await;

    let job = memory_job(&db, 2);
    let summary = completed(job.run_on_demand(&on_demand("2")).await.unwrap());

    assert_eq!(summary.deleted, 3);
    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.active_remaining, 2);
    assert_eq!(summary.report.users_deleted, 3);
    assert_eq!(summary.report.active_users_remaining, 2);

    let deleted_ids: Vec<i64> = summary.deleted_users.iter().map(|u| u.id).collect();
    assert_eq!(deleted_ids, vec![inactive_a, inactive_b, stale]);
    assert_eq!(summary.deleted_users[0].email, "a@example.com");
    assert!(summary.deleted_users[1].last_activity_at.is_none());

    for id in [inactive_a, inactive_b, stale] {
        assert!(get_user(db.pool(), id).await.unwrap().is_none());
    }
    for id in [recent, never_seen] {
        assert!(get_user(db.pool(), id).await.unwrap().is_some());
    }

    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 1);
    assert!(lock_is_free(&job).await);
}

#[tokio::test]
async fn test_deleted_count_matches_rows_for_uneven_chunks() {
    for candidates in [0_usize, 1, 3, 4, 7, 1000] {
        let (db, _temp_dir) = setup_db().await;
        add_inactive_users(&db, candidates).await;
        add_user(&db, "keeper@example.com", Some(1), true).await;

        let job = memory_job(&db, 3);
        let params = RunParameters::new(30, 3, false).unwrap();
        let summary = completed(job.run(params, RunTrigger::Scheduled).await.unwrap());

        assert_eq!(summary.deleted, candidates as u64, "candidates={candidates}");
        assert_eq!(summary.chunks, candidates.div_ceil(3), "candidates={candidates}");
        assert_eq!(count_users(db.pool()).await.unwrap(), 1);
        assert!(summary.deleted_users.is_empty());
    }
}

#[tokio::test]
async fn test_zero_candidates_still_records_report() {
    let (db, _temp_dir) = setup_db().await;
    add_user(&db, "active@example.com", Some(3), true).await;
    add_user(&db, "fresh@example.com", None, true).await;

    let job = memory_job(&db, 1000);
    let summary = completed(job.run_on_demand(&RunRequest::default()).await.unwrap());

    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.chunks, 0);
    assert_eq!(summary.active_remaining, 2);
    assert!(summary.deleted_users.is_empty());

    let report = get_latest_cleanup_report(db.pool()).await.unwrap().unwrap();
    assert_eq!(report.users_deleted, 0);
    assert_eq!(report.active_users_remaining, 2);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_dry_run_caps_sample_and_mutates_nothing() {
    let (db, _temp_dir) = setup_db().await;
    let ids = add_inactive_users(&db, 150).await;

    let job = memory_job(&db, 1000);
    let request = RunRequest {
        dry_run: Some("true".to_string()),
        ..RunRequest::default()
    };
    let outcome = job.run_on_demand(&request).await.unwrap();

    let RunOutcome::DryRun(summary) = outcome else {
        panic!("expected dry run");
    };
    assert_eq!(summary.candidates, 150);
    assert_eq!(summary.sample.len(), 100);
    let sampled: Vec<i64> = summary.sample.iter().map(|s| s.id).collect();
    assert_eq!(sampled, ids[..100].to_vec());

    assert_eq!(count_users(db.pool()).await.unwrap(), 150);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);
    assert!(lock_is_free(&job).await);
}

#[tokio::test]
async fn test_dry_run_sample_is_whole_set_when_small() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 7).await;

    let job = memory_job(&db, 1000);
    let params = RunParameters::new(30, 1000, true).unwrap();
    let RunOutcome::DryRun(summary) = job.run(params, RunTrigger::OnDemand).await.unwrap() else {
        panic!("expected dry run");
    };
    assert_eq!(summary.candidates, 7);
    assert_eq!(summary.sample.len(), 7);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dry_run_with_no_candidates_records_nothing() {
    let (db, _temp_dir) = setup_db().await;
    add_user(&db, "active@example.com", Some(1), true).await;

    let job = memory_job(&db, 1000);
    let params = RunParameters::new(30, 1000, true).unwrap();
    let outcome = job.run(params, RunTrigger::OnDemand).await.unwrap();

    let RunOutcome::DryRun(summary) = outcome else {
        panic!("expected dry run");
    };
    assert_eq!(summary.candidates, 0);
    assert!(summary.sample.is_empty());
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_held_lock_returns_locked_without_side_effects() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 5).await;

    let job = memory_job(&db, 2);
    assert_eq!(job.lock().acquire().await, LockAcquisition::Acquired);

    let outcome = job.run_on_demand(&RunRequest::default()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Locked);
    assert_eq!(count_users(db.pool()).await.unwrap(), 5);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);

    // The refused run must not have released the holder's lock.
    assert_eq!(job.lock().acquire().await, LockAcquisition::Held);

    job.lock().release().await;
    let summary = completed(job.run_on_demand(&RunRequest::default()).await.unwrap());
    assert_eq!(summary.deleted, 5);
}

#[tokio::test]
async fn test_sqlite_lock_shared_between_jobs() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 3).await;

    // Two jobs with separate backends over the same database, as two
    // processes would have.
    let first = CleanupJob::new(
        db.clone(),
        Arc::new(SqliteLockBackend::new(db.pool().clone())),
        settings(10),
    );
    let second = CleanupJob::new(
        db.clone(),
        Arc::new(SqliteLockBackend::new(db.pool().clone())),
        settings(10),
    );

    assert_eq!(first.lock().acquire().await, LockAcquisition::Acquired);
    assert_eq!(
        second.run_on_demand(&RunRequest::default()).await.unwrap(),
        RunOutcome::Locked
    );
    first.lock().release().await;

    let summary = completed(second.run_on_demand(&RunRequest::default()).await.unwrap());
    assert_eq!(summary.deleted, 3);
    assert!(lock_is_free(&first).await);
}

/// Memory lock that signals every successful acquisition.
#[derive(Default)]
struct SignallingLockBackend {
    inner: MemoryLockBackend,
    acquired: Notify,
}

#[async_trait]
impl LockBackend for SignallingLockBackend {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let taken = self.inner.try_acquire(key, ttl).await?;
        if taken {
            self.acquired.notify_one();
        }
        Ok(taken)
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.inner.release(key).await
    }
}

/// Open a write transaction on its own connection so that deletes wait on
/// the busy timeout until it is rolled back.
async fn hold_write_lock(db: &Database) -> sqlx::Transaction<'static, sqlx::Sqlite> {
    let mut tx = db.pool().begin().await.unwrap();
    sqlx::query("INSERT INTO cleanup_locks (key, expires_at) VALUES ('writer', 0)")
        .execute(&mut *tx)
        .await
        .unwrap();
    tx
}

async fn wait_for_free_lock(job: &CleanupJob) {
    for _ in 0..200 {
        if lock_is_free(job).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("cleanup lock was never released");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_run_is_locked_out() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 200).await;
    add_user(&db, "keeper@example.com", Some(1), true).await;

    let backend = Arc::new(SignallingLockBackend::default());
    let first = Arc::new(CleanupJob::new(db.clone(), backend.clone(), settings(7)));
    let second = CleanupJob::new(db.clone(), backend.clone(), settings(7));

    let writer = hold_write_lock(&db).await;
    let pending = tokio::spawn({
        let job = Arc::clone(&first);
        async move { job.run_on_demand(&RunRequest::default()).await }
    });
    backend.acquired.notified().await;

    // The first run holds the lock and is stuck on its first chunk.
    assert_eq!(
        second.run_on_demand(&RunRequest::default()).await.unwrap(),
        RunOutcome::Locked
    );
    assert_eq!(count_users(db.pool()).await.unwrap(), 201);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);

    writer.rollback().await.unwrap();
    let summary = completed(pending.await.unwrap().unwrap());
    assert_eq!(summary.deleted, 200);
    assert_eq!(count_users(db.pool()).await.unwrap(), 1);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 1);
    assert!(lock_is_free(&first).await);
}

#[tokio::test]
async fn test_abandoned_on_demand_run_finishes_and_releases_lock() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 5).await;
    let job = memory_job(&db, 2);

    let writer = hold_write_lock(&db).await;
    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        job.run_on_demand(&RunRequest::default()),
    )
    .await;
    assert!(abandoned.is_err());

    writer.rollback().await.unwrap();
    wait_for_free_lock(&job).await;

    assert_eq!(count_users(db.pool()).await.unwrap(), 0);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_dropped_run_releases_lock() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 5).await;
    let job = memory_job(&db, 2);
    let params = RunParameters::new(30, 2, false).unwrap();

    let writer = hold_write_lock(&db).await;
    let dropped = tokio::time::timeout(
        Duration::from_millis(500),
        job.run(params, RunTrigger::OnDemand),
    )
    .await;
    assert!(dropped.is_err());

    writer.rollback().await.unwrap();
    wait_for_free_lock(&job).await;
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_parameters_touch_nothing() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 2).await;

    let job = memory_job(&db, 1000);

    // With the users table gone, any query would fail with a storage error;
    // validation must reject first.
    sqlx::query("DROP TABLE app_users")
        .execute(db.pool())
        .await
        .unwrap();

    let bad_days = RunRequest {
        days: Some("-1".to_string()),
        ..RunRequest::default()
    };
    let err = job.run_on_demand(&bad_days).await.unwrap_err();
    assert!(matches!(err, CleanupError::Validation(ValidationError::Days)));

    let bad_chunk = RunRequest {
        chunk_size: Some("0".to_string()),
        ..RunRequest::default()
    };
    let err = job.run_on_demand(&bad_chunk).await.unwrap_err();
    assert!(matches!(
        err,
        CleanupError::Validation(ValidationError::ChunkSize)
    ));

    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);
    assert!(lock_is_free(&job).await);
}

#[tokio::test]
async fn test_lock_released_when_selection_fails() {
    let (db, _temp_dir) = setup_db().await;
    let job = memory_job(&db, 1000);

    sqlx::query("DROP TABLE app_users")
        .execute(db.pool())
        .await
        .unwrap();

    let err = job.run_on_demand(&RunRequest::default()).await.unwrap_err();
    assert!(matches!(
        err,
        CleanupError::Storage {
            stage: Stage::SelectingCandidates,
            committed: 0,
            ..
        }
    ));
    assert!(lock_is_free(&job).await);
}

#[tokio::test]
async fn test_chunk_failure_keeps_earlier_chunks_and_releases_lock() {
    let (db, _temp_dir) = setup_db().await;
    let ids = add_inactive_users(&db, 6).await;
    sqlx::query(
        r"
        CREATE TRIGGER fail_delete BEFORE DELETE ON app_users
        WHEN OLD.email = 'inactive4@example.com'
        BEGIN SELECT RAISE(ABORT, 'injected delete failure'); END
        ",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let job = memory_job(&db, 2);
    let err = job.run_on_demand(&on_demand("2")).await.unwrap_err();
    assert!(
        matches!(
            err,
            CleanupError::Storage {
                stage: Stage::DeletingChunk(2),
                committed: 4,
                ..
            }
        ),
        "{err}"
    );

    // Chunks 0 and 1 committed; chunk 2 rolled back.
    for id in &ids[..4] {
        assert!(get_user(db.pool(), *id).await.unwrap().is_none());
    }
    for id in &ids[4..] {
        assert!(get_user(db.pool(), *id).await.unwrap().is_some());
    }
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);
    assert!(lock_is_free(&job).await);
}

#[tokio::test]
async fn test_report_failure_keeps_deletions_and_releases_lock() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 3).await;
    add_user(&db, "keeper@example.com", Some(1), true).await;
    sqlx::query(
        r"
        CREATE TRIGGER fail_report BEFORE INSERT ON cleanup_reports
        BEGIN SELECT RAISE(ABORT, 'injected report failure'); END
        ",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let job = memory_job(&db, 1000);
    let err = job.run_on_demand(&RunRequest::default()).await.unwrap_err();
    assert!(matches!(
        err,
        CleanupError::Storage {
            stage: Stage::RecordingReport,
            committed: 3,
            ..
        }
    ));

    assert_eq!(count_users(db.pool()).await.unwrap(), 1);
    assert_eq!(count_active_users(db.pool()).await.unwrap(), 1);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 0);
    assert!(lock_is_free(&job).await);
}

struct UnreachableBackend;

#[async_trait]
impl LockBackend for UnreachableBackend {
    async fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> {
        Err(LockError::Unavailable("cache unreachable".to_string()))
    }

    async fn release(&self, _key: &str) -> Result<(), LockError> {
        Err(LockError::Unavailable("cache unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_unreachable_lock_backend_runs_unguarded() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 4).await;

    let job = CleanupJob::new(db.clone(), Arc::new(UnreachableBackend), settings(3));
    let summary = completed(job.run_on_demand(&RunRequest::default()).await.unwrap());

    assert_eq!(summary.deleted, 4);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_scheduled_run_retries_until_report_succeeds() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 3).await;
    sqlx::query(
        r"
        CREATE TRIGGER fail_report BEFORE INSERT ON cleanup_reports
        BEGIN SELECT RAISE(ABORT, 'injected report failure'); END
        ",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let job = memory_job(&db, 2);
    let sleeps = Arc::new(AtomicUsize::new(0));

    // The outage clears while the job waits to retry.
    let outcome = job
        .run_scheduled_with(|delay| {
            assert_eq!(delay, Duration::from_secs(60));
            sleeps.fetch_add(1, Ordering::SeqCst);
            let pool = db.pool().clone();
            async move {
                sqlx::query("DROP TRIGGER IF EXISTS fail_report")
                    .execute(&pool)
                    .await
                    .unwrap();
            }
        })
        .await
        .unwrap();

    // The first attempt committed the deletions; the retry finds nothing
    // left and records the run.
    let summary = completed(outcome);
    assert_eq!(summary.deleted, 0);
    assert_eq!(sleeps.load(Ordering::SeqCst), 1);
    assert_eq!(count_users(db.pool()).await.unwrap(), 0);
    assert_eq!(count_cleanup_reports(db.pool()).await.unwrap(), 1);
    assert!(lock_is_free(&job).await);
}

#[tokio::test]
async fn test_scheduled_run_gives_up_after_retries() {
    let (db, _temp_dir) = setup_db().await;
    let job = memory_job(&db, 2);

    sqlx::query("DROP TABLE app_users")
        .execute(db.pool())
        .await
        .unwrap();

    let sleeps = Arc::new(AtomicUsize::new(0));
    let err = job
        .run_scheduled_with(|_| {
            sleeps.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CleanupError::Storage { .. }));
    assert_eq!(sleeps.load(Ordering::SeqCst), 3);
    assert!(lock_is_free(&job).await);
}

#[tokio::test]
async fn test_scheduled_run_does_not_retry_when_locked() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 2).await;

    let job = memory_job(&db, 2);
    assert_eq!(job.lock().acquire().await, LockAcquisition::Acquired);

    let sleeps = Arc::new(AtomicUsize::new(0));
    let outcome = job
        .run_scheduled_with(|_| {
            sleeps.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Locked);
    assert_eq!(sleeps.load(Ordering::SeqCst), 0);
    assert_eq!(count_users(db.pool()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_scheduler_runs_until_cancelled() {
    let (db, _temp_dir) = setup_db().await;
    add_inactive_users(&db, 2).await;

    let job = Arc::new(memory_job(&db, 2));
    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(inactive_user_cleanup::cleanup::run_scheduler(
        Arc::clone(&job),
        Duration::from_millis(50),
        shutdown.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(180)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    assert_eq!(count_users(db.pool()).await.unwrap(), 0);
    // First tick deleted both users; later ticks recorded no-op reports.
    assert!(count_cleanup_reports(db.pool()).await.unwrap() >= 2);
    assert!(lock_is_free(&job).await);
}

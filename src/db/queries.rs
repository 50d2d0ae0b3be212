use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{
    format_timestamp, CandidateSample, CandidateSnapshot, CleanupReport, NewUser, UserRecord,
};

/// Rows eligible for cleanup: deactivated, or last seen before the cutoff.
/// A NULL (or unparseable) `last_activity_at` alone never qualifies.
///
/// Compared through `julianday` so rows written by other services in any
/// SQLite time format (`YYYY-MM-DD HH:MM:SS`, RFC 3339, ...) order correctly.
const CANDIDATE_FILTER: &str = "is_active = 0 OR julianday(last_activity_at) < julianday(?)";

// ========== Users ==========

/// Insert a user.
pub async fn insert_user(pool: &SqlitePool, user: &NewUser) -> Result<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO app_users (email, last_activity_at, is_active)
        VALUES (?, ?, ?)
        ",
    )
    .bind(&user.email)
    .bind(user.last_activity_at.map(format_timestamp))
    .bind(user.is_active)
    .execute(pool)
    .await
    .context("Failed to insert user")?;

    Ok(result.last_insert_rowid())
}

/// Get a user by ID.
pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<UserRecord>> {
    sqlx::query_as("SELECT id, email, last_activity_at, is_active FROM app_users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch user")
}

/// Count all users.
pub async fn count_users(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM app_users")
        .fetch_one(pool)
        .await
        .context("Failed to count users")?;
    Ok(row.0)
}

/// Count users with `is_active` set.
pub async fn count_active_users(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM app_users WHERE is_active = 1")
        .fetch_one(pool)
        .await
        .context("Failed to count active users")?;
    Ok(row.0)
}

// ========== Cleanup Candidates ==========

/// Count users matching the cleanup predicate for the given cutoff.
pub async fn count_cleanup_candidates(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM app_users WHERE {CANDIDATE_FILTER}"
    ))
    .bind(format_timestamp(cutoff))
    .fetch_one(pool)
    .await
    .context("Failed to count cleanup candidates")?;
    Ok(row.0)
}

/// Get the first `limit` candidates by ID, identity and email only.
pub async fn get_cleanup_candidate_sample(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<CandidateSample>> {
    sqlx::query_as(&format!(
        "SELECT id, email FROM app_users WHERE {CANDIDATE_FILTER} ORDER BY id ASC LIMIT ?"
    ))
    .bind(format_timestamp(cutoff))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch cleanup candidate sample")
}

/// Get the IDs of all candidates in ascending order.
pub async fn get_cleanup_candidate_ids(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(&format!(
        "SELECT id FROM app_users WHERE {CANDIDATE_FILTER} ORDER BY id ASC"
    ))
    .bind(format_timestamp(cutoff))
    .fetch_all(pool)
    .await
    .context("Failed to fetch cleanup candidate IDs")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Get identity, email and last activity of all candidates in ascending ID order.
pub async fn get_cleanup_candidate_snapshots(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<CandidateSnapshot>> {
    sqlx::query_as(&format!(
        "SELECT id, email, last_activity_at FROM app_users WHERE {CANDIDATE_FILTER} ORDER BY id ASC"
    ))
    .bind(format_timestamp(cutoff))
    .fetch_all(pool)
    .await
    .context("Failed to fetch cleanup candidates")
}

/// Delete the given users inside one transaction.
///
/// Returns the number of rows actually removed, which can be lower than
/// `ids.len()` if some were already gone.
pub async fn delete_users_in_transaction(pool: &SqlitePool, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    // One JSON array parameter instead of one placeholder per ID keeps large
    // chunks clear of SQLite's bound-variable limit.
    let id_list = serde_json::to_string(ids).context("Failed to encode ID list")?;

    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin chunk delete transaction")?;

    let result =
        sqlx::query("DELETE FROM app_users WHERE id IN (SELECT value FROM json_each(?))")
            .bind(id_list)
            .execute(&mut *tx)
            .await
            .context("Failed to delete user chunk")?;

    tx.commit()
        .await
        .context("Failed to commit chunk delete")?;

    Ok(result.rows_affected())
}

// ========== Cleanup Reports ==========

/// Insert a cleanup report and return the stored row.
pub async fn insert_cleanup_report(
    pool: &SqlitePool,
    timestamp: DateTime<Utc>,
    users_deleted: i64,
    active_users_remaining: i64,
) -> Result<CleanupReport> {
    let timestamp = format_timestamp(timestamp);
    let result = sqlx::query(
        r"
        INSERT INTO cleanup_reports (timestamp, users_deleted, active_users_remaining)
        VALUES (?, ?, ?)
        ",
    )
    .bind(&timestamp)
    .bind(users_deleted)
    .bind(active_users_remaining)
    .execute(pool)
    .await
    .context("Failed to insert cleanup report")?;

    Ok(CleanupReport {
        id: result.last_insert_rowid(),
        timestamp,
        users_deleted,
        active_users_remaining,
    })
}

/// Get the most recent cleanup report.
pub async fn get_latest_cleanup_report(pool: &SqlitePool) -> Result<Option<CleanupReport>> {
    sqlx::query_as(
        r"
        SELECT id, timestamp, users_deleted, active_users_remaining
        FROM cleanup_reports
        ORDER BY timestamp DESC, id DESC
        LIMIT 1
        ",
    )
    .fetch_optional(pool)
    .await
    .context("Failed to fetch latest cleanup report")
}

/// Count stored cleanup reports.
pub async fn count_cleanup_reports(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cleanup_reports")
        .fetch_one(pool)
        .await
        .context("Failed to count cleanup reports")?;
    Ok(row.0)
}

// ========== Run Locks ==========

/// Take the lock row for `key` unless an unexpired one exists.
///
/// A single upsert: inserts a fresh row, or overwrites the existing row only
/// when it has expired. Returns whether this call now owns the lock.
pub async fn try_insert_lock(
    pool: &SqlitePool,
    key: &str,
    now_ms: i64,
    expires_at_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        INSERT INTO cleanup_locks (key, expires_at)
        VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
        WHERE cleanup_locks.expires_at <= ?
        ",
    )
    .bind(key)
    .bind(expires_at_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Remove the lock row for `key`, held or not.
pub async fn delete_lock(pool: &SqlitePool, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM cleanup_locks WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

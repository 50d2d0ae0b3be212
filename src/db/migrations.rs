use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    if current_version < 3 {
        debug!("Running migration v3");
        run_migration_v3(pool).await?;
        set_schema_version(pool, 3).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM _schema_version")
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Users and cleanup reports.
async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating users and cleanup reports");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS app_users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            last_activity_at TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create app_users table")?;

    // Both halves of the candidate predicate get an index; SQLite can OR them.
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_app_users_is_active ON app_users(is_active)")
        .execute(pool)
        .await
        .context("Failed to create is_active index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_app_users_last_activity ON app_users(last_activity_at)",
    )
    .execute(pool)
    .await
    .context("Failed to create last_activity_at index")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS cleanup_reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            users_deleted INTEGER NOT NULL CHECK (users_deleted >= 0),
            active_users_remaining INTEGER NOT NULL CHECK (active_users_remaining >= 0)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create cleanup_reports table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cleanup_reports_timestamp ON cleanup_reports(timestamp)",
    )
    .execute(pool)
    .await
    .context("Failed to create cleanup_reports timestamp index")?;

    Ok(())
}

/// Run-lock rows for the SQLite lock backend.
async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: creating cleanup_locks");

    // expires_at is unix milliseconds so expiry checks are integer comparisons
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS cleanup_locks (
            key TEXT PRIMARY KEY,
            expires_at INTEGER NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create cleanup_locks table")?;

    Ok(())
}

/// Index the candidate predicate as it is evaluated.
async fn run_migration_v3(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v3: indexing julianday(last_activity_at)");

    sqlx::query("DROP INDEX IF EXISTS idx_app_users_last_activity")
        .execute(pool)
        .await
        .context("Failed to drop last_activity_at index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_app_users_last_activity_jd
        ON app_users(julianday(last_activity_at))
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create julianday(last_activity_at) index")?;

    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use inactive_user_cleanup::cleanup::{
    run_scheduler, CleanupJob, LockBackend, MemoryLockBackend, SqliteLockBackend,
};
use inactive_user_cleanup::config::{Config, LockBackendKind};
use inactive_user_cleanup::db::Database;
use inactive_user_cleanup::web;

/// How long shutdown waits for a scheduled run in progress to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting inactive-user-cleanup");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        database = %config.database_path.display(),
        inactivity_days = config.inactivity_days,
        chunk_size = config.chunk_size.get(),
        lock_backend = ?config.lock_backend,
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    let lock_backend: Arc<dyn LockBackend> = match config.lock_backend {
        LockBackendKind::Sqlite => Arc::new(SqliteLockBackend::new(db.pool().clone())),
        LockBackendKind::Memory => {
            warn!("In-memory cleanup lock only guards runs inside this process");
            Arc::new(MemoryLockBackend::new())
        }
    };

    let job = Arc::new(CleanupJob::new(
        db.clone(),
        lock_backend,
        config.cleanup_settings(),
    ));

    let shutdown = CancellationToken::new();

    let scheduler_handle = if config.schedule_enabled {
        let job = Arc::clone(&job);
        let interval = config.schedule_interval;
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            run_scheduler(job, interval, token).await;
        }))
    } else {
        info!("Cleanup scheduler disabled");
        None
    };

    let web_config = config.clone();
    let web_token = shutdown.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::serve(&web_config, db, job, web_token).await {
            error!("Web server error: {e:#}");
        }
    });

    shutdown_signal().await;

    info!("Shutting down...");
    shutdown.cancel();

    if let Some(handle) = scheduler_handle {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Scheduled cleanup still running at shutdown; its lock will expire after the TTL");
        }
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, web_handle).await.is_err() {
        warn!("Web server did not stop within the shutdown grace period");
    }

    info!("Shutdown complete");

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,inactive_user_cleanup=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

//! Advisory run lock for the cleanup job.
//!
//! A [`LockBackend`] only offers acquire-if-absent with a TTL and release.
//! [`LockManager`] binds it to the configured key and bounds each call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("lock backend query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage for named, expiring locks.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` with expiry `ttl` only if it is absent or expired.
    ///
    /// Returns whether this call took the lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Remove `key` whether or not it is held.
    async fn release(&self, key: &str) -> Result<(), LockError>;
}

/// Process-local lock map. Only coordinates runs inside one process.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Lock rows in the `cleanup_locks` table, shared by every process that
/// opens the same database file.
#[derive(Debug, Clone)]
pub struct SqliteLockBackend {
    pool: SqlitePool,
}

impl SqliteLockBackend {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for SqliteLockBackend {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let acquired =
            db::try_insert_lock(&self.pool, key, now_ms, now_ms.saturating_add(ttl_ms)).await?;
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        db::delete_lock(&self.pool, key).await?;
        Ok(())
    }
}

/// Result of trying to take the run lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    /// This run holds the lock.
    Acquired,
    /// Another run holds the lock.
    Held,
    /// The backend failed or timed out; the run goes ahead without a lock.
    Unguarded,
}

impl LockAcquisition {
    /// Whether the run may proceed.
    #[must_use]
    pub const fn may_run(self) -> bool {
        matches!(self, Self::Acquired | Self::Unguarded)
    }
}

/// The named cleanup lock with its TTL, on top of a [`LockBackend`].
///
/// Backend trouble never reaches the caller: acquisition degrades to
/// [`LockAcquisition::Unguarded`] and release failures are logged and
/// dropped, leaving TTL expiry to clear a stuck lock.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    key: String,
    ttl: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// `timeout` bounds every backend call.
    #[must_use]
    pub fn new(
        backend: Arc<dyn LockBackend>,
        key: impl Into<String>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            key: key.into(),
            ttl,
            timeout,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take the lock.
    pub async fn acquire(&self) -> LockAcquisition {
        let attempt = tokio::time::timeout(
            self.timeout,
            self.backend.try_acquire(&self.key, self.ttl),
        )
        .await
        .unwrap_or_else(|_| Err(LockError::Timeout(self.timeout)));

        match attempt {
            Ok(true) => {
                debug!(key = %self.key, ttl_secs = self.ttl.as_secs(), "Acquired cleanup lock");
                LockAcquisition::Acquired
            }
            Ok(false) => LockAcquisition::Held,
            Err(e) => {
                warn!(
                    key = %self.key,
                    error = %e,
                    "Lock backend failed while acquiring cleanup lock; proceeding without lock"
                );
                LockAcquisition::Unguarded
            }
        }
    }

    /// Release the lock. Failures are logged and ignored.
    pub async fn release(&self) {
        let result = tokio::time::timeout(self.timeout, self.backend.release(&self.key))
            .await
            .unwrap_or_else(|_| Err(LockError::Timeout(self.timeout)));

        match result {
            Ok(()) => debug!(key = %self.key, "Released cleanup lock"),
            Err(e) => warn!(
                key = %self.key,
                error = %e,
                "Failed to release cleanup lock (ignored; it expires after its TTL)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenBackend;

    #[async_trait]
    impl LockBackend for BrokenBackend {
        async fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> {
            Err(LockError::Unavailable("connection refused".to_string()))
        }

        async fn release(&self, _key: &str) -> Result<(), LockError> {
            Err(LockError::Unavailable("connection refused".to_string()))
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl LockBackend for HangingBackend {
        async fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<bool, LockError> {
            std::future::pending().await
        }

        async fn release(&self, _key: &str) -> Result<(), LockError> {
            std::future::pending().await
        }
    }

    fn manager(backend: Arc<dyn LockBackend>, ttl: Duration) -> LockManager {
        LockManager::new(backend, "test_lock", ttl, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_memory_lock_is_exclusive_until_released() {
        let lock = manager(Arc::new(MemoryLockBackend::new()), Duration::from_secs(60));

        assert_eq!(lock.acquire().await, LockAcquisition::Acquired);
        assert_eq!(lock.acquire().await, LockAcquisition::Held);

        lock.release().await;
        assert_eq!(lock.acquire().await, LockAcquisition::Acquired);
    }

    #[tokio::test]
    async fn test_memory_lock_expires_after_ttl() {
        let lock = manager(Arc::new(MemoryLockBackend::new()), Duration::from_millis(20));

        assert_eq!(lock.acquire().await, LockAcquisition::Acquired);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.acquire().await, LockAcquisition::Acquired);
    }

    #[tokio::test]
    async fn test_memory_lock_keys_are_independent() {
        let backend = Arc::new(MemoryLockBackend::new());
        let ttl = Duration::from_secs(60);

        assert!(backend.try_acquire("a", ttl).await.unwrap());
        assert!(backend.try_acquire("b", ttl).await.unwrap());
        assert!(!backend.try_acquire("a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_unguarded() {
        let lock = manager(Arc::new(BrokenBackend), Duration::from_secs(60));

        assert_eq!(lock.acquire().await, LockAcquisition::Unguarded);
        // Must not panic or surface anything.
        lock.release().await;
    }

    #[tokio::test]
    async fn test_backend_timeout_degrades_to_unguarded() {
        let lock = manager(Arc::new(HangingBackend), Duration::from_secs(60));

        assert_eq!(lock.acquire().await, LockAcquisition::Unguarded);
        lock.release().await;
    }

    #[test]
    fn test_may_run() {
        assert!(LockAcquisition::Acquired.may_run());
        assert!(LockAcquisition::Unguarded.may_run());
        assert!(!LockAcquisition::Held.may_run());
    }
}

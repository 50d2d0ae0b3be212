//! Chunked deletion of candidate users.

use std::num::NonZeroUsize;

use sqlx::SqlitePool;
use tracing::debug;

use crate::db;

/// Outcome of a fully committed chunked delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkedDeletion {
    /// Rows actually removed across all chunks.
    pub deleted: u64,
    /// Number of chunk transactions committed.
    pub chunks: usize,
}

/// A chunk transaction failed. Chunks before it stay committed.
#[derive(Debug)]
pub struct ChunkFailure {
    /// Zero-based index of the failed chunk.
    pub chunk: usize,
    /// Rows removed by the chunks committed before the failure.
    pub committed: u64,
    pub error: anyhow::Error,
}

/// Deletes IDs in contiguous groups of at most `chunk_size`, one
/// transaction per group, so no transaction grows with the candidate count.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedDeleter<'a> {
    pool: &'a SqlitePool,
    chunk_size: NonZeroUsize,
}

impl<'a> ChunkedDeleter<'a> {
    #[must_use]
    pub const fn new(pool: &'a SqlitePool, chunk_size: NonZeroUsize) -> Self {
        Self { pool, chunk_size }
    }

    /// Delete `ids` chunk by chunk.
    ///
    /// A chunk matching fewer rows than it names (e.g. users removed by
    /// something else meanwhile) is fine. The first failing chunk stops the
    /// remaining ones.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkFailure`] with the count already committed.
    pub async fn delete_in_chunks(&self, ids: &[i64]) -> Result<ChunkedDeletion, ChunkFailure> {
        let mut outcome = ChunkedDeletion::default();

        for (index, chunk) in ids.chunks(self.chunk_size.get()).enumerate() {
            let removed = db::delete_users_in_transaction(self.pool, chunk)
                .await
                .map_err(|error| ChunkFailure {
                    chunk: index,
                    committed: outcome.deleted,
                    error,
                })?;

            outcome.deleted += removed;
            outcome.chunks += 1;
            debug!(
                chunk = index,
                requested = chunk.len(),
                removed,
                total = outcome.deleted,
                "Committed delete chunk"
            );
        }

        Ok(outcome)
    }
}

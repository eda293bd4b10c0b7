// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for shard replication progress.
//!
//! A checkpoint is the pair `(leader_checkpoint, follower_checkpoint)` for one
//! follower shard: the highest leader sequence number that has been applied,
//! and the follower sequence number at which that data became durable.
//!
//! Orchestration code only sees the narrow [`CheckpointStore`] trait
//! (get/put/delete by [`ShardId`]). Two backends are provided:
//!
//! - [`MemoryCheckpointStore`]: `DashMap`-backed, for tests and standalone use
//! - [`SqliteCheckpointStore`]: SQLite (WAL mode) with debounced writes
//!
//! # Monotonicity
//!
//! `put()` rejects a checkpoint that would move either side backwards. The
//! only way to reset a shard is `delete_index()`, which `stop` uses to discard
//! a replication relationship.
//!
//! # Debounced Writes (SQLite)
//!
//! - `put()` updates the in-memory cache immediately and marks the key dirty
//! - `flush()` persists all dirty checkpoints in a batch
//! - the controller calls `flush()` periodically and on shutdown
//!
//! A crash between `put()` and `flush()` rewinds a shard by at most one flush
//! interval. On restart the shard re-reads operations the follower already
//! holds; applying them again is idempotent.
//!
//! ```text
//! fetch ops 41..=50 → apply to follower → put (50, 50) → flush
//!                     (crash here = re-apply 41..=50, idempotent)
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Sequence number meaning "no operation applied yet".
pub const NO_OPS_PERFORMED: i64 = -1;

/// Boxed future returned by [`CheckpointStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Identity of a follower shard: `(follower index, shard number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Replication watermark for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest leader sequence number applied to the follower.
    pub leader_checkpoint: i64,
    /// Follower sequence number at which the applied data is durable.
    pub follower_checkpoint: i64,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Checkpoint {
    /// Checkpoint of a shard that has not replicated anything.
    pub const EMPTY: Checkpoint = Checkpoint {
        leader_checkpoint: NO_OPS_PERFORMED,
        follower_checkpoint: NO_OPS_PERFORMED,
    };

    pub fn new(leader_checkpoint: i64, follower_checkpoint: i64) -> Self {
        Self {
            leader_checkpoint,
            follower_checkpoint,
        }
    }

    /// True if moving from `self` to `next` does not regress either side.
    pub fn allows_advance_to(&self, next: &Checkpoint) -> bool {
        next.leader_checkpoint >= self.leader_checkpoint
            && next.follower_checkpoint >= self.follower_checkpoint
    }

    /// Number of leader operations not yet applied, given the leader tip.
    pub fn lag(&self, leader_tip: i64) -> u64 {
        leader_tip.saturating_sub(self.leader_checkpoint).max(0) as u64
    }
}

/// Narrow key-value interface for checkpoint persistence.
///
/// Writes are single-writer per key (one shard task per shard), so
/// implementations need no locking finer than per key.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Get the checkpoint for a shard, `None` if it was never written.
    fn get<'a>(&'a self, shard: &'a ShardId) -> StoreFuture<'a, Option<Checkpoint>>;

    /// Store a checkpoint. Fails with `InvalidState` if it would regress.
    fn put<'a>(&'a self, shard: &'a ShardId, checkpoint: Checkpoint) -> StoreFuture<'a, ()>;

    /// Delete every checkpoint of a follower index. Returns how many were removed.
    fn delete_index<'a>(&'a self, index: &'a str) -> StoreFuture<'a, usize>;

    /// Persist pending writes. Returns the number of checkpoints written.
    fn flush(&self) -> StoreFuture<'_, usize> {
        Box::pin(async { Ok(0) })
    }

    /// Flush and release resources.
    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

fn regression_error(shard: &ShardId, current: &Checkpoint, next: &Checkpoint) -> ReplicationError {
    ReplicationError::InvalidState {
        expected: format!(
            "checkpoint for {} >= ({}, {})",
            shard, current.leader_checkpoint, current.follower_checkpoint
        ),
        actual: format!("({}, {})", next.leader_checkpoint, next.follower_checkpoint),
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<ShardId, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get<'a>(&'a self, shard: &'a ShardId) -> StoreFuture<'a, Option<Checkpoint>> {
        Box::pin(async move { Ok(self.checkpoints.get(shard).map(|c| *c.value())) })
    }

    fn put<'a>(&'a self, shard: &'a ShardId, checkpoint: Checkpoint) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entry = self
                .checkpoints
                .entry(shard.clone())
                .or_insert(Checkpoint::EMPTY);
            if !entry.allows_advance_to(&checkpoint) {
                return Err(regression_error(shard, entry.value(), &checkpoint));
            }
            *entry = checkpoint;
            Ok(())
        })
    }

    fn delete_index<'a>(&'a self, index: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let before = self.checkpoints.len();
            self.checkpoints.retain(|k, _| k.index != index);
            Ok(before - self.checkpoints.len())
        })
    }
}

// =============================================================================
// SQLite store
// =============================================================================

/// Backoff for statements that hit `SQLITE_BUSY` / `SQLITE_LOCKED`.
fn busy_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(500),
        backoff_factor: 2.0,
    }
}

/// `SQLITE_BUSY` (5) and `SQLITE_LOCKED` (6), including extended codes.
fn is_busy(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    match db.code().and_then(|c| c.parse::<i64>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
    }
}

/// Run `statement`, re-running it while SQLite reports the database busy.
async fn with_busy_retry<T, F, Fut>(what: &'static str, mut statement: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let policy = busy_retry();
    let mut attempt = 0;
    loop {
        match statement().await {
            Err(e) if is_busy(&e) && !policy.is_exhausted(attempt + 1) => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, "SQLite busy");
                crate::metrics::record_checkpoint_busy_retry(what);
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

const UPSERT: &str = r#"
    INSERT INTO checkpoints (follower_index, shard_id, leader_checkpoint, follower_checkpoint, updated_at)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT(follower_index, shard_id) DO UPDATE SET
        leader_checkpoint = excluded.leader_checkpoint,
        follower_checkpoint = excluded.follower_checkpoint,
        updated_at = excluded.updated_at
"#;

/// Persistent checkpoint storage backed by SQLite.
///
/// Reads are served from an in-memory cache loaded at open time; writes
/// land in the cache and reach disk on the next [`flush`](CheckpointStore::flush),
/// one transaction per flush.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<ShardId, Checkpoint>>,
    /// Shards written since the last successful flush.
    dirty: RwLock<HashSet<ShardId>>,
    /// Held by flushes and deletes from cache read to commit, so a flush
    /// never writes back rows of an index deleted meanwhile.
    disk_writes: Mutex<()>,
    path: String,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").field("path", &self.path).finish()
    }
}

impl SqliteCheckpointStore {
    /// Open (or create) a checkpoint database and load every row into the cache.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| ReplicationError::Config(format!("invalid checkpoint database path {:?}: {}", path, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().max_connections(2).connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                follower_index TEXT NOT NULL,
                shard_id INTEGER NOT NULL,
                leader_checkpoint INTEGER NOT NULL,
                follower_checkpoint INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (follower_index, shard_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT follower_index, shard_id, leader_checkpoint, follower_checkpoint FROM checkpoints",
        )
        .fetch_all(&pool)
        .await?;
        let cache: HashMap<ShardId, Checkpoint> = rows
            .into_iter()
            .map(|(index, shard, leader, follower)| {
                (ShardId::new(index, shard as u32), Checkpoint::new(leader, follower))
            })
            .collect();

        info!(path = %path, restored = cache.len(), "Checkpoint database opened");
        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            dirty: RwLock::new(HashSet::new()),
            disk_writes: Mutex::new(()),
            path,
        })
    }

    pub async fn has_dirty(&self) -> bool {
        self.dirty_count().await > 0
    }

    /// Shards whose latest checkpoint is not on disk yet.
    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Write every dirty checkpoint in one transaction. On failure the
    /// shards stay dirty for the next flush.
    async fn flush_dirty(&self) -> Result<usize> {
        let _disk = self.disk_writes.lock().await;
        let keys: Vec<ShardId> = self.dirty.write().await.drain().collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let batch: Vec<(ShardId, Checkpoint)> = {
            let cache = self.cache.read().await;
            keys.iter()
                .filter_map(|key| cache.get(key).map(|cp| (key.clone(), *cp)))
                .collect()
        };
        let updated_at = chrono::Utc::now().timestamp_millis();
        let (pool, rows) = (&self.pool, &batch);

        let written = with_busy_retry("checkpoint_flush", move || async move {
            let mut tx = pool.begin().await?;
            for (shard, checkpoint) in rows {
                sqlx::query(UPSERT)
                    .bind(&shard.index)
                    .bind(shard.shard as i64)
                    .bind(checkpoint.leader_checkpoint)
                    .bind(checkpoint.follower_checkpoint)
                    .bind(updated_at)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(rows.len())
        })
        .await;

        match written {
            Ok(count) => {
                debug!(count, "Checkpoints flushed");
                crate::metrics::record_checkpoint_flush(count, false);
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, pending = keys.len(), "Checkpoint flush failed");
                crate::metrics::record_checkpoint_flush(0, true);
                self.dirty.write().await.extend(keys);
                Err(e.into())
            }
        }
    }

    /// Fold the WAL back into the main database file.
    pub async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        with_busy_retry("checkpoint_wal", move || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        Ok(())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get<'a>(&'a self, shard: &'a ShardId) -> StoreFuture<'a, Option<Checkpoint>> {
        Box::pin(async move { Ok(self.cache.read().await.get(shard).copied()) })
    }

    fn put<'a>(&'a self, shard: &'a ShardId, checkpoint: Checkpoint) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut cache = self.cache.write().await;
                let current = cache.get(shard).copied().unwrap_or(Checkpoint::EMPTY);
                if !current.allows_advance_to(&checkpoint) {
                    return Err(regression_error(shard, &current, &checkpoint));
                }
                cache.insert(shard.clone(), checkpoint);
            }
            self.dirty.write().await.insert(shard.clone());
            Ok(())
        })
    }

    fn delete_index<'a>(&'a self, index: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let _disk = self.disk_writes.lock().await;
            let removed = {
                let mut cache = self.cache.write().await;
                let before = cache.len();
                cache.retain(|k, _| k.index != index);
                before - cache.len()
            };
            self.dirty.write().await.retain(|k| k.index != index);

            let pool = &self.pool;
            with_busy_retry("checkpoint_delete", move || async move {
                sqlx::query("DELETE FROM checkpoints WHERE follower_index = ?")
                    .bind(index)
                    .execute(pool)
                    .await
            })
            .await?;

            debug!(index, removed, "Checkpoints deleted");
            Ok(removed)
        })
    }

    fn flush(&self) -> StoreFuture<'_, usize> {
        Box::pin(self.flush_dirty())
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let flushed = self.flush_dirty().await;
            if let Err(e) = &flushed {
                warn!(error = %e, "Final checkpoint flush failed");
            }
            if let Err(e) = self.wal_checkpoint().await {
                warn!(error = %e, "WAL checkpoint failed on close");
            }
            self.pool.close().await;
            info!(path = %self.path, "Checkpoint database closed");
            flushed.map(|_| ())
        })
    }
}

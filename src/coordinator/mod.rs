// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication controller.
//!
//! The entry point for every control operation. It owns:
//! - one supervising index task per follower index ([`index_task`])
//! - through it, one shard task per follower shard ([`shard_task`])
//! - the shared checkpoint store, task registry, fetch bulkhead and throttle
//!
//! # Architecture
//!
//! ```text
//! ReplicationController
//!   ├── slots: follower index -> Mutex<IndexSlot>   (control ops serialize here)
//!   ├── views: follower index -> IndexView          (lock-free status reads)
//!   └── root CancellationToken
//!         └── index task token (registered)
//!               └── shard task tokens (registered)
//! ```
//!
//! Control operations on the same index serialize on the index's async
//! mutex; different indices never contend. Status and stats read `watch`
//! snapshots and never wait on shard work.

mod index_task;
mod shard_task;
mod types;

pub use types::{
    IndexReplicationState, IndexSnapshot, ShardReplicationState, ShardSnapshot, INDEX_TASK_CANCELLED,
    SHARD_TASK_KILLED, USER_INITIATED,
};

use crate::api::{AcknowledgedResponse, StartReplicationRequest};
use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use crate::cluster::{FollowerCluster, LeaderCluster};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{Bulkhead, FetchThrottle};
use crate::settings::IndexSettings;
use crate::stats::{self, CounterSnapshot, FollowerStats, LeaderStats};
use crate::status::{self, ReplicationStatus};
use crate::task_registry::{TaskInfo, TaskRegistry};
use dashmap::DashMap;
use index_task::{spawn_index_task, IndexCommand, IndexTaskDeps, IndexTaskHandle, IndexTaskSpec, IndexView};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct IndexSlot {
    handle: Option<IndexTaskHandle>,
}

impl IndexSlot {
    /// The handle, if its task is still running.
    fn live(&self) -> Option<&IndexTaskHandle> {
        self.handle.as_ref().filter(|h| !h.is_finished())
    }
}

/// Cross-cluster index replication controller.
///
/// Generic over the leader (read) and follower (write) cluster
/// collaborators. The in-memory cluster implements both, so tests can hand
/// the same `Arc` to both sides.
pub struct ReplicationController<L: LeaderCluster, F: FollowerCluster> {
    deps: IndexTaskDeps<L, F>,

    /// Per-index control slots. Entries are never removed, so the mutex for
    /// an index is stable across stop/start.
    slots: DashMap<String, Arc<Mutex<IndexSlot>>>,

    /// Status readers of every index with a task.
    views: DashMap<String, IndexView>,

    shutdown_tx: watch::Sender<bool>,

    /// Background task handles (checkpoint flush)
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl<L: LeaderCluster, F: FollowerCluster> ReplicationController<L, F> {
    /// Open a controller: validate the config, open the checkpoint store and
    /// spawn the periodic checkpoint flush.
    pub async fn open(config: ReplicationConfig, leader: Arc<L>, follower: Arc<F>) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn CheckpointStore> = match &config.checkpoint.sqlite_path {
            Some(path) => {
                let store = SqliteCheckpointStore::new(path).await?;
                info!(path = %path, "Checkpoint store initialized");
                Arc::new(store)
            }
            None => {
                info!("Using in-memory checkpoint store");
                Arc::new(MemoryCheckpointStore::new())
            }
        };

        let controller = Self::with_store(config, leader, follower, store);
        let flush = controller.spawn_flush_task();
        controller.background.lock().await.push(flush);
        Ok(controller)
    }

    /// Create a controller over an existing checkpoint store. No background
    /// flush task is spawned.
    pub fn with_store(
        config: ReplicationConfig,
        leader: Arc<L>,
        follower: Arc<F>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let throttle = config.shard.throttle_config().map(|cfg| {
            info!(
                per_second = cfg.per_second,
                burst = cfg.burst,
                "Leader fetch throttle enabled"
            );
            Arc::new(FetchThrottle::new(cfg))
        });
        let bulkhead = Arc::new(Bulkhead::new(config.shard.max_concurrent_fetches));
        let (shutdown_tx, _) = watch::channel(false);

        info!(node_id = %config.node_id, "Replication controller created");

        Self {
            deps: IndexTaskDeps {
                config: Arc::new(config),
                leader,
                follower,
                store,
                registry: TaskRegistry::new(),
                bulkhead,
                throttle,
                root: CancellationToken::new(),
            },
            slots: DashMap::new(),
            views: DashMap::new(),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.deps.config
    }

    pub fn leader(&self) -> &Arc<L> {
        &self.deps.leader
    }

    pub fn follower(&self) -> &Arc<F> {
        &self.deps.follower
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.deps.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.deps.registry
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn slot(&self, index: &str) -> Arc<Mutex<IndexSlot>> {
        Arc::clone(self.slots.entry(index.to_string()).or_default().value())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(ReplicationError::Shutdown);
        }
        Ok(())
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Control operations
    // ═════════════════════════════════════════════════════════════════════════

    /// Start replicating `request.leader_index` into `follower_index`.
    ///
    /// The task starts in STARTING and restores the follower index from the
    /// leader. With `wait_for_restore` the call returns only once the task
    /// has left STARTING, failing if the restore failed or took longer than
    /// `index.restore_wait_timeout`.
    pub async fn start(
        &self,
        follower_index: &str,
        request: StartReplicationRequest,
        wait_for_restore: bool,
    ) -> Result<AcknowledgedResponse> {
        let result = self.start_inner(follower_index, request, wait_for_restore).await;
        metrics::record_control_op("start", result.is_ok());
        result
    }

    async fn start_inner(
        &self,
        follower_index: &str,
        request: StartReplicationRequest,
        wait_for_restore: bool,
    ) -> Result<AcknowledgedResponse> {
        self.ensure_running()?;

        let slot = self.slot(follower_index);
        let mut guard = slot.lock().await;
        if guard.live().is_some() {
            return Err(ReplicationError::AlreadyReplicating {
                index: follower_index.to_string(),
            });
        }
        request.settings.validate()?;

        let leader = self
            .deps
            .leader
            .resolve_index(&request.leader_alias, &request.leader_index)
            .await
            .map_err(|e| ReplicationError::LeaderNotFound {
                alias: request.leader_alias.clone(),
                index: request.leader_index.clone(),
                message: e.to_string(),
            })?;

        info!(
            follower_index,
            alias = %request.leader_alias,
            leader_index = %leader.name,
            shards = leader.number_of_shards,
            "Starting replication"
        );

        let handle = spawn_index_task(
            self.deps.clone(),
            IndexTaskSpec {
                leader_alias: request.leader_alias,
                leader,
                follower_index: follower_index.to_string(),
                use_roles: request.use_roles,
                settings: request.settings,
            },
        );
        let status_rx = handle.view.status_rx.clone();
        self.views.insert(follower_index.to_string(), handle.view.clone());
        guard.handle = Some(handle);
        drop(guard);
        metrics::set_active_index_tasks(self.views.len());

        if wait_for_restore {
            self.wait_for_restore(follower_index, status_rx).await?;
        }
        Ok(AcknowledgedResponse::ACK)
    }

    async fn wait_for_restore(
        &self,
        follower_index: &str,
        mut status_rx: watch::Receiver<types::IndexStatusCell>,
    ) -> Result<()> {
        let timeout = self.deps.config.index.restore_wait_timeout_duration();
        let waited = tokio::time::timeout(
            timeout,
            status_rx.wait_for(|cell| cell.state != IndexReplicationState::Starting),
        )
        .await;

        let (state, reason) = match waited {
            Err(_) => {
                return Err(ReplicationError::Internal(format!(
                    "restore of [{}] did not finish within {:?}",
                    follower_index, timeout
                )))
            }
            // Index task gone without a final state: only shutdown does that
            Ok(Err(_)) => return Err(ReplicationError::Shutdown),
            Ok(Ok(cell)) => (cell.state, cell.reason.clone()),
        };

        match state {
            IndexReplicationState::Failed if reason.as_deref() == Some(INDEX_TASK_CANCELLED) => {
                Err(ReplicationError::TaskCancelled {
                    reason: INDEX_TASK_CANCELLED.to_string(),
                    by_user: false,
                })
            }
            IndexReplicationState::Failed => Err(ReplicationError::Internal(format!(
                "restore of [{}] failed: {}",
                follower_index,
                reason.unwrap_or_default()
            ))),
            IndexReplicationState::Stopped => Err(ReplicationError::TaskCancelled {
                reason: format!("replication of [{}] was stopped during restore", follower_index),
                by_user: true,
            }),
            _ => Ok(()),
        }
    }

    /// Stop replication. Terminal: the task, its shard tasks and its
    /// checkpoints are gone; the follower index is left as it is.
    pub async fn stop(&self, follower_index: &str) -> Result<AcknowledgedResponse> {
        let result = self.stop_inner(follower_index).await;
        metrics::record_control_op("stop", result.is_ok());
        result
    }

    async fn stop_inner(&self, follower_index: &str) -> Result<AcknowledgedResponse> {
        let slot = self.slot(follower_index);
        let mut guard = slot.lock().await;
        let Some(handle) = guard.handle.take() else {
            return Err(ReplicationError::NotReplicating {
                index: follower_index.to_string(),
            });
        };

        if let Err(e) = handle.request(|ack| IndexCommand::Stop { ack }).await {
            debug!(follower_index, error = %e, "Index task already gone");
        }

        let IndexTaskHandle { mut join, .. } = handle;
        let join_timeout = self.deps.config.index.drain_timeout_duration() * 2;
        match tokio::time::timeout(join_timeout, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(follower_index, error = %e, "Index task panicked"),
            Err(_) => {
                warn!(follower_index, "Index task did not stop in time, aborting");
                join.abort();
            }
        }

        self.views.remove(follower_index);
        metrics::set_active_index_tasks(self.views.len());

        let removed = self.deps.store.delete_index(follower_index).await?;
        info!(follower_index, checkpoints_removed = removed, "Replication stopped");
        Ok(AcknowledgedResponse::ACK)
    }

    /// Pause replication, cancelling every shard task. `reason` defaults to
    /// "User initiated". Pausing a paused index is acknowledged.
    pub async fn pause(&self, follower_index: &str, reason: Option<String>) -> Result<AcknowledgedResponse> {
        let reason = reason.unwrap_or_else(|| USER_INITIATED.to_string());
        self.command("pause", follower_index, |ack| IndexCommand::Pause { reason, ack })
            .await
    }

    /// Resume a PAUSED (or FAILED) index from its persisted checkpoints.
    pub async fn resume(&self, follower_index: &str) -> Result<AcknowledgedResponse> {
        self.command("resume", follower_index, |ack| IndexCommand::Resume { ack })
            .await
    }

    /// Update index settings per the settings policy table.
    pub async fn update(&self, follower_index: &str, settings: IndexSettings) -> Result<AcknowledgedResponse> {
        self.command("update", follower_index, |ack| IndexCommand::Update { settings, ack })
            .await
    }

    async fn command<M>(&self, operation: &str, follower_index: &str, make: M) -> Result<AcknowledgedResponse>
    where
        M: FnOnce(oneshot::Sender<Result<()>>) -> IndexCommand,
    {
        let result = async {
            self.ensure_running()?;
            let slot = self.slot(follower_index);
            let guard = slot.lock().await;
            let handle = guard.live().ok_or_else(|| ReplicationError::NotReplicating {
                index: follower_index.to_string(),
            })?;
            handle.request(make).await?;
            debug!(follower_index, operation, "Control operation acknowledged");
            Ok(AcknowledgedResponse::ACK)
        }
        .await;
        metrics::record_control_op(operation, result.is_ok());
        result
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Status and stats
    // ═════════════════════════════════════════════════════════════════════════

    /// Snapshot of one index, `None` if it has no task.
    pub fn snapshot(&self, follower_index: &str) -> Option<IndexSnapshot> {
        self.views.get(follower_index).map(|view| view.snapshot())
    }

    /// Status document of one index. Never fails: an index without a task
    /// reports `REPLICATION NOT IN PROGRESS`.
    pub fn status(&self, follower_index: &str, verbose: bool) -> ReplicationStatus {
        status::aggregate(self.snapshot(follower_index).as_ref(), verbose)
    }

    pub fn index_state(&self, follower_index: &str) -> Option<IndexReplicationState> {
        self.views.get(follower_index).map(|view| view.state())
    }

    /// True if the index has a task that has not been stopped.
    pub fn is_replicating(&self, follower_index: &str) -> bool {
        self.views.contains_key(follower_index)
    }

    /// Follower indices that currently have a task, sorted.
    pub fn replicated_indices(&self) -> Vec<String> {
        let mut indices: Vec<String> = self.views.iter().map(|v| v.key().clone()).collect();
        indices.sort();
        indices
    }

    fn collect_snapshots(&self) -> Vec<(IndexSnapshot, CounterSnapshot)> {
        self.views
            .iter()
            .map(|view| (view.snapshot(), view.counters.snapshot()))
            .collect()
    }

    pub fn follower_stats(&self) -> FollowerStats {
        let snapshots = self.collect_snapshots();
        stats::follower_stats(snapshots.iter().map(|(s, c)| (s, *c)))
    }

    pub fn leader_stats(&self) -> LeaderStats {
        let snapshots = self.collect_snapshots();
        stats::leader_stats(snapshots.iter().map(|(s, c)| (s, *c)))
    }

    /// List registered tasks by action glob and description substring.
    pub fn tasks(&self, action_glob: &str, description_filter: Option<&str>) -> Result<Vec<TaskInfo>> {
        self.deps.registry.list(action_glob, description_filter)
    }

    /// Cancel a task through the registry, like an external kill.
    pub fn cancel_task(&self, task_id: u64) -> bool {
        self.deps.registry.cancel(task_id)
    }

    // ═════════════════════════════════════════════════════════════════════════
    // Background tasks and shutdown
    // ═════════════════════════════════════════════════════════════════════════

    /// Spawn the checkpoint flush task (debounced store writes).
    fn spawn_flush_task(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.deps.store);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let flush_interval = self.deps.config.checkpoint.flush_interval_duration();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match store.flush().await {
                            Ok(0) => {}
                            Ok(flushed) => debug!(flushed, "Flushed checkpoints"),
                            Err(e) => warn!(error = %e, "Failed to flush checkpoints"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Checkpoint flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!(?flush_interval, "Spawned checkpoint flush task");
        handle
    }

    /// Shut down gracefully.
    ///
    /// 1. Reject new control operations
    /// 2. Ask every index task to drain its shard tasks (checkpoints are kept)
    /// 3. Cancel the root token and close the fetch bulkhead
    /// 4. Stop the flush task and close the checkpoint store
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Shutting down replication controller");

        let indices: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut joins = Vec::new();
        for index in indices {
            let slot = self.slot(&index);
            let mut guard = slot.lock().await;
            if let Some(handle) = guard.handle.take() {
                let _ = handle.commands.send(IndexCommand::Shutdown).await;
                joins.push((index, handle.join));
            }
        }

        let drain_timeout = self.deps.config.index.drain_timeout_duration() * 2;
        for (index, mut join) in joins {
            match tokio::time::timeout(drain_timeout, &mut join).await {
                Ok(Ok(())) => debug!(follower_index = %index, "Index task drained"),
                Ok(Err(e)) => warn!(follower_index = %index, error = %e, "Index task panicked during shutdown"),
                Err(_) => {
                    warn!(follower_index = %index, "Index task timed out during shutdown");
                    join.abort();
                }
            }
        }
        self.deps.root.cancel();
        self.deps.bulkhead.close();
        self.views.clear();
        metrics::set_active_index_tasks(0);

        let handles: Vec<_> = std::mem::take(&mut *self.background.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task panicked during shutdown");
            }
        }

        if let Err(e) = self.deps.store.close().await {
            warn!(error = %e, "Failed to close checkpoint store");
        }
        info!("Replication controller stopped");
    }
}

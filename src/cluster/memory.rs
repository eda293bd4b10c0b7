//! In-process leader and follower cluster.
//!
//! One [`InMemoryCluster`] plays both roles: it holds leader indices under
//! remote aliases and follower indices locally, so a single `Arc` can be
//! handed to the controller as both `LeaderCluster` and `FollowerCluster`.
//!
//! Leader shards assign sequence numbers densely from 0. Follower shards
//! replay operations under the leader's sequence number, so a follower
//! shard's durable sequence number equals the highest leader operation it
//! has applied.
//!
//! Fault injection hooks (`fail_next_fetches`, `set_shard_unavailable`,
//! `close_follower_index`, `delete_leader_index`) drive the failure paths of
//! the shard and index tasks in tests.

use super::{
    BoxFuture, ClusterError, ClusterResult, FollowerCluster, LeaderCluster, LeaderIndexMetadata,
    Operation, OperationBatch,
};
use crate::checkpoint::{Checkpoint, ShardId, NO_OPS_PERFORMED};
use crate::settings::IndexSettings;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct LeaderIndex {
    /// Operations per shard; `shards[s][i].seq_no == i`.
    shards: Vec<Vec<Operation>>,
    unavailable: HashSet<u32>,
    next_doc: u64,
}

#[derive(Debug, Default)]
struct FollowerShard {
    docs: HashMap<String, String>,
    max_seq_no: i64,
}

#[derive(Debug, Default)]
struct FollowerIndex {
    shards: Vec<FollowerShard>,
    closed: bool,
    settings: IndexSettings,
}

/// In-memory leader + follower cluster.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    /// alias -> leader index name -> index
    remotes: RwLock<HashMap<String, BTreeMap<String, LeaderIndex>>>,
    followers: RwLock<HashMap<String, FollowerIndex>>,
    transient_fetch_failures: AtomicU32,
    transient_apply_failures: AtomicU32,
    fetch_calls: AtomicU64,
    restore_delay_ms: AtomicU64,
}

/// Consume one unit of an injected-failure budget.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Leader side
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a remote cluster alias with no indices.
    pub async fn add_remote(&self, alias: &str) {
        self.remotes.write().await.entry(alias.to_string()).or_default();
    }

    /// Create an empty leader index, registering the alias if needed.
    pub async fn create_leader_index(&self, alias: &str, index: &str, number_of_shards: u32) {
        let mut remotes = self.remotes.write().await;
        let indices = remotes.entry(alias.to_string()).or_default();
        indices.insert(
            index.to_string(),
            LeaderIndex {
                shards: (0..number_of_shards).map(|_| Vec::new()).collect(),
                ..Default::default()
            },
        );
    }

    pub async fn delete_leader_index(&self, alias: &str, index: &str) -> bool {
        let mut remotes = self.remotes.write().await;
        remotes
            .get_mut(alias)
            .map(|indices| indices.remove(index).is_some())
            .unwrap_or(false)
    }

    /// Write `count` generated documents, spread round-robin over the shards.
    pub async fn index_documents(&self, alias: &str, index: &str, count: usize) -> ClusterResult<()> {
        let mut remotes = self.remotes.write().await;
        let leader = remotes
            .get_mut(alias)
            .ok_or_else(|| ClusterError::UnknownAlias(alias.to_string()))?
            .get_mut(index)
            .ok_or_else(|| ClusterError::IndexNotFound(index.to_string()))?;
        let shard_count = leader.shards.len() as u64;
        if shard_count == 0 {
            return Ok(());
        }
        for _ in 0..count {
            let n = leader.next_doc;
            leader.next_doc += 1;
            let ops = &mut leader.shards[(n % shard_count) as usize];
            let seq_no = ops.len() as i64;
            ops.push(Operation::index(seq_no, format!("doc-{}", n), format!("{{\"value\":{}}}", n)));
        }
        Ok(())
    }

    /// Delete a document previously written to a specific shard.
    pub async fn delete_document(&self, alias: &str, index: &str, shard: u32, doc_id: &str) -> ClusterResult<()> {
        let mut remotes = self.remotes.write().await;
        let leader = remotes
            .get_mut(alias)
            .ok_or_else(|| ClusterError::UnknownAlias(alias.to_string()))?
            .get_mut(index)
            .ok_or_else(|| ClusterError::IndexNotFound(index.to_string()))?;
        let ops = leader
            .shards
            .get_mut(shard as usize)
            .ok_or_else(|| ClusterError::MappingMismatch(format!("no shard {} in {}", shard, index)))?;
        let seq_no = ops.len() as i64;
        ops.push(Operation::delete(seq_no, doc_id));
        Ok(())
    }

    /// Highest sequence number on a leader shard.
    pub async fn leader_tip(&self, alias: &str, index: &str, shard: u32) -> Option<i64> {
        let remotes = self.remotes.read().await;
        let ops = remotes.get(alias)?.get(index)?.shards.get(shard as usize)?;
        Some(ops.len() as i64 - 1)
    }

    pub async fn set_shard_unavailable(&self, alias: &str, index: &str, shard: u32, unavailable: bool) {
        let mut remotes = self.remotes.write().await;
        if let Some(leader) = remotes.get_mut(alias).and_then(|i| i.get_mut(index)) {
            if unavailable {
                leader.unavailable.insert(shard);
            } else {
                leader.unavailable.remove(&shard);
            }
        }
    }

    /// Make the next `n` leader fetches fail with a transient error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.transient_fetch_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` follower applies fail with a transient error.
    pub fn fail_next_applies(&self, n: u32) {
        self.transient_apply_failures.store(n, Ordering::SeqCst);
    }

    /// Hold every follower restore for `delay` before copying the leader.
    pub fn set_restore_delay(&self, delay: std::time::Duration) {
        self.restore_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total leader fetch calls served (including failed ones).
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Follower side
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn close_follower_index(&self, index: &str) -> bool {
        self.set_follower_closed(index, true).await
    }

    pub async fn open_follower_index(&self, index: &str) -> bool {
        self.set_follower_closed(index, false).await
    }

    async fn set_follower_closed(&self, index: &str, closed: bool) -> bool {
        let mut followers = self.followers.write().await;
        match followers.get_mut(index) {
            Some(follower) => {
                follower.closed = closed;
                true
            }
            None => false,
        }
    }

    pub async fn follower_exists(&self, index: &str) -> bool {
        self.followers.read().await.contains_key(index)
    }

    /// Live documents across all shards of a follower index.
    pub async fn follower_doc_count(&self, index: &str) -> usize {
        self.followers
            .read()
            .await
            .get(index)
            .map(|f| f.shards.iter().map(|s| s.docs.len()).sum())
            .unwrap_or(0)
    }

    pub async fn follower_max_seq_no(&self, index: &str, shard: u32) -> Option<i64> {
        let followers = self.followers.read().await;
        followers
            .get(index)?
            .shards
            .get(shard as usize)
            .map(|s| s.max_seq_no)
    }

    pub async fn follower_settings(&self, index: &str) -> Option<IndexSettings> {
        self.followers.read().await.get(index).map(|f| f.settings.clone())
    }
}

impl LeaderCluster for InMemoryCluster {
    fn resolve_index<'a>(&'a self, alias: &'a str, index: &'a str) -> BoxFuture<'a, LeaderIndexMetadata> {
        Box::pin(async move {
            let remotes = self.remotes.read().await;
            let indices = remotes
                .get(alias)
                .ok_or_else(|| ClusterError::UnknownAlias(alias.to_string()))?;
            let leader = indices
                .get(index)
                .ok_or_else(|| ClusterError::IndexNotFound(index.to_string()))?;
            Ok(LeaderIndexMetadata {
                name: index.to_string(),
                number_of_shards: leader.shards.len() as u32,
            })
        })
    }

    fn list_indices<'a>(&'a self, alias: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let remotes = self.remotes.read().await;
            let indices = remotes
                .get(alias)
                .ok_or_else(|| ClusterError::UnknownAlias(alias.to_string()))?;
            Ok(indices.keys().cloned().collect())
        })
    }

    fn fetch_operations<'a>(
        &'a self,
        alias: &'a str,
        shard: &'a ShardId,
        from_seq_no: i64,
        max_ops: usize,
    ) -> BoxFuture<'a, OperationBatch> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::Relaxed);
            if take_one(&self.transient_fetch_failures) {
                return Err(ClusterError::Transient("simulated fetch timeout".to_string()));
            }

            let remotes = self.remotes.read().await;
            let leader = remotes
                .get(alias)
                .ok_or_else(|| ClusterError::UnknownAlias(alias.to_string()))?
                .get(&shard.index)
                .ok_or_else(|| ClusterError::IndexNotFound(shard.index.clone()))?;

            let unavailable = || ClusterError::ShardUnavailable {
                index: shard.index.clone(),
                shard: shard.shard,
                message: "no active primary".to_string(),
            };
            if leader.unavailable.contains(&shard.shard) {
                return Err(unavailable());
            }
            let ops = leader.shards.get(shard.shard as usize).ok_or_else(unavailable)?;

            let start = (from_seq_no + 1).max(0) as usize;
            let operations: Vec<Operation> = ops.iter().skip(start).take(max_ops).cloned().collect();
            Ok(OperationBatch {
                operations,
                leader_tip: ops.len() as i64 - 1,
            })
        })
    }
}

impl FollowerCluster for InMemoryCluster {
    fn bootstrap_index<'a>(
        &'a self,
        alias: &'a str,
        leader: &'a LeaderIndexMetadata,
        follower_index: &'a str,
        settings: &'a IndexSettings,
    ) -> BoxFuture<'a, Vec<Checkpoint>> {
        Box::pin(async move {
            let delay = self.restore_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let remotes = self.remotes.read().await;
            let source = remotes
                .get(alias)
                .ok_or_else(|| ClusterError::UnknownAlias(alias.to_string()))?
                .get(&leader.name)
                .ok_or_else(|| ClusterError::IndexNotFound(leader.name.clone()))?;

            let mut shards = Vec::with_capacity(source.shards.len());
            let mut checkpoints = Vec::with_capacity(source.shards.len());
            for ops in &source.shards {
                let mut shard = FollowerShard {
                    docs: HashMap::new(),
                    max_seq_no: NO_OPS_PERFORMED,
                };
                for op in ops {
                    apply_one(&mut shard, op);
                }
                checkpoints.push(Checkpoint::new(shard.max_seq_no, shard.max_seq_no));
                shards.push(shard);
            }
            drop(remotes);

            debug!(
                leader_index = %leader.name,
                follower_index = %follower_index,
                shards = shards.len(),
                "Restored follower index from leader"
            );
            self.followers.write().await.insert(
                follower_index.to_string(),
                FollowerIndex {
                    shards,
                    closed: false,
                    settings: settings.clone(),
                },
            );
            Ok(checkpoints)
        })
    }

    fn apply_operations<'a>(&'a self, shard: &'a ShardId, operations: Vec<Operation>) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            if take_one(&self.transient_apply_failures) {
                return Err(ClusterError::Transient("simulated bulk rejection".to_string()));
            }

            let mut followers = self.followers.write().await;
            let follower = followers
                .get_mut(&shard.index)
                .ok_or_else(|| ClusterError::IndexNotFound(shard.index.clone()))?;
            if follower.closed {
                return Err(ClusterError::IndexClosed(shard.index.clone()));
            }
            let target = follower
                .shards
                .get_mut(shard.shard as usize)
                .ok_or_else(|| ClusterError::MappingMismatch(format!("follower has no shard {}", shard)))?;

            for op in &operations {
                apply_one(target, op);
            }
            Ok(target.max_seq_no)
        })
    }

    fn update_settings<'a>(&'a self, follower_index: &'a str, settings: &'a IndexSettings) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut followers = self.followers.write().await;
            let follower = followers
                .get_mut(follower_index)
                .ok_or_else(|| ClusterError::IndexNotFound(follower_index.to_string()))?;
            follower.settings.merge(settings);
            Ok(())
        })
    }
}

/// Replay a leader operation; operations at or below the shard's sequence
/// number were already applied and are skipped.
fn apply_one(shard: &mut FollowerShard, op: &Operation) {
    if op.seq_no <= shard.max_seq_no {
        return;
    }
    match &op.source {
        Some(source) => {
            shard.docs.insert(op.doc_id.clone(), source.clone());
        }
        None => {
            shard.docs.remove(&op.doc_id);
        }
    }
    shard.max_seq_no = op.seq_no;
}

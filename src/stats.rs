//! Leader and follower replication statistics.
//!
//! Shard tasks bump lock-free [`IndexCounters`] (one set per follower index).
//! The controller combines them with index snapshots into the
//! `follower_stats` and `leader_stats` documents on demand.

use crate::checkpoint::Checkpoint;
use crate::coordinator::{IndexReplicationState, IndexSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-index operation counters, shared by all shard tasks of the index.
#[derive(Debug, Default)]
pub struct IndexCounters {
    ops_read: AtomicU64,
    bytes_read: AtomicU64,
    ops_written: AtomicU64,
    failed_reads: AtomicU64,
    failed_writes: AtomicU64,
}

impl IndexCounters {
    pub fn record_read(&self, ops: usize, bytes: usize) {
        self.ops_read.fetch_add(ops as u64, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self, ops: usize) {
        self.ops_written.fetch_add(ops as u64, Ordering::Relaxed);
    }

    pub fn record_failed_read(&self) {
        self.failed_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_write(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            operations_read: self.ops_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            operations_written: self.ops_written.load(Ordering::Relaxed),
            failed_read_requests: self.failed_reads.load(Ordering::Relaxed),
            failed_write_requests: self.failed_writes.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`IndexCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub operations_read: u64,
    pub bytes_read: u64,
    pub operations_written: u64,
    pub failed_read_requests: u64,
    pub failed_write_requests: u64,
}

/// Per follower index entry of [`FollowerStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerIndexStats {
    pub state: IndexReplicationState,
    pub operations_read: u64,
    pub operations_written: u64,
    pub failed_read_requests: u64,
    pub failed_write_requests: u64,
    /// Minimum across running shards, `-1` when none are running.
    pub leader_checkpoint: i64,
    pub follower_checkpoint: i64,
}

/// Follower-side statistics across every replicated index on this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerStats {
    pub num_syncing_indices: u64,
    pub num_bootstrapping_indices: u64,
    pub num_paused_indices: u64,
    pub num_failed_indices: u64,
    pub num_shard_tasks: u64,
    pub operations_read: u64,
    pub operations_written: u64,
    pub failed_read_requests: u64,
    pub failed_write_requests: u64,
    pub index_stats: BTreeMap<String, FollowerIndexStats>,
}

/// Per leader index entry of [`LeaderStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderIndexStats {
    pub operations_read: u64,
    pub bytes_read: u64,
    /// Number of follower indices replicating from this leader index.
    pub followers: u64,
}

/// Leader-side statistics: what this node has read from each leader index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderStats {
    pub num_replicated_indices: u64,
    pub operations_read: u64,
    pub bytes_read: u64,
    /// Keyed by `alias:leader_index`.
    pub index_stats: BTreeMap<String, LeaderIndexStats>,
}

/// Minimum checkpoint across shards, [`Checkpoint::EMPTY`] if there are none.
pub fn min_checkpoint(snapshot: &IndexSnapshot) -> Checkpoint {
    let leader = snapshot.shards.iter().map(|s| s.checkpoint.leader_checkpoint).min();
    let follower = snapshot.shards.iter().map(|s| s.checkpoint.follower_checkpoint).min();
    match (leader, follower) {
        (Some(l), Some(f)) => Checkpoint::new(l, f),
        _ => Checkpoint::EMPTY,
    }
}

/// Build the follower stats document.
pub fn follower_stats<'a>(indices: impl IntoIterator<Item = (&'a IndexSnapshot, CounterSnapshot)>) -> FollowerStats {
    let mut stats = FollowerStats::default();
    for (snapshot, counters) in indices {
        match snapshot.state {
            IndexReplicationState::Syncing => stats.num_syncing_indices += 1,
            IndexReplicationState::Starting => stats.num_bootstrapping_indices += 1,
            IndexReplicationState::Paused => stats.num_paused_indices += 1,
            IndexReplicationState::Failed => stats.num_failed_indices += 1,
            IndexReplicationState::Stopped => continue,
        }
        if snapshot.state == IndexReplicationState::Syncing {
            stats.num_shard_tasks += snapshot.shards.len() as u64;
        }
        stats.operations_read += counters.operations_read;
        stats.operations_written += counters.operations_written;
        stats.failed_read_requests += counters.failed_read_requests;
        stats.failed_write_requests += counters.failed_write_requests;

        let checkpoint = min_checkpoint(snapshot);
        stats.index_stats.insert(
            snapshot.follower_index.clone(),
            FollowerIndexStats {
                state: snapshot.state,
                operations_read: counters.operations_read,
                operations_written: counters.operations_written,
                failed_read_requests: counters.failed_read_requests,
                failed_write_requests: counters.failed_write_requests,
                leader_checkpoint: checkpoint.leader_checkpoint,
                follower_checkpoint: checkpoint.follower_checkpoint,
            },
        );
    }
    stats
}

/// Build the leader stats document.
pub fn leader_stats<'a>(indices: impl IntoIterator<Item = (&'a IndexSnapshot, CounterSnapshot)>) -> LeaderStats {
    let mut stats = LeaderStats::default();
    for (snapshot, counters) in indices {
        if snapshot.state == IndexReplicationState::Stopped {
            continue;
        }
        let key = format!("{}:{}", snapshot.leader_alias, snapshot.leader_index);
        let entry = stats.index_stats.entry(key).or_default();
        entry.operations_read += counters.operations_read;
        entry.bytes_read += counters.bytes_read;
        entry.followers += 1;
        stats.operations_read += counters.operations_read;
        stats.bytes_read += counters.bytes_read;
    }
    stats.num_replicated_indices = stats.index_stats.len() as u64;
    stats
}

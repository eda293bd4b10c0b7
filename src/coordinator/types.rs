//! Replication task state types.
//!
//! # Index task state transitions
//!
//! ```text
//!            start()
//!   ──────────────────→ STARTING ──(restore failed)──→ FAILED
//!                          │                           ↑  │
//!                          │ (bootstrap done)          │  │ resume()
//!                          ↓                           │  ↓
//!   resume() ┌──────→ SYNCING ──(index-wide error,─────┘ STARTING / SYNCING
//!            │            │      index task killed)
//!            │            │ pause(), all shard tasks gone
//!            │            ↓
//!            └──────── PAUSED
//!
//!   any non-terminal state ──stop()──→ STOPPED
//! ```
//!
//! # Shard task states
//!
//! - **SYNCING**: fetch/apply loop running.
//! - **CANCELLED**: stopped by its parent (pause/stop) or killed externally.
//! - **FAILED**: permanent error, or transient retries exhausted.

use crate::api::UseRoles;
use crate::checkpoint::Checkpoint;
use crate::error::ReplicationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Reason reported for user-driven transitions without an explicit reason.
pub const USER_INITIATED: &str = "User initiated";

/// Reason reported when the index task is killed through the task registry.
pub const INDEX_TASK_CANCELLED: &str = "Index replication task was cancelled by user";

/// Reason reported by a shard task killed through the task registry.
pub const SHARD_TASK_KILLED: &str = "Shard task killed or cancelled.";

/// Lifecycle state of an index replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexReplicationState {
    /// Follower index is being restored from the leader.
    Starting,
    /// Shard tasks are running.
    Syncing,
    /// No shard tasks; resumable from persisted checkpoints.
    Paused,
    /// Stopped by an index-wide error or an external kill; resumable.
    Failed,
    /// Terminal. The task and its checkpoints are gone.
    Stopped,
}

impl IndexReplicationState {
    /// States from which `resume` is accepted.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Failed)
    }
}

impl std::fmt::Display for IndexReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Syncing => write!(f, "SYNCING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Lifecycle state of a shard replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardReplicationState {
    Syncing,
    Cancelled,
    Failed,
}

impl std::fmt::Display for ShardReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syncing => write!(f, "SYNCING"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Point-in-time view of one shard task, published on a `watch` channel
/// after every checkpoint advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSnapshot {
    pub shard: u32,
    pub state: ShardReplicationState,
    /// Last durable checkpoint.
    pub checkpoint: Checkpoint,
    /// Leader tip seen by the last successful fetch.
    pub leader_tip: i64,
    pub reason: Option<String>,
}

impl ShardSnapshot {
    pub fn syncing(shard: u32, checkpoint: Checkpoint) -> Self {
        Self {
            shard,
            state: ShardReplicationState::Syncing,
            checkpoint,
            leader_tip: checkpoint.leader_checkpoint,
            reason: None,
        }
    }
}

/// Point-in-time view of an index task and its shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub leader_alias: String,
    pub leader_index: String,
    pub follower_index: String,
    pub state: IndexReplicationState,
    pub reason: Option<String>,
    pub use_roles: Option<UseRoles>,
    /// Ordered by shard number.
    pub shards: Vec<ShardSnapshot>,
}

/// What the index task publishes; shard snapshots are read through their
/// own receivers at read time.
#[derive(Debug, Clone)]
pub(crate) struct IndexStatusCell {
    pub state: IndexReplicationState,
    pub reason: Option<String>,
    pub shards: BTreeMap<u32, watch::Receiver<ShardSnapshot>>,
}

impl IndexStatusCell {
    pub fn new(state: IndexReplicationState, reason: Option<String>) -> Self {
        Self {
            state,
            reason,
            shards: BTreeMap::new(),
        }
    }

    /// Copy-on-read: clone the index fields and borrow each shard once.
    pub fn shard_snapshots(&self) -> Vec<ShardSnapshot> {
        self.shards.values().map(|rx| rx.borrow().clone()).collect()
    }
}

/// How a shard task ended.
#[derive(Debug)]
pub enum ShardExit {
    /// Stopped by the parent (`killed == false`) or through the task
    /// registry (`killed == true`).
    Cancelled { reason: String, killed: bool },
    /// Permanent failure; `error.is_index_wide()` decides escalation.
    Failed { error: ReplicationError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_state_display() {
        assert_eq!(IndexReplicationState::Starting.to_string(), "STARTING");
        assert_eq!(IndexReplicationState::Syncing.to_string(), "SYNCING");
        assert_eq!(IndexReplicationState::Paused.to_string(), "PAUSED");
        assert_eq!(IndexReplicationState::Failed.to_string(), "FAILED");
        assert_eq!(IndexReplicationState::Stopped.to_string(), "STOPPED");
    }

    #[test]
    fn test_index_state_serde_matches_display() {
        for state in [
            IndexReplicationState::Starting,
            IndexReplicationState::Syncing,
            IndexReplicationState::Paused,
            IndexReplicationState::Failed,
            IndexReplicationState::Stopped,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }

    #[test]
    fn test_resumable_states() {
        assert!(IndexReplicationState::Paused.is_resumable());
        assert!(IndexReplicationState::Failed.is_resumable());
        assert!(!IndexReplicationState::Syncing.is_resumable());
        assert!(!IndexReplicationState::Starting.is_resumable());
        assert!(!IndexReplicationState::Stopped.is_resumable());
    }

    #[test]
    fn test_shard_state_display() {
        assert_eq!(ShardReplicationState::Syncing.to_string(), "SYNCING");
        assert_eq!(ShardReplicationState::Cancelled.to_string(), "CANCELLED");
        assert_eq!(ShardReplicationState::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_status_cell_reads_latest_shard_values() {
        let (tx0, rx0) = watch::channel(ShardSnapshot::syncing(0, Checkpoint::new(1, 1)));
        let (_tx1, rx1) = watch::channel(ShardSnapshot::syncing(1, Checkpoint::EMPTY));
        let mut cell = IndexStatusCell::new(IndexReplicationState::Syncing, Some(USER_INITIATED.into()));
        cell.shards.insert(1, rx1);
        cell.shards.insert(0, rx0);

        tx0.send_modify(|s| s.checkpoint = Checkpoint::new(5, 5));

        let shards = cell.shard_snapshots();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].shard, 0);
        assert_eq!(shards[0].checkpoint, Checkpoint::new(5, 5));
        assert_eq!(shards[1].checkpoint, Checkpoint::EMPTY);
    }
}

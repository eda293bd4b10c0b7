//! Status aggregation.
//!
//! [`aggregate`] turns an [`IndexSnapshot`] into the status document. It is a
//! pure function: no locks, no I/O.
//!
//! | Index state | Rendered status | Checkpoint fields |
//! |-------------|-----------------|-------------------|
//! | STARTING | `BOOTSTRAPPING` | none |
//! | SYNCING | `SYNCING` | `syncing_details` (min across shards) or, verbose, `shard_replication_details` |
//! | PAUSED / FAILED | `PAUSED` | none |
//! | STOPPED / no task | `REPLICATION NOT IN PROGRESS` | none |

use crate::coordinator::{IndexReplicationState, IndexSnapshot, ShardReplicationState, ShardSnapshot};
use crate::stats::min_checkpoint;
use serde::{Deserialize, Serialize};

/// The `status` field of a status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    #[serde(rename = "SYNCING")]
    Syncing,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "BOOTSTRAPPING")]
    Bootstrapping,
    #[serde(rename = "REPLICATION NOT IN PROGRESS")]
    NotInProgress,
}

/// Aggregated checkpoints of a SYNCING index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncingDetails {
    pub leader_checkpoint: i64,
    pub follower_checkpoint: i64,
}

/// One entry of `shard_replication_details`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard_id: u32,
    pub state: ShardReplicationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub syncing_task_details: SyncingDetails,
}

impl From<&ShardSnapshot> for ShardStatus {
    fn from(shard: &ShardSnapshot) -> Self {
        Self {
            shard_id: shard.shard,
            state: shard.state,
            reason: shard.reason.clone(),
            syncing_task_details: SyncingDetails {
                leader_checkpoint: shard.checkpoint.leader_checkpoint,
                follower_checkpoint: shard.checkpoint.follower_checkpoint,
            },
        }
    }
}

/// Status document of a follower index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follower_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing_details: Option<SyncingDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_replication_details: Option<Vec<ShardStatus>>,
}

impl ReplicationStatus {
    pub fn not_in_progress() -> Self {
        Self {
            status: StatusKind::NotInProgress,
            reason: None,
            leader_alias: None,
            leader_index: None,
            follower_index: None,
            syncing_details: None,
            shard_replication_details: None,
        }
    }
}

/// Build the status document for `snapshot` (`None`: no task).
///
/// The index-level reason always wins; shard reasons only appear inside
/// `shard_replication_details`.
pub fn aggregate(snapshot: Option<&IndexSnapshot>, verbose: bool) -> ReplicationStatus {
    let Some(snapshot) = snapshot else {
        return ReplicationStatus::not_in_progress();
    };

    let status = match snapshot.state {
        IndexReplicationState::Starting => StatusKind::Bootstrapping,
        IndexReplicationState::Syncing => StatusKind::Syncing,
        IndexReplicationState::Paused | IndexReplicationState::Failed => StatusKind::Paused,
        IndexReplicationState::Stopped => return ReplicationStatus::not_in_progress(),
    };

    let mut doc = ReplicationStatus {
        status,
        reason: snapshot.reason.clone(),
        leader_alias: Some(snapshot.leader_alias.clone()),
        leader_index: Some(snapshot.leader_index.clone()),
        follower_index: Some(snapshot.follower_index.clone()),
        syncing_details: None,
        shard_replication_details: None,
    };

    if status == StatusKind::Syncing {
        if verbose {
            doc.shard_replication_details = Some(snapshot.shards.iter().map(ShardStatus::from).collect());
        } else {
            let checkpoint = min_checkpoint(snapshot);
            doc.syncing_details = Some(SyncingDetails {
                leader_checkpoint: checkpoint.leader_checkpoint,
                follower_checkpoint: checkpoint.follower_checkpoint,
            });
        }
    }
    doc
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the index replication engine.
//!
//! Errors fall into three groups: control-plane precondition failures
//! (returned to the caller of a control operation), shard-level data-plane
//! failures (handled inside the shard task), and index-wide failures that
//! move the whole replication task.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Index-wide | Description |
//! |------------|-----------|------------|-------------|
//! | `AlreadyReplicating` | No | - | `start` on an index that already has a task |
//! | `LeaderNotFound` | No | - | Leader alias or index could not be resolved |
//! | `TaskNotPaused` | No | - | `resume` on a task that is not paused |
//! | `NotReplicating` | No | - | Control operation on an index without a task |
//! | `ShardTransientFetch` | Yes | No | Fetch/apply timed out or peer briefly unavailable |
//! | `ShardPermanent` | No | No | Leader shard unavailable, mapping mismatch |
//! | `IndexClosed` | No | Yes | Follower index was closed |
//! | `LeaderIndexDeleted` | No | Yes | Leader index no longer exists |
//! | `TaskCancelled` | No | - | Task cancelled by a user or by the task substrate |
//! | `CheckpointStore` | No | - | Local SQLite errors (needs operator attention) |
//! | `Config` | No | - | Invalid configuration or settings |
//! | `InvalidState` | No | - | State machine violation |
//! | `PatternNotFound` | No | - | Auto-follow pattern does not exist |
//! | `Shutdown` | No | - | Engine is shutting down |
//! | `Internal` | No | - | Unexpected internal error |
//!
//! Shard tasks use [`ReplicationError::is_retryable()`] to decide whether to
//! back off and retry, and [`ReplicationError::is_index_wide()`] to decide
//! whether a failure must be escalated to the index task.

use crate::cluster::ClusterError;
use crate::checkpoint::ShardId;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Marker carried by every follower-index-closed failure message.
pub const INDEX_CLOSED_MARKER: &str = "index_closed_exception";

/// Marker carried by every leader-index-deleted failure message.
pub const INDEX_NOT_FOUND_MARKER: &str = "no such index";

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A replication task already exists for the follower index.
    #[error("Index {index} is already replicating")]
    AlreadyReplicating { index: String },

    /// The leader alias or leader index could not be resolved.
    #[error("Leader index [{alias}:{index}] not found: {message}")]
    LeaderNotFound {
        alias: String,
        index: String,
        message: String,
    },

    /// `resume` was called on a task that is not paused.
    #[error("Replication on index {index} is not paused (state: {state})")]
    TaskNotPaused { index: String, state: String },

    /// No replication task exists for the follower index.
    #[error("No replication in progress for index {index}")]
    NotReplicating { index: String },

    /// Transient shard-level failure, retried with backoff.
    #[error("Transient failure on shard {shard}: {message}")]
    ShardTransientFetch { shard: ShardId, message: String },

    /// Permanent shard-level failure, marks only that shard as failed.
    #[error("Permanent failure on shard {shard}: {message}")]
    ShardPermanent { shard: ShardId, message: String },

    /// The follower index was closed underneath the replication task.
    #[error("{marker}: closed index [{index}]", marker = INDEX_CLOSED_MARKER)]
    IndexClosed { index: String },

    /// The leader index no longer exists.
    #[error("{marker} [{index}]", marker = INDEX_NOT_FOUND_MARKER)]
    LeaderIndexDeleted { index: String },

    /// The task was cancelled, either by the user or by the task substrate.
    #[error("Task cancelled: {reason}")]
    TaskCancelled { reason: String, by_user: bool },

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Invalid or missing configuration or index settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Auto-follow pattern lookup failed.
    #[error("Auto-follow pattern [{alias}:{name}] not found")]
    PatternNotFound { alias: String, name: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Map a data-plane error raised while reading from the leader shard.
    pub fn from_fetch(shard: &ShardId, leader_index: &str, err: ClusterError) -> Self {
        match err {
            ClusterError::IndexNotFound(_) | ClusterError::UnknownAlias(_) => {
                Self::LeaderIndexDeleted {
                    index: leader_index.to_string(),
                }
            }
            ClusterError::IndexClosed(index) => Self::IndexClosed { index },
            ClusterError::Transient(message) => Self::ShardTransientFetch {
                shard: shard.clone(),
                message,
            },
            other => Self::ShardPermanent {
                shard: shard.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Map a data-plane error raised while writing to the follower shard.
    ///
    /// A missing follower index is a shard-level problem, not a leader deletion.
    pub fn from_apply(shard: &ShardId, err: ClusterError) -> Self {
        match err {
            ClusterError::IndexClosed(index) => Self::IndexClosed { index },
            ClusterError::Transient(message) => Self::ShardTransientFetch {
                shard: shard.clone(),
                message,
            },
            other => Self::ShardPermanent {
                shard: shard.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Map an error raised while restoring the follower index.
    pub fn from_bootstrap(leader_index: &str, err: ClusterError) -> Self {
        match err {
            ClusterError::IndexNotFound(_) | ClusterError::UnknownAlias(_) => {
                Self::LeaderIndexDeleted {
                    index: leader_index.to_string(),
                }
            }
            ClusterError::IndexClosed(index) => Self::IndexClosed { index },
            other => Self::Internal(format!("restore of [{}] failed: {}", leader_index, other)),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ShardTransientFetch { .. })
    }

    /// Check if this error affects every shard of the index.
    pub fn is_index_wide(&self) -> bool {
        matches!(
            self,
            Self::IndexClosed { .. } | Self::LeaderIndexDeleted { .. }
        )
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Leader and follower cluster integration traits.
//!
//! The replication engine never talks to a cluster directly. Shard tasks and
//! the controller go through two narrow traits:
//!
//! - [`LeaderCluster`]: resolve leader indices, list them for auto-follow,
//!   fetch operations from a leader shard after a sequence number
//! - [`FollowerCluster`]: bootstrap (restore) a follower index, apply
//!   operations to a follower shard, forward settings updates
//!
//! The embedding node provides implementations; [`memory::InMemoryCluster`]
//! is a complete in-process implementation used by tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use index_replication::checkpoint::ShardId;
//! use index_replication::cluster::{
//!     BoxFuture, ClusterError, LeaderCluster, LeaderIndexMetadata, OperationBatch,
//! };
//!
//! struct RemoteLeader { /* transport client */ }
//!
//! impl LeaderCluster for RemoteLeader {
//!     fn resolve_index<'a>(&'a self, _alias: &'a str, index: &'a str) -> BoxFuture<'a, LeaderIndexMetadata> {
//!         Box::pin(async move { Err(ClusterError::IndexNotFound(index.to_string())) })
//!     }
//!
//!     fn list_indices<'a>(&'a self, _alias: &'a str) -> BoxFuture<'a, Vec<String>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn fetch_operations<'a>(
//!         &'a self,
//!         _alias: &'a str,
//!         _shard: &'a ShardId,
//!         _from_seq_no: i64,
//!         _max_ops: usize,
//!     ) -> BoxFuture<'a, OperationBatch> {
//!         Box::pin(async move { Ok(OperationBatch::default()) })
//!     }
//! }
//! ```

pub mod memory;

use crate::checkpoint::{Checkpoint, ShardId, NO_OPS_PERFORMED};
use crate::settings::IndexSettings;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type for cluster calls.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ClusterResult<T>> + Send + 'a>>;

/// Errors reported by cluster implementations.
///
/// The shard task classifies these into retryable, shard-permanent and
/// index-wide failures (see [`crate::error::ReplicationError::from_fetch`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("no such index [{0}]")]
    IndexNotFound(String),

    #[error("index [{0}] is closed")]
    IndexClosed(String),

    #[error("shard [{index}][{shard}] unavailable: {message}")]
    ShardUnavailable {
        index: String,
        shard: u32,
        message: String,
    },

    #[error("mapping mismatch: {0}")]
    MappingMismatch(String),

    /// Timeouts, connection resets, rejected executions.
    #[error("transient cluster error: {0}")]
    Transient(String),

    #[error("no remote cluster configured with alias [{0}]")]
    UnknownAlias(String),
}

/// What the controller needs to know about a leader index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderIndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
}

/// A single write operation read from a leader shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Leader sequence number; the follower replays it under the same number.
    pub seq_no: i64,
    pub doc_id: String,
    /// Document source, `None` for a delete.
    pub source: Option<String>,
}

impl Operation {
    pub fn index(seq_no: i64, doc_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            seq_no,
            doc_id: doc_id.into(),
            source: Some(source.into()),
        }
    }

    pub fn delete(seq_no: i64, doc_id: impl Into<String>) -> Self {
        Self {
            seq_no,
            doc_id: doc_id.into(),
            source: None,
        }
    }

    /// Approximate payload size, used for leader stats.
    pub fn size_bytes(&self) -> usize {
        self.doc_id.len() + self.source.as_ref().map_or(0, |s| s.len())
    }
}

/// Result of one leader fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    /// Operations with `seq_no > from_seq_no`, ascending.
    pub operations: Vec<Operation>,
    /// Highest sequence number on the leader shard at fetch time.
    pub leader_tip: i64,
}

impl Default for OperationBatch {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            leader_tip: NO_OPS_PERFORMED,
        }
    }
}

impl OperationBatch {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Highest sequence number in the batch.
    pub fn max_seq_no(&self) -> Option<i64> {
        self.operations.iter().map(|op| op.seq_no).max()
    }

    pub fn size_bytes(&self) -> usize {
        self.operations.iter().map(Operation::size_bytes).sum()
    }
}

/// Read side: the remote cluster holding leader indices.
pub trait LeaderCluster: Send + Sync + 'static {
    /// Resolve a leader index on the cluster registered under `alias`.
    fn resolve_index<'a>(&'a self, alias: &'a str, index: &'a str) -> BoxFuture<'a, LeaderIndexMetadata>;

    /// List the index names visible through `alias` (for auto-follow).
    fn list_indices<'a>(&'a self, alias: &'a str) -> BoxFuture<'a, Vec<String>>;

    /// Fetch up to `max_ops` operations with `seq_no > from_seq_no` from a
    /// leader shard. `shard.index` is the leader index name.
    fn fetch_operations<'a>(
        &'a self,
        alias: &'a str,
        shard: &'a ShardId,
        from_seq_no: i64,
        max_ops: usize,
    ) -> BoxFuture<'a, OperationBatch>;
}

/// Write side: the local cluster holding follower indices.
pub trait FollowerCluster: Send + Sync + 'static {
    /// Create (or overwrite) the follower index from the leader and return
    /// the initial checkpoint of every shard, ordered by shard number.
    fn bootstrap_index<'a>(
        &'a self,
        alias: &'a str,
        leader: &'a LeaderIndexMetadata,
        follower_index: &'a str,
        settings: &'a IndexSettings,
    ) -> BoxFuture<'a, Vec<Checkpoint>>;

    /// Apply operations to a follower shard and return the follower sequence
    /// number up to which data is durable. Re-applying an operation that is
    /// already present has no effect.
    fn apply_operations<'a>(&'a self, shard: &'a ShardId, operations: Vec<Operation>) -> BoxFuture<'a, i64>;

    /// Forward in-place settings to the follower index.
    fn update_settings<'a>(&'a self, follower_index: &'a str, settings: &'a IndexSettings) -> BoxFuture<'a, ()>;
}

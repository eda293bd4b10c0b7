//! # Index Replication
//!
//! A cross-cluster index replication engine: keeps follower indices on this
//! cluster in sync with leader indices on remote clusters.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            index-replication                              │
//! │                                                                           │
//! │  ┌───────────────────────┐                                                │
//! │  │ ReplicationController │── start/stop/pause/resume/update, status       │
//! │  └──────────┬────────────┘                                                │
//! │             │ one per follower index                                      │
//! │             ▼                                                             │
//! │  ┌───────────────────────┐    ┌─────────────┐    ┌─────────────────────┐  │
//! │  │ IndexTask (supervisor)│───►│ ShardTask   │───►│ fetch (leader)      │  │
//! │  │ restore, state machine│    │ (per shard) │    │ apply (follower)    │  │
//! │  └───────────────────────┘    └──────┬──────┘    └─────────────────────┘  │
//! │                                      │                                    │
//! │                                      ▼                                    │
//! │                           ┌────────────────────┐   ┌──────────────────┐   │
//! │                           │ CheckpointStore    │   │ AutoFollow       │   │
//! │                           │ (memory / SQLite)  │   │ (pattern poller) │   │
//! │                           └────────────────────┘   └──────────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each shard task loops: fetch leader operations after its leader
//! checkpoint, apply them to the follower shard, then advance the
//! `(leader, follower)` checkpoint pair. The index task owns its shard tasks
//! and turns their exits into index state transitions.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use index_replication::cluster::memory::InMemoryCluster;
//! use index_replication::{ReplicationConfig, ReplicationController, StartReplicationRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> index_replication::Result<()> {
//!     let cluster = Arc::new(InMemoryCluster::new());
//!     let controller =
//!         ReplicationController::open(ReplicationConfig::default(), Arc::clone(&cluster), cluster).await?;
//!
//!     controller
//!         .start("idx1f", StartReplicationRequest::new("source", "idx1"), true)
//!         .await?;
//!     println!("{:?}", controller.status("idx1f", true));
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod autofollow;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod settings;
pub mod stats;
pub mod status;
pub mod task_registry;

// Re-exports for convenience
pub use api::{AcknowledgedResponse, StartReplicationRequest, UseRoles};
pub use autofollow::{AutoFollowCoordinator, AutoFollowPattern};
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, ShardId, SqliteCheckpointStore};
pub use cluster::{FollowerCluster, LeaderCluster};
pub use config::{AutoFollowConfig, CheckpointConfig, IndexTaskConfig, ReplicationConfig, ShardTaskConfig};
pub use coordinator::{IndexReplicationState, ReplicationController, ShardReplicationState};
pub use error::{ReplicationError, Result};
pub use settings::IndexSettings;
pub use status::{ReplicationStatus, StatusKind};

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject failures and verify replication degrades gracefully.
//!
//! These tests verify the engine handles transient and permanent failures
//! without deadlocks or checkpoint corruption.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{eventually, TestHarness, ALIAS};
use index_replication::checkpoint::{CheckpointStore, ShardId, SqliteCheckpointStore};
use index_replication::cluster::memory::InMemoryCluster;
use index_replication::task_registry::SHARD_TASK_ACTION;
use index_replication::{
    IndexReplicationState, ReplicationConfig, ReplicationController, ShardReplicationState,
    StartReplicationRequest, StatusKind,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// =============================================================================
// Transient failures
// =============================================================================

/// Transient fetch failures are retried and the index never leaves SYNCING.
#[tokio::test]
async fn transient_fetch_failures_recover() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    // Fewer failures than the retry budget of a single shard
    h.cluster.fail_next_fetches(3);
    h.cluster.index_documents(ALIAS, "idx1", 20).await.unwrap();

    h.wait_caught_up("idx1f", "idx1", 2).await;
    assert_eq!(h.controller.index_state("idx1f"), Some(IndexReplicationState::Syncing));
    assert!(h.controller.follower_stats().failed_read_requests >= 3);

    h.shutdown().await;
}

/// Transient bulk rejections on the follower are retried the same way.
#[tokio::test]
async fn transient_apply_failures_recover() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    h.cluster.fail_next_applies(2);
    h.cluster.index_documents(ALIAS, "idx1", 10).await.unwrap();

    h.wait_caught_up("idx1f", "idx1", 1).await;
    h.wait_checkpoints_at_tip("idx1f", "idx1", 1).await;
    assert_eq!(h.cluster.follower_doc_count("idx1f").await, 10);
    assert!(h.controller.follower_stats().failed_write_requests >= 2);

    h.shutdown().await;
}

/// Once the retry budget is spent the shard fails; with no shard left the
/// index pauses and can be resumed after the fault clears.
#[tokio::test]
async fn retries_exhausted_pauses_index() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    h.cluster.fail_next_fetches(u32::MAX);
    h.wait_for_status("idx1f", StatusKind::Paused).await;
    let reason = h.controller.status("idx1f", false).reason.unwrap();
    assert!(reason.contains("retries exhausted"), "reason: {}", reason);

    h.cluster.fail_next_fetches(0);
    h.cluster.index_documents(ALIAS, "idx1", 5).await.unwrap();
    h.controller.resume("idx1f").await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 1).await;

    h.shutdown().await;
}

/// A shard that failed on an unavailable leader shard comes back on resume.
#[tokio::test]
async fn failed_shard_restarts_on_resume() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    h.cluster.set_shard_unavailable(ALIAS, "idx1", 0, true).await;
    let controller = Arc::clone(&h.controller);
    eventually("shard 0 to fail", || {
        let controller = Arc::clone(&controller);
        async move {
            controller
                .snapshot("idx1f")
                .map(|s| s.shards.iter().any(|sh| sh.shard == 0 && sh.state == ShardReplicationState::Failed))
                .unwrap_or(false)
        }
    })
    .await;
    assert_eq!(h.controller.tasks(SHARD_TASK_ACTION, Some("idx1f")).unwrap().len(), 1);

    h.cluster.set_shard_unavailable(ALIAS, "idx1", 0, false).await;
    h.controller.pause("idx1f", None).await.unwrap();
    h.controller.resume("idx1f").await.unwrap();
    assert_eq!(h.controller.tasks(SHARD_TASK_ACTION, Some("idx1f")).unwrap().len(), 2);

    h.cluster.index_documents(ALIAS, "idx1", 6).await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 2).await;

    h.shutdown().await;
}

// =============================================================================
// Throttling
// =============================================================================

/// A tight fetch bulkhead and rate limit slow replication down but lose nothing.
#[tokio::test]
async fn throttled_fetches_still_converge() {
    let mut config = ReplicationConfig::for_testing("throttled");
    config.shard.max_concurrent_fetches = 1;
    config.shard.fetch_rate_limit_enabled = true;
    config.shard.fetch_rate_limit_per_sec = 200;
    config.shard.fetch_rate_limit_burst = 5;
    config.shard.ops_batch_size = 3;

    let h = TestHarness::with_config(config).await;
    h.leader_index("idx1", 4, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    h.cluster.index_documents(ALIAS, "idx1", 40).await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 4).await;
    assert_eq!(h.cluster.follower_doc_count("idx1f").await, 40);

    h.shutdown().await;
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_indices_replicate_concurrently() {
    let h = TestHarness::new().await;
    for i in 0..8 {
        h.leader_index(&format!("idx{}", i), 2, 5).await;
    }

    let mut starts = Vec::new();
    for i in 0..8 {
        let controller = Arc::clone(&h.controller);
        starts.push(tokio::spawn(async move {
            controller
                .start(
                    &format!("idx{}f", i),
                    StartReplicationRequest::new(ALIAS, format!("idx{}", i)),
                    true,
                )
                .await
        }));
    }
    for start in starts {
        start.await.unwrap().unwrap();
    }

    for i in 0..8 {
        h.cluster.index_documents(ALIAS, &format!("idx{}", i), 10).await.unwrap();
    }
    for i in 0..8 {
        h.wait_caught_up(&format!("idx{}f", i), &format!("idx{}", i), 2).await;
    }

    assert_eq!(h.controller.replicated_indices().len(), 8);
    assert_eq!(h.controller.follower_stats().num_syncing_indices, 8);
    assert_eq!(h.controller.tasks(SHARD_TASK_ACTION, None).unwrap().len(), 16);

    h.shutdown().await;
}

/// Stopping while the restore is still running leaves nothing behind.
#[tokio::test]
async fn stop_during_restore() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 3, 50).await;

    h.controller
        .start("idx1f", StartReplicationRequest::new(ALIAS, "idx1"), false)
        .await
        .unwrap();
    h.controller.stop("idx1f").await.unwrap();

    assert_eq!(h.controller.status("idx1f", true).status, StatusKind::NotInProgress);
    assert!(h.tasks("idx1f").is_empty());
    for shard in 0..3 {
        assert_eq!(h.checkpoint("idx1f", shard).await, None);
    }

    h.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_every_task() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.leader_index("idx2", 3, 0).await;
    h.start_syncing("idx1f", "idx1").await;
    h.start_syncing("idx2f", "idx2").await;
    assert_eq!(h.controller.registry().len(), 7);

    h.controller.shutdown().await;
    assert!(h.controller.registry().is_empty());
    assert!(h.controller.is_shutdown());

    // Checkpoints survive shutdown
    assert!(h.checkpoint("idx1f", 0).await.is_some());
    assert!(h.checkpoint("idx2f", 2).await.is_some());

    // A second shutdown is a no-op
    h.controller.shutdown().await;
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn sqlite_checkpoints_survive_restart() {
    common::init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");

    let mut config = ReplicationConfig::for_testing("durable");
    config.checkpoint.sqlite_path = Some(path.to_string_lossy().into_owned());

    let cluster = Arc::new(InMemoryCluster::new());
    cluster.add_remote(ALIAS).await;
    cluster.create_leader_index(ALIAS, "idx1", 2).await;

    let controller = ReplicationController::open(config, Arc::clone(&cluster), Arc::clone(&cluster))
        .await
        .unwrap();
    controller
        .start("idx1f", StartReplicationRequest::new(ALIAS, "idx1"), true)
        .await
        .unwrap();
    cluster.index_documents(ALIAS, "idx1", 10).await.unwrap();

    let store = Arc::clone(controller.store());
    eventually("checkpoints to reach the leader tip", || {
        let store = Arc::clone(&store);
        async move {
            for shard in 0..2 {
                match store.get(&ShardId::new("idx1f", shard)).await {
                    Ok(Some(cp)) if cp.follower_checkpoint == 4 => {}
                    _ => return false,
                }
            }
            true
        }
    })
    .await;

    controller.shutdown().await;
    drop(store);
    drop(controller);

    let reopened = SqliteCheckpointStore::new(&path).await.unwrap();
    for shard in 0..2 {
        let cp = reopened.get(&ShardId::new("idx1f", shard)).await.unwrap().unwrap();
        assert_eq!(cp.leader_checkpoint, 4);
        assert_eq!(cp.follower_checkpoint, 4);
    }
    reopened.close().await.unwrap();
}

/// Regressing checkpoints are rejected by the store, whoever writes them.
#[tokio::test]
async fn checkpoint_regression_is_rejected() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 10).await;
    h.start_syncing("idx1f", "idx1").await;
    h.wait_checkpoints_at_tip("idx1f", "idx1", 1).await;

    let shard = ShardId::new("idx1f", 0);
    let current = h.checkpoint("idx1f", 0).await.unwrap();
    let stale = index_replication::Checkpoint::new(current.leader_checkpoint - 5, current.follower_checkpoint - 5);
    assert!(h.store.put(&shard, stale).await.is_err());
    assert_eq!(h.checkpoint("idx1f", 0).await, Some(current));

    // Replication keeps going from the stored checkpoint
    h.cluster.index_documents(ALIAS, "idx1", 3).await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.controller.status("idx1f", false).status, StatusKind::Syncing);

    h.shutdown().await;
}

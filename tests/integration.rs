// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the replication controller.
//!
//! Every test runs against the in-memory leader/follower cluster, so no
//! external services are needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # With logs
//! RUST_LOG=index_replication=debug cargo test --test integration -- --nocapture
//! ```
//!
//! # Test Organization
//! - `scenario_*` - end-to-end control flows (start, pause, leader deletion, stop)
//! - `resume_*`, `stop_*` - checkpoint continuity across control operations
//! - `kill_*` - task registry cancellation
//! - `update_*` - settings update policy
//! - `stats_*` - leader/follower statistics

mod common;

use common::{eventually, TestHarness, ALIAS};
use index_replication::error::{INDEX_CLOSED_MARKER, INDEX_NOT_FOUND_MARKER};
use index_replication::settings::{IndexSettings, NUMBER_OF_SHARDS, OPS_BATCH_SIZE};
use index_replication::task_registry::{INDEX_TASK_ACTION, SHARD_TASK_ACTION};
use index_replication::coordinator::{INDEX_TASK_CANCELLED, SHARD_TASK_KILLED, USER_INITIATED};
use index_replication::{
    IndexReplicationState, ReplicationError, ShardReplicationState, StartReplicationRequest, StatusKind,
};
use std::sync::Arc;

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_a_start_reaches_syncing() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 20).await;

    let ack = h
        .controller
        .start("idx1f", StartReplicationRequest::new(ALIAS, "idx1"), false)
        .await
        .unwrap();
    assert!(ack.is_acknowledged());

    h.wait_for_status("idx1f", StatusKind::Syncing).await;
    let status = h.controller.status("idx1f", false);
    assert_eq!(status.reason.as_deref(), Some(USER_INITIATED));
    assert_eq!(status.leader_alias.as_deref(), Some(ALIAS));
    assert_eq!(status.leader_index.as_deref(), Some("idx1"));
    assert_eq!(status.follower_index.as_deref(), Some("idx1f"));

    // New leader writes flow through the shard tasks
    h.cluster.index_documents(ALIAS, "idx1", 30).await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 2).await;
    assert_eq!(h.cluster.follower_doc_count("idx1f").await, 50);

    h.shutdown().await;
}

#[tokio::test]
async fn scenario_b_pause_hides_checkpoints() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 10).await;
    h.start_syncing("idx1f", "idx1").await;

    h.controller.pause("idx1f", None).await.unwrap();

    let json = h.status_json("idx1f", true);
    assert_eq!(json["status"], "PAUSED");
    assert_eq!(json["reason"], USER_INITIATED);
    for key in [
        "shard_replication_details",
        "syncing_details",
        "leader_checkpoint",
        "follower_checkpoint",
    ] {
        assert!(json.get(key).is_none(), "paused status carries {}", key);
    }

    // No shard tasks while paused
    assert!(h.controller.tasks(SHARD_TASK_ACTION, Some("idx1f")).unwrap().is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn scenario_c_leader_deleted_pauses_with_reason() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 10).await;
    h.start_syncing("idx1f", "idx1").await;

    assert!(h.cluster.delete_leader_index(ALIAS, "idx1").await);

    h.wait_for_status("idx1f", StatusKind::Paused).await;
    let status = h.controller.status("idx1f", false);
    assert!(status.reason.unwrap().contains(INDEX_NOT_FOUND_MARKER));
    assert_eq!(h.controller.index_state("idx1f"), Some(IndexReplicationState::Failed));

    // Resume cannot find the leader any more
    let err = h.controller.resume("idx1f").await.unwrap_err();
    assert!(matches!(err, ReplicationError::LeaderNotFound { .. }));

    h.shutdown().await;
}

#[tokio::test]
async fn scenario_d_stop_removes_tasks() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 10).await;
    h.start_syncing("idx1f", "idx1").await;

    let tasks = h.tasks("idx1f");
    assert_eq!(tasks.iter().filter(|t| t.action == INDEX_TASK_ACTION).count(), 1);
    assert_eq!(tasks.iter().filter(|t| t.action == SHARD_TASK_ACTION).count(), 2);

    h.controller.stop("idx1f").await.unwrap();

    let controller = Arc::clone(&h.controller);
    eventually("idx1f tasks to disappear", || {
        let controller = Arc::clone(&controller);
        async move { controller.tasks("*replication*", Some("idx1f")).unwrap().is_empty() }
    })
    .await;

    assert_eq!(h.controller.status("idx1f", true).status, StatusKind::NotInProgress);
    assert!(!h.controller.is_replicating("idx1f"));
    assert_eq!(h.checkpoint("idx1f", 0).await, None);
    assert_eq!(h.checkpoint("idx1f", 1).await, None);

    // Stopping twice is an error
    let err = h.controller.stop("idx1f").await.unwrap_err();
    assert!(matches!(err, ReplicationError::NotReplicating { .. }));

    h.shutdown().await;
}

#[tokio::test]
async fn scenario_e_pause_with_reason() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 5).await;
    h.start_syncing("idx1f", "idx1").await;

    h.controller
        .pause("idx1f", Some("maintenance".to_string()))
        .await
        .unwrap();

    let status = h.controller.status("idx1f", false);
    assert_eq!(status.status, StatusKind::Paused);
    assert_eq!(status.reason.as_deref(), Some("maintenance"));

    h.shutdown().await;
}

// =============================================================================
// Pause / resume / stop
// =============================================================================

#[tokio::test]
async fn pause_is_idempotent() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    assert!(h.controller.pause("idx1f", None).await.unwrap().is_acknowledged());
    assert!(h
        .controller
        .pause("idx1f", Some("again".to_string()))
        .await
        .unwrap()
        .is_acknowledged());

    // The first reason stays
    assert_eq!(h.controller.status("idx1f", false).reason.as_deref(), Some(USER_INITIATED));

    h.shutdown().await;
}

#[tokio::test]
async fn resume_continues_from_checkpoint() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    h.cluster.index_documents(ALIAS, "idx1", 20).await.unwrap();
    h.wait_checkpoints_at_tip("idx1f", "idx1", 2).await;

    h.controller.pause("idx1f", None).await.unwrap();
    let before = [h.checkpoint("idx1f", 0).await.unwrap(), h.checkpoint("idx1f", 1).await.unwrap()];

    // Writes while paused are not replicated
    h.cluster.index_documents(ALIAS, "idx1", 10).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.cluster.follower_doc_count("idx1f").await, 20);

    let err = h.controller.resume("idx1f").await;
    assert!(err.is_ok());
    assert_eq!(h.controller.index_state("idx1f"), Some(IndexReplicationState::Syncing));
    assert_eq!(h.controller.status("idx1f", false).reason.as_deref(), Some(USER_INITIATED));

    h.wait_caught_up("idx1f", "idx1", 2).await;
    h.wait_checkpoints_at_tip("idx1f", "idx1", 2).await;
    for (shard, before) in before.iter().enumerate() {
        let after = h.checkpoint("idx1f", shard as u32).await.unwrap();
        assert!(before.allows_advance_to(&after));
    }
    assert_eq!(h.cluster.follower_doc_count("idx1f").await, 30);

    h.shutdown().await;
}

#[tokio::test]
async fn resume_requires_paused() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    let err = h.controller.resume("idx1f").await.unwrap_err();
    match err {
        ReplicationError::TaskNotPaused { index, state } => {
            assert_eq!(index, "idx1f");
            assert_eq!(state, "SYNCING");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    h.shutdown().await;
}

#[tokio::test]
async fn stop_then_start_restores_fresh() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 10).await;
    h.start_syncing("idx1f", "idx1").await;
    h.cluster.index_documents(ALIAS, "idx1", 10).await.unwrap();
    h.wait_checkpoints_at_tip("idx1f", "idx1", 2).await;

    h.controller.stop("idx1f").await.unwrap();
    let tip_at_stop = h.cluster.leader_tip(ALIAS, "idx1", 0).await.unwrap();

    // Nothing advances the old checkpoints after stop
    h.cluster.index_documents(ALIAS, "idx1", 10).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(h.checkpoint("idx1f", 0).await, None);
    assert!(h.cluster.follower_max_seq_no("idx1f", 0).await.unwrap() <= tip_at_stop);

    h.start_syncing("idx1f", "idx1").await;
    h.wait_caught_up("idx1f", "idx1", 2).await;
    assert_eq!(h.cluster.follower_doc_count("idx1f").await, 30);

    h.shutdown().await;
}

#[tokio::test]
async fn start_on_replicating_index_is_rejected() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    let err = h
        .controller
        .start("idx1f", StartReplicationRequest::new(ALIAS, "idx1"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::AlreadyReplicating { .. }));

    // Paused still counts as replicating
    h.controller.pause("idx1f", None).await.unwrap();
    let err = h
        .controller
        .start("idx1f", StartReplicationRequest::new(ALIAS, "idx1"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::AlreadyReplicating { .. }));

    h.shutdown().await;
}

#[tokio::test]
async fn concurrent_control_calls_serialize() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let controller = Arc::clone(&h.controller);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                controller.pause("idx1f", None).await.map(|_| ())
            } else {
                controller.resume("idx1f").await.map(|_| ())
            }
        }));
    }
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) | Err(ReplicationError::TaskNotPaused { .. }) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    // Whatever the interleaving, the index is in a consistent state
    let state = h.controller.index_state("idx1f").unwrap();
    let shard_tasks = h.controller.tasks(SHARD_TASK_ACTION, Some("idx1f")).unwrap().len();
    match state {
        IndexReplicationState::Syncing => assert_eq!(shard_tasks, 2),
        IndexReplicationState::Paused => assert_eq!(shard_tasks, 0),
        other => panic!("unexpected state {}", other),
    }

    h.shutdown().await;
}

#[tokio::test]
async fn indices_replicate_independently() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 5).await;
    h.leader_index("idx2", 1, 5).await;
    h.start_syncing("idx1f", "idx1").await;
    h.start_syncing("idx2f", "idx2").await;

    h.controller.pause("idx1f", None).await.unwrap();
    h.cluster.index_documents(ALIAS, "idx2", 5).await.unwrap();
    h.wait_caught_up("idx2f", "idx2", 1).await;

    assert_eq!(h.controller.status("idx1f", false).status, StatusKind::Paused);
    assert_eq!(h.controller.status("idx2f", false).status, StatusKind::Syncing);
    assert_eq!(h.controller.replicated_indices(), vec!["idx1f".to_string(), "idx2f".to_string()]);

    h.shutdown().await;
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn status_verbose_lists_every_shard() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 3, 0).await;
    h.start_syncing("idx1f", "idx1").await;
    h.cluster.index_documents(ALIAS, "idx1", 30).await.unwrap();
    h.wait_checkpoints_at_tip("idx1f", "idx1", 3).await;

    let json = h.status_json("idx1f", true);
    assert_eq!(json["status"], "SYNCING");
    assert_eq!(json["reason"], USER_INITIATED);
    let details = json["shard_replication_details"].as_array().unwrap();
    assert_eq!(details.len(), 3);
    for (i, shard) in details.iter().enumerate() {
        assert_eq!(shard["shard_id"], i as u64);
        assert_eq!(shard["state"], "SYNCING");
        assert_eq!(shard["syncing_task_details"]["leader_checkpoint"], 9);
        assert_eq!(shard["syncing_task_details"]["follower_checkpoint"], 9);
    }

    let summary = h.status_json("idx1f", false);
    assert_eq!(summary["syncing_details"]["leader_checkpoint"], 9);
    assert!(summary.get("shard_replication_details").is_none());

    h.shutdown().await;
}

#[tokio::test]
async fn status_checkpoints_never_exceed_leader_tip() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    for _ in 0..20 {
        h.cluster.index_documents(ALIAS, "idx1", 7).await.unwrap();
        let snapshot = h.controller.snapshot("idx1f").unwrap();
        for shard in &snapshot.shards {
            let tip = h.cluster.leader_tip(ALIAS, "idx1", shard.shard).await.unwrap();
            assert!(shard.checkpoint.follower_checkpoint <= shard.checkpoint.leader_checkpoint);
            assert!(shard.checkpoint.leader_checkpoint <= tip);
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    h.shutdown().await;
}

#[tokio::test]
async fn status_while_bootstrapping() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;

    h.controller
        .start("idx1f", StartReplicationRequest::new(ALIAS, "idx1"), false)
        .await
        .unwrap();
    let status = h.controller.status("idx1f", true).status;
    assert!(status == StatusKind::Bootstrapping || status == StatusKind::Syncing);

    h.wait_for_status("idx1f", StatusKind::Syncing).await;
    h.shutdown().await;
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn closed_follower_fails_index() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 4).await;
    h.start_syncing("idx1f", "idx1").await;

    assert!(h.cluster.close_follower_index("idx1f").await);
    h.cluster.index_documents(ALIAS, "idx1", 4).await.unwrap();

    h.wait_for_status("idx1f", StatusKind::Paused).await;
    let status = h.controller.status("idx1f", false);
    assert!(status.reason.unwrap().contains(INDEX_CLOSED_MARKER));
    assert!(h.controller.tasks(SHARD_TASK_ACTION, Some("idx1f")).unwrap().is_empty());

    // Reopen and resume from the stored checkpoints
    h.cluster.open_follower_index("idx1f").await;
    h.controller.resume("idx1f").await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 2).await;
    assert_eq!(h.cluster.follower_doc_count("idx1f").await, 8);

    h.shutdown().await;
}

#[tokio::test]
async fn permanent_shard_failure_keeps_index_syncing() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    h.cluster.set_shard_unavailable(ALIAS, "idx1", 1, true).await;

    let controller = Arc::clone(&h.controller);
    eventually("shard 1 to fail", || {
        let controller = Arc::clone(&controller);
        async move {
            controller
                .snapshot("idx1f")
                .map(|s| s.shards.iter().any(|sh| sh.shard == 1 && sh.state == ShardReplicationState::Failed))
                .unwrap_or(false)
        }
    })
    .await;

    let json = h.status_json("idx1f", true);
    assert_eq!(json["status"], "SYNCING");
    assert_eq!(json["reason"], USER_INITIATED);
    let details = json["shard_replication_details"].as_array().unwrap();
    assert_eq!(details[0]["state"], "SYNCING");
    assert_eq!(details[1]["state"], "FAILED");
    assert!(details[1]["reason"].as_str().unwrap().contains("no active primary"));

    // Shard 0 keeps replicating
    h.cluster.index_documents(ALIAS, "idx1", 2).await.unwrap();
    let cluster = Arc::clone(&h.cluster);
    eventually("shard 0 to catch up", || {
        let cluster = Arc::clone(&cluster);
        async move { cluster.follower_max_seq_no("idx1f", 0).await == Some(0) }
    })
    .await;

    h.shutdown().await;
}

// =============================================================================
// Task registry kills
// =============================================================================

#[tokio::test]
async fn kill_shard_task_restarts_it() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    let killed = h.shard_task("idx1f", 0).unwrap();
    assert!(h.controller.cancel_task(killed.id));

    let controller = Arc::clone(&h.controller);
    eventually("shard 0 to be restarted", || {
        let controller = Arc::clone(&controller);
        async move {
            controller
                .tasks(SHARD_TASK_ACTION, Some("[idx1f][0]"))
                .unwrap()
                .iter()
                .any(|t| t.id != killed.id)
        }
    })
    .await;
    assert_eq!(h.controller.status("idx1f", false).status, StatusKind::Syncing);

    // The restarted shard picks up new writes
    h.cluster.index_documents(ALIAS, "idx1", 4).await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 2).await;

    h.shutdown().await;
}

#[tokio::test]
async fn kill_every_shard_task_pauses_index() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    let only = h.shard_task("idx1f", 0).unwrap();
    assert!(h.controller.cancel_task(only.id));

    h.wait_for_status("idx1f", StatusKind::Paused).await;
    assert_eq!(h.controller.status("idx1f", false).reason.as_deref(), Some(SHARD_TASK_KILLED));

    h.controller.resume("idx1f").await.unwrap();
    assert_eq!(h.controller.status("idx1f", false).status, StatusKind::Syncing);

    h.shutdown().await;
}

#[tokio::test]
async fn kill_index_task_fails_index() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    let index_task = h
        .controller
        .tasks(INDEX_TASK_ACTION, Some("idx1f"))
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert!(h.controller.cancel_task(index_task.id));

    h.wait_for_state("idx1f", IndexReplicationState::Failed).await;
    let status = h.controller.status("idx1f", false);
    assert_eq!(status.status, StatusKind::Paused);
    assert_eq!(status.reason.as_deref(), Some(INDEX_TASK_CANCELLED));
    assert!(h.tasks("idx1f").is_empty());

    h.controller.resume("idx1f").await.unwrap();
    assert_eq!(h.controller.index_state("idx1f"), Some(IndexReplicationState::Syncing));
    assert_eq!(h.tasks("idx1f").len(), 3);

    h.shutdown().await;
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test]
async fn update_in_place_keeps_shard_tasks() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;
    let before: Vec<u64> = h.tasks("idx1f").iter().map(|t| t.id).collect();

    h.controller
        .update("idx1f", IndexSettings::new().with("index.number_of_replicas", 2))
        .await
        .unwrap();

    let settings = h.cluster.follower_settings("idx1f").await.unwrap();
    assert_eq!(settings.get("index.number_of_replicas"), Some(&serde_json::json!(2)));
    let after: Vec<u64> = h.tasks("idx1f").iter().map(|t| t.id).collect();
    assert_eq!(before, after);

    h.shutdown().await;
}

#[tokio::test]
async fn update_batch_size_restarts_shard_tasks() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.start_syncing("idx1f", "idx1").await;
    let before = h.shard_task("idx1f", 0).unwrap().id;

    h.controller
        .update("idx1f", IndexSettings::new().with(OPS_BATCH_SIZE, 2))
        .await
        .unwrap();

    let after = h.shard_task("idx1f", 0).unwrap().id;
    assert_ne!(before, after);
    assert_eq!(h.controller.status("idx1f", false).status, StatusKind::Syncing);

    // Small batches still replicate everything
    h.cluster.index_documents(ALIAS, "idx1", 20).await.unwrap();
    h.wait_caught_up("idx1f", "idx1", 2).await;

    h.shutdown().await;
}

#[tokio::test]
async fn update_rejects_shard_count() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;

    let err = h
        .controller
        .update("idx1f", IndexSettings::new().with(NUMBER_OF_SHARDS, 4))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Config(_)));
    assert_eq!(h.controller.status("idx1f", false).status, StatusKind::Syncing);

    h.shutdown().await;
}

// =============================================================================
// Stats
// =============================================================================

#[tokio::test]
async fn stats_follow_replicated_operations() {
    let h = TestHarness::new().await;
    h.leader_index("idx1", 2, 0).await;
    h.leader_index("idx2", 1, 0).await;
    h.start_syncing("idx1f", "idx1").await;
    h.start_syncing("idx2f", "idx2").await;
    h.controller.pause("idx2f", None).await.unwrap();

    h.cluster.index_documents(ALIAS, "idx1", 10).await.unwrap();
    h.wait_checkpoints_at_tip("idx1f", "idx1", 2).await;

    let follower = h.controller.follower_stats();
    assert_eq!(follower.num_syncing_indices, 1);
    assert_eq!(follower.num_paused_indices, 1);
    assert_eq!(follower.num_shard_tasks, 2);
    assert_eq!(follower.operations_written, 10);
    assert_eq!(follower.index_stats["idx1f"].leader_checkpoint, 4);

    let leader = h.controller.leader_stats();
    assert_eq!(leader.num_replicated_indices, 2);
    assert_eq!(leader.index_stats["source:idx1"].operations_read, 10);
    assert!(leader.index_stats["source:idx1"].bytes_read > 0);

    h.shutdown().await;
}

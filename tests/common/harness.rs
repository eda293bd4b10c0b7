#![allow(dead_code)]

use index_replication::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, ShardId};
use index_replication::cluster::memory::InMemoryCluster;
use index_replication::task_registry::{TaskInfo, SHARD_TASK_ACTION};
use index_replication::{
    IndexReplicationState, ReplicationConfig, ReplicationController, StartReplicationRequest, StatusKind,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const ALIAS: &str = "source";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

pub type Controller = ReplicationController<InMemoryCluster, InMemoryCluster>;

/// Install a fmt subscriber once per test binary; `RUST_LOG` controls output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A controller over one in-memory cluster acting as leader and follower.
pub struct TestHarness {
    pub cluster: Arc<InMemoryCluster>,
    pub controller: Arc<Controller>,
    pub store: Arc<MemoryCheckpointStore>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(ReplicationConfig::for_testing("test-node")).await
    }

    pub async fn with_config(config: ReplicationConfig) -> Self {
        init_tracing();
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_remote(ALIAS).await;
        let store = Arc::new(MemoryCheckpointStore::new());
        let controller = Arc::new(ReplicationController::with_store(
            config,
            Arc::clone(&cluster),
            Arc::clone(&cluster),
            store.clone() as Arc<dyn CheckpointStore>,
        ));
        Self {
            cluster,
            controller,
            store,
        }
    }

    /// Create a leader index with `docs` documents.
    pub async fn leader_index(&self, index: &str, shards: u32, docs: usize) {
        self.cluster.create_leader_index(ALIAS, index, shards).await;
        if docs > 0 {
            self.cluster.index_documents(ALIAS, index, docs).await.unwrap();
        }
    }

    /// Start replication and wait until the index is SYNCING.
    pub async fn start_syncing(&self, follower: &str, leader: &str) {
        self.controller
            .start(follower, StartReplicationRequest::new(ALIAS, leader), true)
            .await
            .unwrap();
        self.wait_for_state(follower, IndexReplicationState::Syncing).await;
    }

    pub async fn wait_for_state(&self, follower: &str, state: IndexReplicationState) {
        let controller = Arc::clone(&self.controller);
        let follower = follower.to_string();
        eventually(&format!("{} to reach {}", follower, state), || {
            let controller = Arc::clone(&controller);
            let follower = follower.clone();
            async move { controller.index_state(&follower) == Some(state) }
        })
        .await;
    }

    pub async fn wait_for_status(&self, follower: &str, status: StatusKind) {
        let controller = Arc::clone(&self.controller);
        let follower = follower.to_string();
        eventually(&format!("{} status {:?}", follower, status), || {
            let controller = Arc::clone(&controller);
            let follower = follower.clone();
            async move { controller.status(&follower, false).status == status }
        })
        .await;
    }

    /// Wait until every shard of `follower` has applied the leader's tip.
    pub async fn wait_caught_up(&self, follower: &str, leader: &str, shards: u32) {
        let cluster = Arc::clone(&self.cluster);
        let (follower, leader) = (follower.to_string(), leader.to_string());
        eventually(&format!("{} to catch up with {}", follower, leader), || {
            let cluster = Arc::clone(&cluster);
            let (follower, leader) = (follower.clone(), leader.clone());
            async move {
                for shard in 0..shards {
                    let tip = cluster.leader_tip(ALIAS, &leader, shard).await;
                    let applied = cluster.follower_max_seq_no(&follower, shard).await;
                    if tip.is_none() || tip != applied {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }

    /// Wait until the stored checkpoint of every shard reaches the leader tip.
    pub async fn wait_checkpoints_at_tip(&self, follower: &str, leader: &str, shards: u32) {
        for shard in 0..shards {
            let tip = self.cluster.leader_tip(ALIAS, leader, shard).await.unwrap();
            let store = Arc::clone(&self.store);
            let id = ShardId::new(follower, shard);
            eventually(&format!("checkpoint of {} to reach {}", id, tip), || {
                let store = Arc::clone(&store);
                let id = id.clone();
                async move {
                    matches!(
                        store.get(&id).await,
                        Ok(Some(cp)) if cp.leader_checkpoint == tip && cp.follower_checkpoint == tip
                    )
                }
            })
            .await;
        }
    }

    pub async fn checkpoint(&self, follower: &str, shard: u32) -> Option<Checkpoint> {
        self.store.get(&ShardId::new(follower, shard)).await.unwrap()
    }

    /// Registered tasks whose description mentions `filter`.
    pub fn tasks(&self, filter: &str) -> Vec<TaskInfo> {
        self.controller.tasks("*replication*", Some(filter)).unwrap()
    }

    /// The registered shard task of `[follower][shard]`.
    pub fn shard_task(&self, follower: &str, shard: u32) -> Option<TaskInfo> {
        let filter = format!("[{}][{}]", follower, shard);
        self.controller
            .tasks(SHARD_TASK_ACTION, Some(&filter))
            .unwrap()
            .into_iter()
            .next()
    }

    pub fn status_json(&self, follower: &str, verbose: bool) -> serde_json::Value {
        serde_json::to_value(self.controller.status(follower, verbose)).unwrap()
    }

    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
    }
}

/// Poll `check` every 10ms until it returns true, panicking after [`WAIT`].
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(WAIT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

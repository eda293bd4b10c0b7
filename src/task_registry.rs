//! In-process task registry.
//!
//! Every running index task and shard task registers itself here under an
//! action name and a human-readable description. Operators (and tests) list
//! tasks by action glob and description substring, and can cancel a task by
//! id, which trips the task's [`CancellationToken`] exactly as a cluster-level
//! task kill would.
//!
//! ```text
//! id  action                                  description
//! 1   cluster:indices/admin/replication[c]    replication:source:[idx1] -> idx1f
//! 2   cluster:indices/shards/replication[c]   replication:source:[idx1][0] -> [idx1f][0]
//! 3   cluster:indices/shards/replication[c]   replication:source:[idx1][1] -> [idx1f][1]
//! ```
//!
//! Registration returns a [`RegisteredTask`] guard; dropping it removes the
//! entry, so a task disappears from listings as soon as it exits.

use crate::error::{ReplicationError, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Action name of index-level replication tasks.
pub const INDEX_TASK_ACTION: &str = "cluster:indices/admin/replication[c]";

/// Action name of shard-level replication tasks.
pub const SHARD_TASK_ACTION: &str = "cluster:indices/shards/replication[c]";

/// Description of an index task.
pub fn index_task_description(alias: &str, leader_index: &str, follower_index: &str) -> String {
    format!("replication:{}:[{}] -> {}", alias, leader_index, follower_index)
}

/// Description of a shard task.
pub fn shard_task_description(alias: &str, leader_index: &str, follower_index: &str, shard: u32) -> String {
    format!(
        "replication:{}:[{}][{}] -> [{}][{}]",
        alias, leader_index, shard, follower_index, shard
    )
}

/// Listing entry for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: u64,
    pub action: String,
    pub description: String,
    pub start_time_ms: i64,
    pub cancellable: bool,
}

struct Entry {
    info: TaskInfo,
    token: CancellationToken,
}

/// Registry of live replication tasks.
#[derive(Default)]
pub struct TaskRegistry {
    next_id: AtomicU64,
    tasks: DashMap<u64, Entry>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a running task. `token` is cancelled by [`TaskRegistry::cancel`].
    pub fn register(
        self: &Arc<Self>,
        action: &str,
        description: String,
        token: CancellationToken,
    ) -> RegisteredTask {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = TaskInfo {
            id,
            action: action.to_string(),
            description,
            start_time_ms: chrono::Utc::now().timestamp_millis(),
            cancellable: true,
        };
        debug!(task_id = id, action, description = %info.description, "Registered task");
        self.tasks.insert(
            id,
            Entry {
                info,
                token: token.clone(),
            },
        );
        RegisteredTask {
            id,
            registry: Arc::clone(self),
            token,
        }
    }

    /// List tasks whose action equals or matches `action_glob` and whose
    /// description contains `description_filter` (if given), ordered by id.
    ///
    /// Action names end in `[c]`, which a glob reads as a character class,
    /// hence the exact comparison.
    pub fn list(&self, action_glob: &str, description_filter: Option<&str>) -> Result<Vec<TaskInfo>> {
        let pattern = glob::Pattern::new(action_glob)
            .map_err(|e| ReplicationError::Config(format!("invalid action pattern {:?}: {}", action_glob, e)))?;

        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .iter()
            .filter(|e| e.info.action == action_glob || pattern.matches(&e.info.action))
            .filter(|e| description_filter.map_or(true, |f| e.info.description.contains(f)))
            .map(|e| e.info.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    /// Cancel a task by id. Returns `false` if no such task is registered.
    pub fn cancel(&self, id: u64) -> bool {
        match self.tasks.get(&id) {
            Some(entry) => {
                info!(task_id = id, description = %entry.info.description, "Cancelling task");
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Registration guard. The task stays listed while this is alive.
#[derive(Debug)]
pub struct RegisteredTask {
    id: u64,
    registry: Arc<TaskRegistry>,
    token: CancellationToken,
}

impl RegisteredTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token tripped when the task is cancelled through the registry.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RegisteredTask {
    fn drop(&mut self) {
        self.registry.tasks.remove(&self.id);
    }
}

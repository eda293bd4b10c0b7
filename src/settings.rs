//! Follower index settings and the `update` policy table.
//!
//! Settings are a flat map of dotted keys to JSON values. Nested documents
//! (`{"index": {"number_of_replicas": 1}}`) are flattened on the way in, so
//! both request shapes address the same key.
//!
//! Every key falls under one [`UpdatePolicy`]:
//!
//! | Key | Policy |
//! |-----|--------|
//! | `plugins.replication.follower.index.ops_batch_size` | `RestartShardTasks` |
//! | `plugins.replication.follower.index.poll_interval` | `RestartShardTasks` |
//! | `index.number_of_shards` | `Rejected` |
//! | anything else | `ApplyInPlace` |
//!
//! Keys under `RestartShardTasks` are read by shard tasks at spawn time; the
//! rest are forwarded to the follower cluster without touching shard tasks.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-index override of the shard fetch batch size.
pub const OPS_BATCH_SIZE: &str = "plugins.replication.follower.index.ops_batch_size";

/// Per-index override of the shard idle poll interval.
pub const POLL_INTERVAL: &str = "plugins.replication.follower.index.poll_interval";

/// Shard count of the follower is fixed by the leader.
pub const NUMBER_OF_SHARDS: &str = "index.number_of_shards";

/// How a changed setting is applied to a running replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Forward to the follower cluster, shard tasks keep running.
    ApplyInPlace,
    /// Shard tasks are cancelled and re-spawned from their checkpoints.
    RestartShardTasks,
    /// The setting cannot be changed on a follower index.
    Rejected,
}

/// Policy for a single settings key.
pub fn policy_for(key: &str) -> UpdatePolicy {
    match key {
        OPS_BATCH_SIZE | POLL_INTERVAL => UpdatePolicy::RestartShardTasks,
        NUMBER_OF_SHARDS => UpdatePolicy::Rejected,
        _ => UpdatePolicy::ApplyInPlace,
    }
}

/// Flat settings document for a follower index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IndexSettings(BTreeMap<String, Value>);

impl<'de> Deserialize<'de> for IndexSettings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        let mut flat = BTreeMap::new();
        flatten_into("", map, &mut flat);
        Ok(Self(flat))
    }
}

fn flatten_into(prefix: &str, map: Map<String, Value>, out: &mut BTreeMap<String, Value>) {
    for (key, value) in map {
        let full = if prefix.is_empty() {
            key
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(inner) => flatten_into(&full, inner, out),
            other => {
                out.insert(full, other);
            }
        }
    }
}

impl IndexSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Overlay `other` on top of `self`. Keys set to `null` are removed.
    pub fn merge(&mut self, other: &IndexSettings) {
        for (key, value) in &other.0 {
            if value.is_null() {
                self.0.remove(key);
            } else {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }

    /// Fetch batch size override. Accepts numbers and numeric strings.
    pub fn ops_batch_size(&self) -> Result<Option<usize>> {
        let Some(value) = self.0.get(OPS_BATCH_SIZE) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.parse::<usize>().ok(),
            _ => None,
        };
        match parsed {
            Some(n) if n > 0 => Ok(Some(n)),
            _ => Err(ReplicationError::Config(format!(
                "{} must be a positive integer, got {}",
                OPS_BATCH_SIZE, value
            ))),
        }
    }

    /// Idle poll interval override, as a humantime string.
    pub fn poll_interval(&self) -> Result<Option<Duration>> {
        let Some(value) = self.0.get(POLL_INTERVAL) else {
            return Ok(None);
        };
        value
            .as_str()
            .and_then(|s| humantime::parse_duration(s).ok())
            .map(Some)
            .ok_or_else(|| {
                ReplicationError::Config(format!("{} must be a duration string, got {}", POLL_INTERVAL, value))
            })
    }

    /// Check every key for `Rejected` and the typed keys for parse errors.
    pub fn validate(&self) -> Result<()> {
        for key in self.0.keys() {
            if policy_for(key) == UpdatePolicy::Rejected {
                return Err(ReplicationError::Config(format!(
                    "setting [{}] cannot be changed on a follower index",
                    key
                )));
            }
        }
        self.ops_batch_size()?;
        self.poll_interval()?;
        Ok(())
    }

    /// Decide how to apply `update` against the current settings.
    pub fn plan_update(&self, update: &IndexSettings) -> Result<UpdatePlan> {
        update.validate()?;

        let mut plan = UpdatePlan::default();
        for (key, value) in &update.0 {
            if self.0.get(key) == Some(value) {
                continue;
            }
            match policy_for(key) {
                UpdatePolicy::RestartShardTasks => plan.restart_shard_tasks = true,
                UpdatePolicy::ApplyInPlace => plan.in_place.push(key.clone()),
                UpdatePolicy::Rejected => {}
            }
            plan.changed.push(key.clone());
        }
        Ok(plan)
    }
}

/// Result of [`IndexSettings::plan_update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Every key whose value differs from the current settings.
    pub changed: Vec<String>,
    /// Keys forwarded to the follower cluster.
    pub in_place: Vec<String>,
    /// At least one changed key requires a shard task restart.
    pub restart_shard_tasks: bool,
}

impl UpdatePlan {
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

//! Auto-follow: start replication for newly created leader indices that
//! match a registered pattern.
//!
//! Patterns are keyed by `(leader_alias, name)` and matched with shell-style
//! globs (`logs-*`). Each poll lists the leader indices of every alias with
//! a pattern and starts replication for matches it has not handled yet. The
//! follower index takes the leader index name.
//!
//! An index is handled once replication was started for it (or it was
//! already replicating). Handled indices are not started again, so a user
//! `stop` is not undone by the next poll. A handled index that disappears
//! from the leader is forgotten, so recreating it under the same name
//! follows it again. Hidden indices (leading `.`) are never followed.

use crate::api::{AcknowledgedResponse, AutoFollowRequest, DeleteAutoFollowRequest, StartReplicationRequest, UseRoles};
use crate::cluster::{FollowerCluster, LeaderCluster};
use crate::config::AutoFollowConfig;
use crate::coordinator::ReplicationController;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::settings::IndexSettings;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A registered auto-follow rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFollowPattern {
    pub name: String,
    pub leader_alias: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_roles: Option<UseRoles>,
    #[serde(default, skip_serializing_if = "IndexSettings::is_empty")]
    pub settings: IndexSettings,
}

impl From<AutoFollowRequest> for AutoFollowPattern {
    fn from(req: AutoFollowRequest) -> Self {
        Self {
            name: req.name,
            leader_alias: req.leader_alias,
            pattern: req.pattern,
            use_roles: req.use_roles,
            settings: req.settings,
        }
    }
}

/// Pattern store with compiled globs.
#[derive(Debug, Default)]
pub struct AutoFollowRegistry {
    patterns: DashMap<(String, String), (AutoFollowPattern, glob::Pattern)>,
}

impl AutoFollowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a pattern. Fails with `Config` if the glob is invalid.
    pub fn upsert(&self, pattern: AutoFollowPattern) -> Result<()> {
        pattern.settings.validate()?;
        let compiled = glob::Pattern::new(&pattern.pattern).map_err(|e| {
            ReplicationError::Config(format!("invalid auto-follow pattern {:?}: {}", pattern.pattern, e))
        })?;
        let key = (pattern.leader_alias.clone(), pattern.name.clone());
        self.patterns.insert(key, (pattern, compiled));
        Ok(())
    }

    /// Remove a pattern. Fails with `PatternNotFound` if it does not exist.
    pub fn remove(&self, leader_alias: &str, name: &str) -> Result<AutoFollowPattern> {
        self.patterns
            .remove(&(leader_alias.to_string(), name.to_string()))
            .map(|(_, (pattern, _))| pattern)
            .ok_or_else(|| ReplicationError::PatternNotFound {
                alias: leader_alias.to_string(),
                name: name.to_string(),
            })
    }

    /// All patterns, ordered by alias then name.
    pub fn list(&self) -> Vec<AutoFollowPattern> {
        let mut patterns: Vec<AutoFollowPattern> = self.patterns.iter().map(|e| e.value().0.clone()).collect();
        patterns.sort_by(|a, b| (&a.leader_alias, &a.name).cmp(&(&b.leader_alias, &b.name)));
        patterns
    }

    /// Aliases with at least one pattern.
    pub fn aliases(&self) -> BTreeSet<String> {
        self.patterns.iter().map(|e| e.key().0.clone()).collect()
    }

    /// First pattern (by name) of `leader_alias` matching `index`.
    pub fn matching(&self, leader_alias: &str, index: &str) -> Option<AutoFollowPattern> {
        let mut matches: Vec<AutoFollowPattern> = self
            .patterns
            .iter()
            .filter(|e| e.key().0 == leader_alias && e.value().1.matches(index))
            .map(|e| e.value().0.clone())
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches.into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoFollowRun {
    /// Follower indices for which replication was started.
    pub started: Vec<String>,
    /// `(alias, leader index, error)` for starts that failed; retried next poll.
    pub failed: Vec<(String, String, String)>,
}

/// Periodic discovery driving [`ReplicationController::start`].
pub struct AutoFollowCoordinator<L: LeaderCluster, F: FollowerCluster> {
    controller: Arc<ReplicationController<L, F>>,
    registry: AutoFollowRegistry,
    /// `(alias, leader index)` pairs already started or found replicating.
    handled: DashSet<(String, String)>,
}

impl<L: LeaderCluster, F: FollowerCluster> AutoFollowCoordinator<L, F> {
    pub fn new(controller: Arc<ReplicationController<L, F>>) -> Self {
        Self {
            controller,
            registry: AutoFollowRegistry::new(),
            handled: DashSet::new(),
        }
    }

    pub fn registry(&self) -> &AutoFollowRegistry {
        &self.registry
    }

    /// Handle the auto-follow upsert request.
    pub fn upsert(&self, request: AutoFollowRequest) -> Result<AcknowledgedResponse> {
        let pattern = AutoFollowPattern::from(request);
        info!(
            alias = %pattern.leader_alias,
            name = %pattern.name,
            pattern = %pattern.pattern,
            "Upserting auto-follow pattern"
        );
        let result = self.registry.upsert(pattern);
        metrics::record_control_op("autofollow_upsert", result.is_ok());
        result.map(|()| AcknowledgedResponse::ACK)
    }

    /// Handle the auto-follow delete request. Indices already replicating
    /// keep replicating.
    pub fn delete(&self, request: DeleteAutoFollowRequest) -> Result<AcknowledgedResponse> {
        let result = self.registry.remove(&request.leader_alias, &request.name);
        metrics::record_control_op("autofollow_delete", result.is_ok());
        let removed = result?;
        info!(alias = %removed.leader_alias, name = %removed.name, "Deleted auto-follow pattern");
        Ok(AcknowledgedResponse::ACK)
    }

    /// One discovery pass over every alias with a pattern.
    pub async fn poll_once(&self) -> AutoFollowRun {
        let mut run = AutoFollowRun::default();

        for alias in self.registry.aliases() {
            let indices = match self.controller.leader().list_indices(&alias).await {
                Ok(indices) => indices,
                Err(e) => {
                    warn!(alias = %alias, error = %e, "Failed to list leader indices");
                    metrics::record_autofollow_poll(&alias, 0, 1);
                    continue;
                }
            };

            let present: HashSet<&str> = indices.iter().map(String::as_str).collect();
            self.handled
                .retain(|(handled_alias, index)| handled_alias != &alias || present.contains(index.as_str()));

            let (mut started, mut failed) = (0usize, 0usize);
            for index in indices {
                if index.starts_with('.') {
                    continue;
                }
                let key = (alias.clone(), index.clone());
                if self.handled.contains(&key) {
                    continue;
                }
                let Some(pattern) = self.registry.matching(&alias, &index) else {
                    continue;
                };
                if self.controller.is_replicating(&index) {
                    self.handled.insert(key);
                    continue;
                }

                let request = StartReplicationRequest {
                    leader_alias: alias.clone(),
                    leader_index: index.clone(),
                    use_roles: pattern.use_roles.clone(),
                    settings: pattern.settings.clone(),
                };
                match self.controller.start(&index, request, false).await {
                    Ok(_) => {
                        info!(
                            alias = %alias,
                            index = %index,
                            pattern = %pattern.name,
                            "Auto-follow started replication"
                        );
                        self.handled.insert(key);
                        run.started.push(index);
                        started += 1;
                    }
                    Err(ReplicationError::AlreadyReplicating { .. }) => {
                        debug!(alias = %alias, index = %index, "Already replicating");
                        self.handled.insert(key);
                    }
                    Err(e) => {
                        warn!(alias = %alias, index = %index, error = %e, "Auto-follow start failed");
                        run.failed.push((alias.clone(), index, e.to_string()));
                        failed += 1;
                    }
                }
            }
            metrics::record_autofollow_poll(&alias, started, failed);
        }
        run
    }

    /// Poll until `shutdown` is cancelled. The poll interval and the
    /// enabled flag are re-read whenever `config_rx` changes.
    pub async fn run(self: Arc<Self>, mut config_rx: watch::Receiver<AutoFollowConfig>, shutdown: CancellationToken) {
        let mut config = config_rx.borrow_and_update().clone();
        let mut timer = tokio::time::interval(config.poll_interval_duration());
        info!(enabled = config.enabled, poll_interval = %config.poll_interval, "Auto-follow task started");

        let mut config_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                changed = config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        // Sender gone: keep the last config
                        config_open = false;
                        continue;
                    }
                    config = config_rx.borrow_and_update().clone();
                    timer = tokio::time::interval(config.poll_interval_duration());
                    info!(
                        enabled = config.enabled,
                        poll_interval = %config.poll_interval,
                        "Auto-follow config updated"
                    );
                }

                _ = timer.tick() => {
                    if !config.enabled || self.registry.is_empty() || self.controller.is_shutdown() {
                        continue;
                    }
                    let run = self.poll_once().await;
                    if !run.started.is_empty() || !run.failed.is_empty() {
                        debug!(started = run.started.len(), failed = run.failed.len(), "Auto-follow poll finished");
                    }
                }
            }
        }
        info!("Auto-follow task stopped");
    }
}

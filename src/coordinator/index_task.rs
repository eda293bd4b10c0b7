//! Index task: the supervisor of one follower index.
//!
//! The index task owns the restore of the follower index, the shard tasks,
//! and the index state machine. It is driven by a single `select!` loop over:
//!
//! - control commands from the controller (pause/resume/update/stop)
//! - its own registry token (external kill of the index task)
//! - the restore (bootstrap) task while STARTING
//! - shard task exits
//! - the next pending shard restart
//!
//! State is published on a `watch` channel as an [`IndexStatusCell`] so
//! status readers never touch the task itself.

use super::shard_task::{run_shard_task, ShardTaskContext, ShardTaskParams};
use super::types::{
    IndexReplicationState, IndexSnapshot, IndexStatusCell, ShardExit, ShardSnapshot, INDEX_TASK_CANCELLED,
    SHARD_TASK_KILLED, USER_INITIATED,
};
use crate::api::UseRoles;
use crate::checkpoint::{Checkpoint, CheckpointStore, ShardId};
use crate::cluster::{FollowerCluster, LeaderCluster, LeaderIndexMetadata};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{Bulkhead, FetchThrottle};
use crate::settings::IndexSettings;
use crate::stats::IndexCounters;
use crate::task_registry::{
    index_task_description, shard_task_description, RegisteredTask, TaskRegistry, INDEX_TASK_ACTION,
    SHARD_TASK_ACTION,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Control commands accepted by a running index task.
#[derive(Debug)]
pub(crate) enum IndexCommand {
    Pause {
        reason: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Resume {
        ack: oneshot::Sender<Result<()>>,
    },
    Update {
        settings: IndexSettings,
        ack: oneshot::Sender<Result<()>>,
    },
    Stop {
        ack: oneshot::Sender<Result<()>>,
    },
    /// Engine shutdown: drain shard tasks, keep checkpoints, exit.
    Shutdown,
}

/// Read side of an index task: everything status and stats need.
#[derive(Debug, Clone)]
pub(crate) struct IndexView {
    pub leader_alias: String,
    pub leader_index: String,
    pub follower_index: String,
    pub use_roles: Option<UseRoles>,
    pub status_rx: watch::Receiver<IndexStatusCell>,
    pub counters: Arc<IndexCounters>,
}

impl IndexView {
    pub fn state(&self) -> IndexReplicationState {
        self.status_rx.borrow().state
    }

    /// Copy-on-read snapshot of the index and its shards.
    pub fn snapshot(&self) -> IndexSnapshot {
        let cell = self.status_rx.borrow().clone();
        IndexSnapshot {
            leader_alias: self.leader_alias.clone(),
            leader_index: self.leader_index.clone(),
            follower_index: self.follower_index.clone(),
            state: cell.state,
            reason: cell.reason.clone(),
            use_roles: self.use_roles.clone(),
            shards: cell.shard_snapshots(),
        }
    }
}

/// Owner side of an index task, held by the controller.
#[derive(Debug)]
pub(crate) struct IndexTaskHandle {
    pub commands: mpsc::Sender<IndexCommand>,
    pub view: IndexView,
    pub join: JoinHandle<()>,
}

impl IndexTaskHandle {
    /// Send a command and wait for its acknowledgement.
    pub async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> IndexCommand,
    {
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(make(ack))
            .await
            .map_err(|_| ReplicationError::NotReplicating {
                index: self.view.follower_index.clone(),
            })?;
        rx.await.map_err(|_| ReplicationError::NotReplicating {
            index: self.view.follower_index.clone(),
        })?
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Engine-wide collaborators shared by every index task.
pub(crate) struct IndexTaskDeps<L: LeaderCluster, F: FollowerCluster> {
    pub config: Arc<ReplicationConfig>,
    pub leader: Arc<L>,
    pub follower: Arc<F>,
    pub store: Arc<dyn CheckpointStore>,
    pub registry: Arc<TaskRegistry>,
    pub bulkhead: Arc<Bulkhead>,
    pub throttle: Option<Arc<FetchThrottle>>,
    /// Engine root token; index tokens are its children.
    pub root: CancellationToken,
}

impl<L: LeaderCluster, F: FollowerCluster> Clone for IndexTaskDeps<L, F> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            leader: Arc::clone(&self.leader),
            follower: Arc::clone(&self.follower),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            bulkhead: Arc::clone(&self.bulkhead),
            throttle: self.throttle.clone(),
            root: self.root.clone(),
        }
    }
}

/// What the index task replicates.
#[derive(Debug, Clone)]
pub(crate) struct IndexTaskSpec {
    pub leader_alias: String,
    pub leader: LeaderIndexMetadata,
    pub follower_index: String,
    pub use_roles: Option<UseRoles>,
    pub settings: IndexSettings,
}

/// Spawn an index task in STARTING; the restore begins immediately.
pub(crate) fn spawn_index_task<L: LeaderCluster, F: FollowerCluster>(
    deps: IndexTaskDeps<L, F>,
    spec: IndexTaskSpec,
) -> IndexTaskHandle {
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(IndexStatusCell::new(IndexReplicationState::Starting, None));
    let counters = Arc::new(IndexCounters::default());

    let view = IndexView {
        leader_alias: spec.leader_alias.clone(),
        leader_index: spec.leader.name.clone(),
        follower_index: spec.follower_index.clone(),
        use_roles: spec.use_roles.clone(),
        status_rx,
        counters: Arc::clone(&counters),
    };

    let span = info_span!("index_task", follower_index = %spec.follower_index, leader_index = %spec.leader.name);
    let mut task = IndexTask {
        deps,
        spec,
        counters,
        status_tx,
        state: IndexReplicationState::Starting,
        registration: None,
        bootstrapped: false,
        bootstrap: None,
        shards: JoinSet::new(),
        shard_cancels: BTreeMap::new(),
        pending_restarts: BTreeMap::new(),
        last_exit_reason: None,
    };
    task.register();
    task.start_bootstrap();

    let join = tokio::spawn(task.run(commands_rx).instrument(span));
    IndexTaskHandle {
        commands: commands_tx,
        view,
        join,
    }
}

struct IndexTask<L: LeaderCluster, F: FollowerCluster> {
    deps: IndexTaskDeps<L, F>,
    spec: IndexTaskSpec,
    counters: Arc<IndexCounters>,
    status_tx: watch::Sender<IndexStatusCell>,
    state: IndexReplicationState,
    /// Present while STARTING or SYNCING.
    registration: Option<RegisteredTask>,
    /// The follower index was restored and initial checkpoints written.
    bootstrapped: bool,
    bootstrap: Option<JoinHandle<Result<()>>>,
    shards: JoinSet<(u32, ShardExit)>,
    shard_cancels: BTreeMap<u32, watch::Sender<Option<String>>>,
    pending_restarts: BTreeMap<u32, Instant>,
    last_exit_reason: Option<String>,
}

/// Restore the follower index and write the initial checkpoints.
async fn bootstrap<F: FollowerCluster>(
    follower: Arc<F>,
    store: Arc<dyn CheckpointStore>,
    spec: IndexTaskSpec,
) -> Result<()> {
    let removed = store.delete_index(&spec.follower_index).await?;
    if removed > 0 {
        debug!(removed, "Dropped stale checkpoints before restore");
    }

    let checkpoints = follower
        .bootstrap_index(&spec.leader_alias, &spec.leader, &spec.follower_index, &spec.settings)
        .await
        .map_err(|e| ReplicationError::from_bootstrap(&spec.leader.name, e))?;

    if checkpoints.len() != spec.leader.number_of_shards as usize {
        return Err(ReplicationError::Internal(format!(
            "restored follower index [{}] has {} shards, leader [{}] has {}",
            spec.follower_index,
            checkpoints.len(),
            spec.leader.name,
            spec.leader.number_of_shards
        )));
    }

    for (shard, checkpoint) in checkpoints.into_iter().enumerate() {
        store
            .put(&ShardId::new(spec.follower_index.as_str(), shard as u32), checkpoint)
            .await?;
    }
    Ok(())
}

async fn join_bootstrap(handle: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    let Some(join) = handle.as_mut() else {
        return std::future::pending().await;
    };
    let result = join.await;
    *handle = None;
    match result {
        Ok(result) => result,
        Err(e) => Err(ReplicationError::Internal(format!("restore task aborted: {}", e))),
    }
}

async fn token_cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<L: LeaderCluster, F: FollowerCluster> IndexTask<L, F> {
    async fn run(mut self, mut commands: mpsc::Receiver<IndexCommand>) {
        info!(alias = %self.spec.leader_alias, "Index task started");

        loop {
            let index_token = self.registration.as_ref().map(|r| r.token().clone());
            let next_restart = self.pending_restarts.values().min().copied();

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(IndexCommand::Stop { ack }) => {
                        self.stop().await;
                        let _ = ack.send(Ok(()));
                        return;
                    }
                    Some(IndexCommand::Shutdown) | None => {
                        self.shutdown().await;
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                },

                _ = token_cancelled(index_token) => {
                    if self.deps.root.is_cancelled() {
                        self.shutdown().await;
                        return;
                    }
                    warn!("Index task cancelled through the task registry");
                    self.fail(INDEX_TASK_CANCELLED.to_string()).await;
                }

                result = join_bootstrap(&mut self.bootstrap) => self.on_bootstrap_done(result).await,

                Some(joined) = self.shards.join_next(), if !self.shards.is_empty() => match joined {
                    Ok((shard, exit)) => self.on_shard_exit(shard, exit).await,
                    Err(e) => {
                        error!(error = %e, "Shard task panicked");
                        self.last_exit_reason = Some(format!("shard task aborted: {}", e));
                        self.pause_if_idle();
                    }
                },

                _ = sleep_until(next_restart) => self.restart_due_shards().await,
            }
        }
    }

    async fn handle_command(&mut self, command: IndexCommand) {
        match command {
            IndexCommand::Pause { reason, ack } => {
                let result = self.pause(reason).await;
                let _ = ack.send(result);
            }
            IndexCommand::Resume { ack } => {
                let result = self.resume().await;
                let _ = ack.send(result);
            }
            IndexCommand::Update { settings, ack } => {
                let result = self.update(settings).await;
                let _ = ack.send(result);
            }
            IndexCommand::Stop { .. } | IndexCommand::Shutdown => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State transitions
    // ─────────────────────────────────────────────────────────────────────────

    fn transition(&mut self, state: IndexReplicationState, reason: Option<String>) {
        if self.state != state {
            info!(from = %self.state, to = %state, reason = ?reason, "Index state transition");
        }
        self.state = state;
        self.status_tx.send_modify(|cell| {
            cell.state = state;
            cell.reason = reason;
        });
        metrics::record_index_state(&self.spec.follower_index, &state.to_string());
    }

    fn register(&mut self) {
        let token = self.deps.root.child_token();
        let description = index_task_description(
            &self.spec.leader_alias,
            &self.spec.leader.name,
            &self.spec.follower_index,
        );
        self.registration = Some(self.deps.registry.register(INDEX_TASK_ACTION, description, token));
    }

    fn start_bootstrap(&mut self) {
        let follower = Arc::clone(&self.deps.follower);
        let store = Arc::clone(&self.deps.store);
        let spec = self.spec.clone();
        self.bootstrap = Some(tokio::spawn(bootstrap(follower, store, spec).in_current_span()));
    }

    fn abort_bootstrap(&mut self) {
        if let Some(join) = self.bootstrap.take() {
            join.abort();
        }
    }

    async fn on_bootstrap_done(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                info!(shards = self.spec.leader.number_of_shards, "Follower index restored");
                self.bootstrapped = true;
                self.spawn_shards().await;
                self.transition(IndexReplicationState::Syncing, Some(USER_INITIATED.to_string()));
            }
            Err(e) => {
                error!(error = %e, "Restore failed");
                self.registration = None;
                self.transition(IndexReplicationState::Failed, Some(e.to_string()));
            }
        }
    }

    /// Index-wide failure: cancel everything and go FAILED.
    async fn fail(&mut self, reason: String) {
        self.abort_bootstrap();
        self.cancel_shards(&reason).await;
        self.registration = None;
        self.transition(IndexReplicationState::Failed, Some(reason));
    }

    async fn pause(&mut self, reason: String) -> Result<()> {
        match self.state {
            IndexReplicationState::Paused | IndexReplicationState::Failed => Ok(()),
            IndexReplicationState::Starting => Err(ReplicationError::InvalidState {
                expected: IndexReplicationState::Syncing.to_string(),
                actual: self.state.to_string(),
            }),
            IndexReplicationState::Stopped => Err(ReplicationError::NotReplicating {
                index: self.spec.follower_index.clone(),
            }),
            IndexReplicationState::Syncing => {
                self.cancel_shards(&reason).await;
                self.registration = None;
                self.transition(IndexReplicationState::Paused, Some(reason));
                Ok(())
            }
        }
    }

    async fn resume(&mut self) -> Result<()> {
        if !self.state.is_resumable() {
            return Err(ReplicationError::TaskNotPaused {
                index: self.spec.follower_index.clone(),
                state: self.state.to_string(),
            });
        }

        let leader = self
            .deps
            .leader
            .resolve_index(&self.spec.leader_alias, &self.spec.leader.name)
            .await
            .map_err(|e| ReplicationError::LeaderNotFound {
                alias: self.spec.leader_alias.clone(),
                index: self.spec.leader.name.clone(),
                message: e.to_string(),
            })?;

        self.register();
        self.last_exit_reason = None;

        if !self.bootstrapped || leader.number_of_shards != self.spec.leader.number_of_shards {
            self.spec.leader = leader;
            self.bootstrapped = false;
            self.start_bootstrap();
            self.transition(IndexReplicationState::Starting, None);
        } else {
            self.spawn_shards().await;
            self.transition(IndexReplicationState::Syncing, Some(USER_INITIATED.to_string()));
        }
        Ok(())
    }

    async fn update(&mut self, update: IndexSettings) -> Result<()> {
        let plan = self.spec.settings.plan_update(&update)?;
        if plan.is_noop() {
            debug!("Settings update changes nothing");
            return Ok(());
        }

        if !plan.in_place.is_empty() {
            let forwarded = plan
                .in_place
                .iter()
                .filter_map(|key| update.get(key).map(|value| (key, value)))
                .fold(IndexSettings::new(), |acc, (key, value)| acc.with(key.as_str(), value.clone()));
            self.deps
                .follower
                .update_settings(&self.spec.follower_index, &forwarded)
                .await
                .map_err(|e| ReplicationError::Internal(format!("settings update failed: {}", e)))?;
        }

        self.spec.settings.merge(&update);
        info!(changed = ?plan.changed, restart = plan.restart_shard_tasks, "Settings updated");

        if plan.restart_shard_tasks && self.state == IndexReplicationState::Syncing {
            self.cancel_shards("Settings updated").await;
            self.spawn_shards().await;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        info!("Stopping index task");
        self.abort_bootstrap();
        self.cancel_shards("Replication stopped").await;
        self.registration = None;
        self.transition(IndexReplicationState::Stopped, None);
    }

    async fn shutdown(&mut self) {
        info!("Shutting down index task");
        self.abort_bootstrap();
        self.cancel_shards("Shutdown").await;
        self.registration = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shard tasks
    // ─────────────────────────────────────────────────────────────────────────

    fn shard_params(&self, shard: u32) -> ShardTaskParams {
        let config = &self.deps.config.shard;
        ShardTaskParams {
            leader_alias: self.spec.leader_alias.clone(),
            leader_shard: ShardId::new(self.spec.leader.name.as_str(), shard),
            follower_shard: ShardId::new(self.spec.follower_index.as_str(), shard),
            batch_size: self
                .spec
                .settings
                .ops_batch_size()
                .ok()
                .flatten()
                .unwrap_or(config.ops_batch_size),
            poll_interval: self
                .spec
                .settings
                .poll_interval()
                .ok()
                .flatten()
                .unwrap_or_else(|| config.poll_interval_duration()),
            fetch_timeout: config.fetch_timeout_duration(),
            apply_timeout: config.apply_timeout_duration(),
            retry: config.retry_config(),
        }
    }

    async fn spawn_shards(&mut self) {
        for shard in 0..self.spec.leader.number_of_shards {
            self.spawn_shard(shard).await;
        }
    }

    async fn spawn_shard(&mut self, shard: u32) {
        let Some(registration) = self.registration.as_ref() else {
            return;
        };
        let token = registration.token().child_token();
        let shard_registration = self.deps.registry.register(
            SHARD_TASK_ACTION,
            shard_task_description(
                &self.spec.leader_alias,
                &self.spec.leader.name,
                &self.spec.follower_index,
                shard,
            ),
            token,
        );

        let params = self.shard_params(shard);
        let initial = self
            .deps
            .store
            .get(&params.follower_shard)
            .await
            .ok()
            .flatten()
            .unwrap_or(Checkpoint::EMPTY);

        let (cancel_tx, cancel_rx) = watch::channel(None);
        let (snapshot_tx, snapshot_rx) = watch::channel(ShardSnapshot::syncing(shard, initial));
        let ctx = ShardTaskContext {
            leader: Arc::clone(&self.deps.leader),
            follower: Arc::clone(&self.deps.follower),
            store: Arc::clone(&self.deps.store),
            bulkhead: Arc::clone(&self.deps.bulkhead),
            throttle: self.deps.throttle.clone(),
            counters: Arc::clone(&self.counters),
        };

        self.shards.spawn(async move {
            let exit = run_shard_task(ctx, params, shard_registration, cancel_rx, snapshot_tx).await;
            (shard, exit)
        });
        self.shard_cancels.insert(shard, cancel_tx);
        self.status_tx.send_modify(|cell| {
            cell.shards.insert(shard, snapshot_rx);
        });
    }

    /// Cancel every shard task with `reason` and wait for them to exit,
    /// aborting stragglers after the drain timeout.
    async fn cancel_shards(&mut self, reason: &str) {
        self.pending_restarts.clear();
        for cancel in self.shard_cancels.values() {
            let _ = cancel.send(Some(reason.to_string()));
        }

        let drain_timeout = self.deps.config.index.drain_timeout_duration();
        let running = self.shards.len();
        let drained = tokio::time::timeout(drain_timeout, async {
            while self.shards.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(running, ?drain_timeout, "Shard tasks did not drain in time, aborting");
            self.shards.abort_all();
            while self.shards.join_next().await.is_some() {}
        } else if running > 0 {
            debug!(running, reason, "Shard tasks drained");
        }

        self.shard_cancels.clear();
        self.status_tx.send_modify(|cell| cell.shards.clear());
    }

    async fn on_shard_exit(&mut self, shard: u32, exit: ShardExit) {
        self.shard_cancels.remove(&shard);

        match exit {
            ShardExit::Cancelled { reason, killed: true } => {
                if self.state == IndexReplicationState::Syncing {
                    let delay = self.deps.config.index.shard_restart_delay_duration();
                    info!(shard, ?delay, "Shard task killed, scheduling restart");
                    self.pending_restarts.insert(shard, Instant::now() + delay);
                }
                self.last_exit_reason = Some(reason);
            }
            ShardExit::Cancelled { reason, killed: false } => {
                debug!(shard, reason = %reason, "Shard task cancelled");
            }
            ShardExit::Failed { error } if error.is_index_wide() => {
                error!(shard, error = %error, "Index-wide failure");
                self.fail(error.to_string()).await;
                return;
            }
            ShardExit::Failed { error } => {
                warn!(shard, error = %error, "Shard task failed; index keeps syncing");
                self.last_exit_reason = Some(error.to_string());
            }
        }

        self.pause_if_idle();
    }

    /// With no shard task running and no restart pending, SYNCING becomes
    /// PAUSED carrying the last exit reason.
    fn pause_if_idle(&mut self) {
        if self.state != IndexReplicationState::Syncing
            || !self.shards.is_empty()
            || !self.pending_restarts.is_empty()
        {
            return;
        }
        let reason = self
            .last_exit_reason
            .clone()
            .unwrap_or_else(|| SHARD_TASK_KILLED.to_string());
        warn!(reason = %reason, "No shard tasks left, pausing");
        self.registration = None;
        self.transition(IndexReplicationState::Paused, Some(reason));
    }

    async fn restart_due_shards(&mut self) {
        if self.shards.is_empty() {
            // Every shard task is dead: pause instead of restarting
            self.pending_restarts.clear();
            self.pause_if_idle();
            return;
        }

        let now = Instant::now();
        let due: Vec<u32> = self
            .pending_restarts
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(shard, _)| *shard)
            .collect();
        for shard in due {
            self.pending_restarts.remove(&shard);
            if self.state != IndexReplicationState::Syncing {
                continue;
            }
            info!(shard, "Restarting shard task from its checkpoint");
            metrics::record_shard_restart(&self.spec.follower_index);
            self.spawn_shard(shard).await;
        }
    }
}

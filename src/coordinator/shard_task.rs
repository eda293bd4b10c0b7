//! Shard task: the fetch/apply loop of one follower shard.
//!
//! Each follower shard has a dedicated task that:
//! 1. Reads its checkpoint from the store (`-1/-1` if none)
//! 2. Fetches leader operations (bounded by `fetch_timeout`), starting after
//!    `follower_checkpoint` and after the last applied seq_no from then on
//! 3. Applies them to the follower shard (bounded by `apply_timeout`)
//! 4. Persists `(max applied seq_no, durable follower seq_no)` and publishes a snapshot
//!
//! Operations above `follower_checkpoint` were not confirmed durable, so a
//! new task fetches them again. Applies are idempotent per seq_no.
//! 5. Sleeps `poll_interval` when caught up
//!
//! # Cancellation
//!
//! Two signals stop the loop:
//! - the parent sends a reason on the `cancel` watch (pause, stop, restart)
//! - the registry token is tripped (external kill, or the index token was cancelled)
//!
//! Both are only observed while fetching, sleeping or backing off. An apply
//! that has started always runs to completion and its checkpoint is
//! persisted before the next cancellation check, so a cancelled shard never
//! leaves a partially advanced checkpoint behind.
//!
//! # Errors
//!
//! Transient errors back off per [`RetryConfig`]; once the budget is spent
//! the error is reported as permanent. Permanent and index-wide errors end
//! the task with [`ShardExit::Failed`] and the parent decides what to do.

use super::types::{ShardExit, ShardReplicationState, ShardSnapshot, SHARD_TASK_KILLED};
use crate::checkpoint::{Checkpoint, CheckpointStore, ShardId};
use crate::cluster::{FollowerCluster, LeaderCluster, OperationBatch};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{Bulkhead, FetchThrottle, RetryConfig};
use crate::stats::IndexCounters;
use crate::task_registry::RegisteredTask;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Shared collaborators of every shard task of an index.
pub(crate) struct ShardTaskContext<L: LeaderCluster, F: FollowerCluster> {
    pub leader: Arc<L>,
    pub follower: Arc<F>,
    pub store: Arc<dyn CheckpointStore>,
    pub bulkhead: Arc<Bulkhead>,
    pub throttle: Option<Arc<FetchThrottle>>,
    pub counters: Arc<IndexCounters>,
}

impl<L: LeaderCluster, F: FollowerCluster> Clone for ShardTaskContext<L, F> {
    fn clone(&self) -> Self {
        Self {
            leader: Arc::clone(&self.leader),
            follower: Arc::clone(&self.follower),
            store: Arc::clone(&self.store),
            bulkhead: Arc::clone(&self.bulkhead),
            throttle: self.throttle.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Per-shard parameters, fixed for the lifetime of one shard task.
#[derive(Debug, Clone)]
pub(crate) struct ShardTaskParams {
    pub leader_alias: String,
    pub leader_shard: ShardId,
    pub follower_shard: ShardId,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub apply_timeout: Duration,
    pub retry: RetryConfig,
}

/// Result of waiting on a timer or a cancellation signal.
enum Wait {
    Elapsed,
    Exit(ShardExit),
}

fn killed() -> ShardExit {
    ShardExit::Cancelled {
        reason: SHARD_TASK_KILLED.to_string(),
        killed: true,
    }
}

/// Check both cancellation signals without waiting.
fn check_cancelled(registration: &RegisteredTask, cancel_rx: &watch::Receiver<Option<String>>) -> Option<ShardExit> {
    if let Some(reason) = cancel_rx.borrow().clone() {
        return Some(ShardExit::Cancelled { reason, killed: false });
    }
    if registration.token().is_cancelled() {
        return Some(killed());
    }
    None
}

/// Sleep for `duration` unless cancelled first.
async fn sleep_or_cancel(
    duration: Duration,
    registration: &RegisteredTask,
    cancel_rx: &mut watch::Receiver<Option<String>>,
) -> Wait {
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;

            _ = registration.token().cancelled() => return Wait::Exit(killed()),

            changed = cancel_rx.changed() => {
                if changed.is_err() {
                    // Parent is gone
                    return Wait::Exit(killed());
                }
                if let Some(exit) = check_cancelled(registration, cancel_rx) {
                    return Wait::Exit(exit);
                }
            }

            _ = &mut sleep => return Wait::Elapsed,
        }
    }
}

/// Run a shard task until it is cancelled or fails.
///
/// The registration guard is held for the whole run, so the task is listed
/// in the registry exactly while this future is alive.
pub(crate) async fn run_shard_task<L: LeaderCluster, F: FollowerCluster>(
    ctx: ShardTaskContext<L, F>,
    params: ShardTaskParams,
    registration: RegisteredTask,
    mut cancel_rx: watch::Receiver<Option<String>>,
    snapshot_tx: watch::Sender<ShardSnapshot>,
) -> ShardExit {
    let span = info_span!(
        "shard_task",
        follower_index = %params.follower_shard.index,
        shard_id = params.follower_shard.shard,
        task_id = registration.id()
    );

    async move {
        let exit = shard_loop(&ctx, &params, &registration, &mut cancel_rx, &snapshot_tx).await;

        let (state, reason, outcome) = match &exit {
            ShardExit::Cancelled { reason, killed } => (
                ShardReplicationState::Cancelled,
                reason.clone(),
                if *killed { "killed" } else { "cancelled" },
            ),
            ShardExit::Failed { error } => (ShardReplicationState::Failed, error.to_string(), "failed"),
        };
        snapshot_tx.send_modify(|s| {
            s.state = state;
            s.reason = Some(reason.clone());
        });
        metrics::record_shard_exit(&params.follower_shard.index, outcome);
        info!(outcome, reason = %reason, "Shard task exited");
        exit
    }
    .instrument(span)
    .await
}

async fn shard_loop<L: LeaderCluster, F: FollowerCluster>(
    ctx: &ShardTaskContext<L, F>,
    params: &ShardTaskParams,
    registration: &RegisteredTask,
    cancel_rx: &mut watch::Receiver<Option<String>>,
    snapshot_tx: &watch::Sender<ShardSnapshot>,
) -> ShardExit {
    let shard = &params.follower_shard;
    let index = shard.index.as_str();

    let mut checkpoint = match ctx.store.get(shard).await {
        Ok(cp) => cp.unwrap_or(Checkpoint::EMPTY),
        Err(error) => return ShardExit::Failed { error },
    };
    snapshot_tx.send_replace(ShardSnapshot::syncing(shard.shard, checkpoint));
    let mut fetch_from = checkpoint.follower_checkpoint;

    info!(
        leader_checkpoint = checkpoint.leader_checkpoint,
        follower_checkpoint = checkpoint.follower_checkpoint,
        batch_size = params.batch_size,
        "Starting shard task"
    );

    let mut attempt = 0usize;

    loop {
        if let Some(exit) = check_cancelled(registration, cancel_rx) {
            return exit;
        }

        // Fetch: nothing applied yet, so cancellation may interrupt it
        let fetch_start = Instant::now();
        let fetched = tokio::select! {
            biased;

            _ = registration.token().cancelled() => return killed(),

            changed = cancel_rx.changed() => {
                if changed.is_err() {
                    return killed();
                }
                continue;
            }

            result = fetch(ctx, params, fetch_from) => result,
        };

        let batch = match fetched {
            Ok(batch) => batch,
            Err(error) => {
                ctx.counters.record_failed_read();
                match backoff_or_fail(error, &mut attempt, params, registration, cancel_rx).await {
                    Some(exit) => return exit,
                    None => continue,
                }
            }
        };

        let op_count = batch.operations.len();
        let bytes = batch.size_bytes();
        ctx.counters.record_read(op_count, bytes);
        metrics::record_ops_fetched(index, op_count, bytes, fetch_start.elapsed());

        let Some(max_seq_no) = batch.max_seq_no() else {
            attempt = 0;
            snapshot_tx.send_modify(|s| s.leader_tip = batch.leader_tip);
            metrics::set_shard_lag(index, shard.shard, checkpoint.lag(batch.leader_tip));
            match sleep_or_cancel(params.poll_interval, registration, cancel_rx).await {
                Wait::Elapsed => continue,
                Wait::Exit(exit) => return exit,
            }
        };

        // Apply: runs to completion regardless of cancellation
        let apply_start = Instant::now();
        let durable = match apply(ctx, params, batch.operations).await {
            Ok(durable) => durable,
            Err(error) => {
                ctx.counters.record_failed_write();
                match backoff_or_fail(error, &mut attempt, params, registration, cancel_rx).await {
                    Some(exit) => return exit,
                    None => continue,
                }
            }
        };
        ctx.counters.record_written(op_count);
        metrics::record_ops_applied(index, op_count, apply_start.elapsed());

        let next = match next_checkpoint(shard, &checkpoint, max_seq_no, durable, batch.leader_tip) {
            Ok(next) => next,
            Err(error) => return ShardExit::Failed { error },
        };
        if let Err(error) = ctx.store.put(shard, next).await {
            return ShardExit::Failed { error };
        }
        checkpoint = next;
        fetch_from = max_seq_no;
        attempt = 0;

        snapshot_tx.send_modify(|s| {
            s.checkpoint = next;
            s.leader_tip = batch.leader_tip;
        });
        metrics::set_shard_lag(index, shard.shard, next.lag(batch.leader_tip));
        debug!(
            ops = op_count,
            leader_checkpoint = next.leader_checkpoint,
            follower_checkpoint = next.follower_checkpoint,
            leader_tip = batch.leader_tip,
            "Checkpoint advanced"
        );
    }
}

async fn fetch<L: LeaderCluster, F: FollowerCluster>(
    ctx: &ShardTaskContext<L, F>,
    params: &ShardTaskParams,
    from_seq_no: i64,
) -> Result<OperationBatch> {
    if let Some(throttle) = &ctx.throttle {
        throttle.until_ready().await;
    }
    let _permit = ctx.bulkhead.acquire().await?;

    let call = ctx.leader.fetch_operations(
        &params.leader_alias,
        &params.leader_shard,
        from_seq_no,
        params.batch_size,
    );
    match tokio::time::timeout(params.fetch_timeout, call).await {
        Ok(Ok(batch)) => Ok(batch),
        Ok(Err(e)) => Err(ReplicationError::from_fetch(
            &params.follower_shard,
            &params.leader_shard.index,
            e,
        )),
        Err(_) => Err(ReplicationError::ShardTransientFetch {
            shard: params.follower_shard.clone(),
            message: format!("fetch timed out after {:?}", params.fetch_timeout),
        }),
    }
}

async fn apply<L: LeaderCluster, F: FollowerCluster>(
    ctx: &ShardTaskContext<L, F>,
    params: &ShardTaskParams,
    operations: Vec<crate::cluster::Operation>,
) -> Result<i64> {
    let call = ctx.follower.apply_operations(&params.follower_shard, operations);
    match tokio::time::timeout(params.apply_timeout, call).await {
        Ok(Ok(durable)) => Ok(durable),
        Ok(Err(e)) => Err(ReplicationError::from_apply(&params.follower_shard, e)),
        Err(_) => Err(ReplicationError::ShardTransientFetch {
            shard: params.follower_shard.clone(),
            message: format!("apply timed out after {:?}", params.apply_timeout),
        }),
    }
}

/// Compute the checkpoint after an apply, enforcing
/// `follower <= leader <= tip` and monotonicity.
///
/// A batch re-fetched from below `current.leader_checkpoint` leaves the
/// leader side where it is; only what the follower confirms moves forward.
fn next_checkpoint(
    shard: &ShardId,
    current: &Checkpoint,
    max_seq_no: i64,
    durable: i64,
    leader_tip: i64,
) -> Result<Checkpoint> {
    if max_seq_no > leader_tip {
        return Err(ReplicationError::ShardPermanent {
            shard: shard.clone(),
            message: format!("leader returned seq_no {} beyond its tip {}", max_seq_no, leader_tip),
        });
    }
    let leader = max_seq_no.max(current.leader_checkpoint);
    let next = Checkpoint::new(leader, durable.min(leader));
    if !current.allows_advance_to(&next) {
        return Err(ReplicationError::ShardPermanent {
            shard: shard.clone(),
            message: format!(
                "checkpoint would regress from ({}, {}) to ({}, {})",
                current.leader_checkpoint,
                current.follower_checkpoint,
                next.leader_checkpoint,
                next.follower_checkpoint
            ),
        });
    }
    Ok(next)
}

/// Back off after a retryable error, or turn the error into an exit.
/// Returns `None` when the loop should retry.
async fn backoff_or_fail(
    error: ReplicationError,
    attempt: &mut usize,
    params: &ShardTaskParams,
    registration: &RegisteredTask,
    cancel_rx: &mut watch::Receiver<Option<String>>,
) -> Option<ShardExit> {
    let index = params.follower_shard.index.as_str();

    if !error.is_retryable() {
        let kind = if error.is_index_wide() { "index_wide" } else { "permanent" };
        metrics::record_shard_error(index, kind);
        warn!(error = %error, kind, "Shard task failed");
        return Some(ShardExit::Failed { error });
    }

    metrics::record_shard_error(index, "transient");
    *attempt += 1;
    if params.retry.is_exhausted(*attempt) {
        warn!(error = %error, attempts = *attempt, "Retries exhausted");
        return Some(ShardExit::Failed {
            error: ReplicationError::ShardPermanent {
                shard: params.follower_shard.clone(),
                message: format!("retries exhausted after {} attempts: {}", *attempt, error),
            },
        });
    }

    let delay = params.retry.delay_for_attempt(*attempt);
    debug!(error = %error, attempt = *attempt, delay_ms = delay.as_millis() as u64, "Transient error, backing off");
    match sleep_or_cancel(delay, registration, cancel_rx).await {
        Wait::Elapsed => None,
        Wait::Exit(exit) => Some(exit),
    }
}

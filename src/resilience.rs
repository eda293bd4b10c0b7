//! Flow control for the shard data plane.
//!
//! - [`RetryConfig`]: backoff between attempts after transient shard errors
//! - [`FetchThrottle`]: token bucket on leader fetch requests, engine-wide
//! - [`Bulkhead`]: bound on in-flight leader fetches, engine-wide
//!
//! Shard tasks pass through the throttle first, then take a bulkhead
//! permit for the duration of a single fetch.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> index_replication::Result<()> {
//! use index_replication::resilience::{Bulkhead, FetchThrottle, ThrottleConfig};
//!
//! let throttle = FetchThrottle::new(ThrottleConfig { per_second: 500, burst: 50 });
//! let bulkhead = Bulkhead::new(8);
//!
//! throttle.until_ready().await;
//! let _permit = bulkhead.acquire().await?;
//! // fetch from the leader; dropping the permit frees the slot
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Backoff between consecutive attempts of a shard task after transient
/// errors. After `max_attempts` consecutive failures the last error is
/// treated as permanent.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling for the exponential growth.
    pub max_delay: Duration,
    /// Growth per failed attempt.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Short delays and a small budget, for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    ///
    /// `initial_delay * backoff_factor^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// True once `attempt` consecutive failures spent the budget.
    pub fn is_exhausted(&self, attempt: usize) -> bool {
        attempt >= self.max_attempts
    }
}

// =============================================================================
// Fetch throttle
// =============================================================================

/// Token bucket parameters: `per_second` sustained fetches, `burst` at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub per_second: u32,
    pub burst: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            per_second: 1000,
            burst: 100,
        }
    }
}

/// Token bucket on leader fetches, shared by every shard task.
///
/// Resuming many indices at once would otherwise send one fetch per shard
/// to the leader cluster in the same instant.
pub struct FetchThrottle {
    bucket: RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: ThrottleConfig,
}

impl std::fmt::Debug for FetchThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchThrottle").field("config", &self.config).finish()
    }
}

impl FetchThrottle {
    /// Zero rates are raised to one rather than rejected.
    pub fn new(config: ThrottleConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst)),
            config,
        }
    }

    /// Wait for a token. Cancel-safe.
    pub async fn until_ready(&self) {
        self.bucket.until_ready().await;
    }

    /// Take a token if one is available right now.
    pub fn check(&self) -> bool {
        self.bucket.check().is_ok()
    }

    pub fn config(&self) -> ThrottleConfig {
        self.config
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// Bound on in-flight leader fetches across all indices.
///
/// Closing the bulkhead on shutdown wakes every waiter with
/// [`ReplicationError::Shutdown`].
#[derive(Debug)]
pub struct Bulkhead {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Bulkhead {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a fetch slot; the slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ReplicationError::Shutdown)
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Fetches currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse new permits and wake all waiters.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

//! Restart backoff bookkeeping
//!
//! Exponential backoff with jitter for supervised unit restarts. The state
//! is an explicit value threaded through the supervisor loop rather than
//! fields mutated behind the caller's back.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Backoff policy for a supervised unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first restart
    #[serde(with = "humantime_serde")]
    pub min_backoff: Duration,

    /// Upper bound on the restart delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Multiplier applied on each consecutive failure
    pub multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub add_jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Builder: set minimum backoff
    pub fn with_min_backoff(mut self, min: Duration) -> Self {
        self.min_backoff = min;
        self
    }

    /// Builder: set maximum backoff
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Builder: set multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Builder: enable/disable jitter
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay for a given consecutive-failure count (0-indexed)
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        let base = self.min_backoff.as_millis() as f64 * self.multiplier.powi(failures as i32);
        let clamped = base.min(self.max_backoff.as_millis() as f64);

        let final_delay = if self.add_jitter {
            // Up to 25% jitter
            clamped + clamped * 0.25 * rand_jitter()
        } else {
            clamped
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Quiet period after which the failure count resets to zero.
    ///
    /// A unit that has been running without failure for twice the maximum
    /// backoff is considered healthy again.
    pub fn reset_window(&self) -> Duration {
        self.max_backoff * 2
    }
}

/// Backoff state carried between restarts of one unit
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: BackoffPolicy,
    failures: u32,
    last_failure: Option<Instant>,
}

impl BackoffState {
    /// Create fresh backoff state
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            last_failure: None,
        }
    }

    /// Record a failure and return the delay to wait before restarting.
    ///
    /// If the unit stayed up longer than the reset window since the last
    /// failure, the consecutive-failure count restarts from zero.
    pub fn record_failure(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) > self.policy.reset_window() {
                self.failures = 0;
            }
        }
        let delay = self.policy.delay_for_failure(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
        delay
    }

    /// Consecutive failures observed inside the current window
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Forget all failure history
    pub fn reset(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0)
/// Uses a simple LCG for determinism in tests
fn rand_jitter() -> f64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEED: AtomicU64 = AtomicU64::new(0);

    const A: u64 = 1103515245;
    const C: u64 = 12345;
    const M: u64 = 1 << 31;

    let seed = SEED.fetch_add(1, Ordering::Relaxed);
    let time_component = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let combined = seed.wrapping_add(time_component);
    let next = (A.wrapping_mul(combined).wrapping_add(C)) % M;

    (next as f64) / (M as f64)
}

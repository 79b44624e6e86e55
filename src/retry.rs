//! Retry budgets and backoff.
//!
//! Every bounded wait in `retest` (provisioning, health polling, job
//! reassignment) is described by explicit configuration rather than
//! constants: [`BackoffPolicy`] for how long to wait between attempts and
//! [`RetryTracker`] for how many infrastructure retries a job has used.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
///
/// The delay before attempt `n` (1-based) is
/// `min(base_delay * 2^(n-1), max_delay)` plus up to 10% jitter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackoffPolicy {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// A policy that tries `max_attempts` times without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Attempt budget, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay to wait after failed attempt `attempt` (1-based), with jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter_cap = base.as_millis() as u64 / 10;
        if jitter_cap == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
    }
}

/// Tracks infrastructure retries per job.
///
/// Only the scheduler consults this; lower layers just report what happened.
#[derive(Clone)]
pub struct RetryTracker {
    max_retries: usize,
    retries: Arc<Mutex<HashMap<String, usize>>>,
}

impl RetryTracker {
    /// Creates a tracker allowing `max_retries` retries per job.
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            retries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Maximum number of retries per job.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Records an infrastructure failure of `job_id`.
    ///
    /// Returns `true` if the job may be retried, `false` once the budget is
    /// exhausted.
    pub fn record_infra_failure(&self, job_id: &str) -> bool {
        let Ok(mut retries) = self.retries.lock() else {
            return false;
        };
        let used = retries.entry(job_id.to_string()).or_insert(0);
        if *used < self.max_retries {
            *used += 1;
            true
        } else {
            false
        }
    }

    /// Number of retries consumed by `job_id`.
    pub fn retries(&self, job_id: &str) -> usize {
        self.retries
            .lock()
            .ok()
            .and_then(|r| r.get(job_id).copied())
            .unwrap_or(0)
    }

    /// Total retries consumed across all jobs.
    pub fn total_retries(&self) -> usize {
        self.retries
            .lock()
            .map(|r| r.values().sum())
            .unwrap_or(0)
    }
}

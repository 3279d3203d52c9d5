use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;

/// Bounds and steps for one source's polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub initial_interval: Duration,
    pub speedup_step: Duration,
    pub successes_before_speedup: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &Config) -> Self {
        let min_interval = Duration::from_secs(config.min_interval_secs);
        Self {
            min_interval,
            max_interval: Duration::from_secs(config.max_interval_secs),
            initial_interval: config
                .initial_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(min_interval),
            speedup_step: Duration::from_secs(config.interval_step_secs),
            successes_before_speedup: config.successes_before_speedup.max(1),
        }
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min_interval, self.max_interval)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(300),
            initial_interval: Duration::from_secs(10),
            speedup_step: Duration::from_secs(5),
            successes_before_speedup: 10,
        }
    }
}

/// Polling state of a single source. Always `min_interval <= interval <= max_interval`.
#[derive(Debug, Clone)]
pub struct FetchState {
    policy: BackoffPolicy,
    interval: Duration,
    consecutive_successes: u32,
    consecutive_failures: u32,
    next_fetch_at: Instant,
}

impl FetchState {
    /// New sources are due immediately.
    pub fn new(policy: BackoffPolicy, now: Instant) -> Self {
        Self {
            interval: policy.clamp(policy.initial_interval),
            policy,
            consecutive_successes: 0,
            consecutive_failures: 0,
            next_fetch_at: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_fetch_at(&self) -> Instant {
        self.next_fetch_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_fetch_at
    }

    /// Shortens the interval by one step after every run of clean fetches.
    /// Returns whether the interval changed.
    pub fn on_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        if self.consecutive_successes < self.policy.successes_before_speedup {
            return false;
        }
        self.consecutive_successes = 0;

        let previous = self.interval;
        self.interval = self
            .policy
            .clamp(self.interval.saturating_sub(self.policy.speedup_step));
        previous != self.interval
    }

    /// Grows the interval by 50% per consecutive failure, up to four.
    /// Returns whether the interval changed.
    pub fn on_failure(&mut self) -> bool {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let multiplier = self.consecutive_failures.min(4);
        let factor = 1.0 + 0.5 * f64::from(multiplier);

        let previous = self.interval;
        self.interval = self.policy.clamp(self.interval.mul_f64(factor));
        previous != self.interval
    }

    pub fn schedule_next(&mut self, now: Instant) {
        self.next_fetch_at = now + self.interval;
    }
}

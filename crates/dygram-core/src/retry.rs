//! Retry policies with exponential backoff for agent transport
//! failures. Defaults are 3 attempts, 1s initial, 30s cap rather than
//! tuned per-transport values, since a live transport is an external
//! collaborator this core doesn't assume the shape of (see DESIGN.md).

use std::time::Duration;

use rand::Rng;

use crate::annotation::RetryAnnotationConfig;

/// Exponential backoff with optional jitter, derived from a node's
/// `@retry` annotation (or the default policy when absent).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_interval_ms: u64,
    pub backoff_factor: f64,
    pub max_interval_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryAnnotationConfig::default().into()
    }
}

impl From<RetryAnnotationConfig> for RetryPolicy {
    fn from(cfg: RetryAnnotationConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            initial_interval_ms: cfg.initial_interval_ms,
            backoff_factor: 2.0,
            max_interval_ms: cfg.max_interval_ms,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the given 0-indexed attempt, capped at
    /// `max_interval_ms` with +/-50% jitter when enabled.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_millis(0);
        }
        let base = self.initial_interval_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval_ms as f64);
        let delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(delay.round() as u64)
    }
}

/// Tracks attempts made so far for one retryable operation.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempt: usize,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempt += 1;
        self.last_error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_three_attempts_one_second_thirty_second_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval_ms, 1_000);
        assert_eq!(policy.max_interval_ms, 30_000);
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            assert!(policy.calculate_delay(attempt).as_millis() <= 30_000);
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}

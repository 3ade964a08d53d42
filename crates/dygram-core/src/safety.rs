//! Safety Manager: per-path and global limits, cycle
//! detection, and a per-node circuit breaker.
//!
//! The limit/cycle checks are pure functions over [`ExecutionState`].
//! The circuit breaker tracks wall-clock cool-downs and is therefore
//! not part of the persisted state — it is owned by the effect
//! executor, which is the imperative shell that actually invokes
//! nodes and observes failures.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::annotation::{AnnotationProcessor, ErrorHandlingMode};
use crate::error::{EngineError, Result};
use crate::model::{ExecutionState, MachineJson, Path};

/// Scans every node's annotations for a declared `@errorHandling`
/// policy (spec §7 does not pin down which node carries it; the first
/// one found, in source order, wins). Defaults to `Continue`.
pub fn error_handling_policy(machine: &MachineJson) -> ErrorHandlingMode {
    machine
        .nodes
        .iter()
        .find_map(|n| AnnotationProcessor::error_handling(&n.annotations))
        .unwrap_or_default()
}

pub fn check_step_limit(state: &ExecutionState, path_id: u64) -> Result<()> {
    let path = state
        .path(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    if path.step_count >= state.limits.max_steps {
        return Err(EngineError::LimitExceeded {
            path_id,
            reason: format!(
                "step count {} reached max_steps {}",
                path.step_count, state.limits.max_steps
            ),
        });
    }
    Ok(())
}

pub fn check_invocation_limit(state: &ExecutionState, path_id: u64, node_name: &str) -> Result<()> {
    let path = state
        .path(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    let count = path.node_invocation_counts.get(node_name).copied().unwrap_or(0);
    if count >= state.limits.max_node_invocations {
        return Err(EngineError::LimitExceeded {
            path_id,
            reason: format!(
                "node '{node_name}' invoked {count} times, exceeding max_node_invocations {}",
                state.limits.max_node_invocations
            ),
        });
    }
    Ok(())
}

pub fn check_timeout(state: &ExecutionState, path_id: u64) -> Result<()> {
    let start: DateTime<Utc> = state
        .metadata
        .start_time
        .parse()
        .map_err(|e| EngineError::invariant(format!("invalid start_time: {e}")))?;
    let elapsed = (Utc::now() - start).num_seconds().max(0) as u64;
    if elapsed >= state.limits.timeout_secs {
        return Err(EngineError::LimitExceeded {
            path_id,
            reason: format!(
                "execution wall clock {elapsed}s reached timeout {}s",
                state.limits.timeout_secs
            ),
        });
    }
    Ok(())
}

/// Detects a repeated state-node subsequence of length >= 2 within the
/// last `window` visits recorded on the path.
pub fn detect_cycle(path: &Path, window: usize) -> bool {
    let visits: Vec<&str> = path
        .state_transitions
        .iter()
        .rev()
        .take(window)
        .map(|v| v.state.as_str())
        .collect();
    if visits.len() < 4 {
        return false;
    }
    // visits is newest-first; look for any subsequence length L (2..=len/2)
    // that repeats back-to-back at the tail.
    for cycle_len in 2..=(visits.len() / 2) {
        let head = &visits[..cycle_len];
        let next = &visits[cycle_len..cycle_len * 2];
        if head == next {
            return true;
        }
    }
    false
}

pub fn check_cycle(state: &ExecutionState, path_id: u64) -> Result<()> {
    let path = state
        .path(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    if detect_cycle(path, state.limits.cycle_detection_window) {
        return Err(EngineError::LimitExceeded {
            path_id,
            reason: "cycle detected within cycle_detection_window state visits".to_string(),
        });
    }
    Ok(())
}

/// Runs every limit check for `path_id`, in the order the runtime's
/// step loop applies them.
pub fn check_all_limits(state: &ExecutionState, path_id: u64) -> Result<()> {
    check_step_limit(state, path_id)?;
    check_timeout(state, path_id)?;
    check_cycle(state, path_id)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-node circuit breaker: opens after `threshold` consecutive
/// failures, refuses further invocations while open, and transitions
/// to half-open after `cooldown` has elapsed.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold,
            cooldown,
            opened_at: None,
        }
    }

    /// Returns `true` if an invocation may proceed, first promoting an
    /// expired `Open` breaker to `HalfOpen`.
    pub fn allow(&mut self) -> bool {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self.state != CircuitState::Open
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StateVisit;

    fn path_with_visits(states: &[&str]) -> Path {
        Path {
            id: 0,
            current_node: states.last().copied().unwrap_or_default().to_string(),
            status: crate::model::PathStatus::Active,
            history: vec![],
            step_count: 0,
            node_invocation_counts: Default::default(),
            state_transitions: states
                .iter()
                .map(|s| StateVisit {
                    state: s.to_string(),
                    timestamp: "t".into(),
                })
                .collect(),
            start_time: "t".into(),
            map_context: None,
        }
    }

    #[test]
    fn detects_simple_ab_ab_cycle() {
        let path = path_with_visits(&["a", "b", "a", "b"]);
        assert!(detect_cycle(&path, 12));
    }

    #[test]
    fn no_cycle_for_distinct_visits() {
        let path = path_with_visits(&["a", "b", "c", "d"]);
        assert!(!detect_cycle(&path, 12));
    }

    #[test]
    fn circuit_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_millis(10));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn circuit_breaker_half_opens_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(5));
        breaker.record_failure();
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(10));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}

//! Engine configuration.
//!
//! Bundles [`ExecutionLimits`], retry defaults, circuit breaker
//! thresholds, and environment-sourced model/transport settings into
//! one `serde`-deserializable, `Default`-able struct, layered from env
//! vars over explicit overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::ExecutionLimits;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub limits: ExecutionLimits,
    pub default_retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// `ANTHROPIC_MODEL_ID` or an equivalent; `None` lets the LLM
    /// client's own default apply.
    pub model_id: Option<String>,
    /// Root directory for session artifacts; defaults to
    /// `.dygram/executions` relative to the working directory.
    pub session_root: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            default_retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            model_id: None,
            session_root: ".dygram/executions".to_string(),
        }
    }
}

impl EngineConfig {
    /// Layers environment variables over the defaults: `ANTHROPIC_MODEL_ID`
    /// for the model id, and a working-directory override for the
    /// session root.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(model_id) = std::env::var("ANTHROPIC_MODEL_ID") {
            if !model_id.is_empty() {
                cfg.model_id = Some(model_id);
            }
        }
        if let Ok(root) = std::env::var("DYGRAM_SESSION_ROOT") {
            if !root.is_empty() {
                cfg.session_root = root;
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_root_matches_spec_layout() {
        assert_eq!(EngineConfig::default().session_root, ".dygram/executions");
    }
}

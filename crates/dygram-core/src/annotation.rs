//! Annotation Processor.
//!
//! Parses `@name`, `@name(value)` / `@name(Node.field)`, and
//! `@name(k: v; …)` forms on nodes and edges into typed configs.
//! Aliases share parsing logic but may carry different defaults
//! (`@join` is `@barrier` with `merge = true`). Unknown annotations are
//! logged and ignored — never fatal.

use crate::model::Annotation;

/// Find the first annotation matching any of `aliases`.
fn find<'a>(annotations: &'a [Annotation], aliases: &[&str]) -> Option<&'a Annotation> {
    annotations.iter().find(|a| aliases.contains(&a.name.as_str()))
}

/// `@barrier`, `@join` (merge=true), `@merge` (merge=true).
#[derive(Debug, Clone, PartialEq)]
pub struct BarrierConfig {
    pub name: Option<String>,
    pub merge: bool,
    pub group: Option<String>,
}

/// `@async`, `@spawn`.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncConfig {
    pub target: Option<String>,
}

/// `@parallel` — distinct from `@async`: forks and ends the
/// originating path (see DESIGN.md's Open Question decisions).
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelConfig;

/// `@map`, `@foreach`.
#[derive(Debug, Clone, PartialEq)]
pub struct MapConfig {
    /// Qualified source, e.g. `Ctx.items`.
    pub source: Option<String>,
}

/// `@meta` — marks a node as exposing meta-tools.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaConfig;

/// `@strict` — unused annotations on this node/edge become fatal
/// instead of being logged and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct StrictConfig;

/// Node-level `@retry(maxAttempts: n; initialIntervalMs: n; maxIntervalMs: n)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAnnotationConfig {
    pub max_attempts: usize,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for RetryAnnotationConfig {
    fn default() -> Self {
        // Default backoff: 3 attempts, 1s initial, 30s cap.
        Self {
            max_attempts: 3,
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
        }
    }
}

/// Node-level `@timeout(seconds)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutConfig {
    pub seconds: u64,
}

/// Node-level `@checkpoint` / `@checkpoint("description")`.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointConfig {
    pub description: Option<String>,
}

/// Node-level `@priority(n)` — higher runs first when choosing among
/// several otherwise-equal automated edges.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityConfig {
    pub value: i64,
}

/// Machine-level `@errorHandling(continue|fail-fast|compensate)`.
/// Spec §7: governs what happens to the *other* active paths when one
/// path fails a limit or transport error. `continue` (the default)
/// only fails the offending path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandlingMode {
    #[default]
    Continue,
    FailFast,
    Compensate,
}

impl ErrorHandlingMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "continue" => Some(ErrorHandlingMode::Continue),
            "fail-fast" | "failFast" => Some(ErrorHandlingMode::FailFast),
            "compensate" => Some(ErrorHandlingMode::Compensate),
            _ => None,
        }
    }
}

/// Parses k:v attribute-form annotation bodies (`@name(k: v; k2: v2)`)
/// into a lookup map. Simple/value forms yield an empty map.
fn attr_map(ann: &Annotation) -> std::collections::HashMap<String, String> {
    ann.attributes.clone().unwrap_or_default()
}

pub struct AnnotationProcessor;

impl AnnotationProcessor {
    pub fn barrier(annotations: &[Annotation]) -> Option<BarrierConfig> {
        if let Some(a) = find(annotations, &["barrier"]) {
            let attrs = attr_map(a);
            return Some(BarrierConfig {
                name: a.value.clone().or_else(|| attrs.get("name").cloned()),
                merge: attrs
                    .get("merge")
                    .map(|v| v == "true")
                    .unwrap_or(false),
                group: attrs.get("group").cloned().or_else(|| a.qualified_value.clone()),
            });
        }
        if let Some(a) = find(annotations, &["join", "merge"]) {
            let attrs = attr_map(a);
            return Some(BarrierConfig {
                name: a.value.clone().or_else(|| attrs.get("name").cloned()),
                merge: true,
                group: attrs.get("group").cloned().or_else(|| a.qualified_value.clone()),
            });
        }
        None
    }

    pub fn async_spawn(annotations: &[Annotation]) -> Option<AsyncConfig> {
        find(annotations, &["async", "spawn"]).map(|a| AsyncConfig {
            target: a.value.clone(),
        })
    }

    pub fn parallel(annotations: &[Annotation]) -> Option<ParallelConfig> {
        find(annotations, &["parallel"]).map(|_| ParallelConfig)
    }

    pub fn map(annotations: &[Annotation]) -> Option<MapConfig> {
        find(annotations, &["map", "foreach"]).map(|a| MapConfig {
            source: a.qualified_value.clone().or_else(|| a.value.clone()),
        })
    }

    pub fn meta(annotations: &[Annotation]) -> Option<MetaConfig> {
        find(annotations, &["meta"]).map(|_| MetaConfig)
    }

    pub fn strict(annotations: &[Annotation]) -> Option<StrictConfig> {
        find(annotations, &["strict"]).map(|_| StrictConfig)
    }

    pub fn retry(annotations: &[Annotation]) -> Option<RetryAnnotationConfig> {
        find(annotations, &["retry"]).map(|a| {
            let attrs = attr_map(a);
            let mut cfg = RetryAnnotationConfig::default();
            if let Some(v) = attrs.get("maxAttempts").and_then(|v| v.parse().ok()) {
                cfg.max_attempts = v;
            }
            if let Some(v) = attrs.get("initialIntervalMs").and_then(|v| v.parse().ok()) {
                cfg.initial_interval_ms = v;
            }
            if let Some(v) = attrs.get("maxIntervalMs").and_then(|v| v.parse().ok()) {
                cfg.max_interval_ms = v;
            }
            cfg
        })
    }

    pub fn timeout(annotations: &[Annotation]) -> Option<TimeoutConfig> {
        find(annotations, &["timeout"]).map(|a| {
            let attrs = attr_map(a);
            let seconds = a
                .value
                .as_ref()
                .and_then(|v| v.parse().ok())
                .or_else(|| attrs.get("seconds").and_then(|v| v.parse().ok()))
                .unwrap_or(60);
            TimeoutConfig { seconds }
        })
    }

    pub fn checkpoint(annotations: &[Annotation]) -> Option<CheckpointConfig> {
        find(annotations, &["checkpoint"]).map(|a| CheckpointConfig {
            description: a.value.clone(),
        })
    }

    pub fn priority(annotations: &[Annotation]) -> Option<PriorityConfig> {
        find(annotations, &["priority"]).map(|a| {
            let value = a.value.as_ref().and_then(|v| v.parse().ok()).unwrap_or(0);
            PriorityConfig { value }
        })
    }

    /// `@auto` — the edge auto-takes when its condition holds,
    /// without requiring agent input.
    pub fn is_auto(annotations: &[Annotation]) -> bool {
        find(annotations, &["auto"]).is_some()
    }

    /// `@errorHandling(...)` — found on whichever node declares it
    /// (there is exactly one machine-wide policy; spec.md §7 does not
    /// pin down which node carries it, so every node is scanned and
    /// the first match wins, in source order).
    pub fn error_handling(annotations: &[Annotation]) -> Option<ErrorHandlingMode> {
        let a = find(annotations, &["errorHandling"])?;
        let attrs = attr_map(a);
        a.value
            .as_deref()
            .or_else(|| a.qualified_value.as_deref())
            .or_else(|| attrs.get("mode").map(String::as_str))
            .and_then(ErrorHandlingMode::parse)
    }

    /// Logs and ignores any annotation whose name is not part of the
    /// recognized set. Non-fatal, unless `@strict` is also present.
    pub fn warn_unknown(annotations: &[Annotation], known: &[&str]) {
        for a in annotations {
            if !known.contains(&a.name.as_str()) {
                tracing::warn!(annotation = %a.name, "unrecognized annotation, ignoring");
            }
        }
    }
}

pub const KNOWN_NODE_ANNOTATIONS: &[&str] = &[
    "start", "meta", "strict", "retry", "timeout", "checkpoint", "priority", "errorHandling",
];

pub const KNOWN_EDGE_ANNOTATIONS: &[&str] = &[
    "auto", "async", "spawn", "parallel", "barrier", "join", "merge", "map", "foreach",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn ann(name: &str) -> Annotation {
        Annotation {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn join_is_barrier_with_merge() {
        let anns = vec![ann("join")];
        let cfg = AnnotationProcessor::barrier(&anns).unwrap();
        assert!(cfg.merge);
    }

    #[test]
    fn barrier_defaults_no_merge() {
        let anns = vec![ann("barrier")];
        let cfg = AnnotationProcessor::barrier(&anns).unwrap();
        assert!(!cfg.merge);
    }

    #[test]
    fn retry_defaults_are_three_attempts_one_second_thirty_second_cap() {
        let anns = vec![ann("retry")];
        let cfg = AnnotationProcessor::retry(&anns).unwrap();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.initial_interval_ms, 1_000);
        assert_eq!(cfg.max_interval_ms, 30_000);
    }

    #[test]
    fn async_and_parallel_are_distinct() {
        let anns = vec![ann("async")];
        assert!(AnnotationProcessor::async_spawn(&anns).is_some());
        assert!(AnnotationProcessor::parallel(&anns).is_none());
    }

    #[test]
    fn error_handling_parses_fail_fast_and_compensate() {
        let fail_fast = Annotation {
            name: "errorHandling".into(),
            value: Some("fail-fast".into()),
            ..Default::default()
        };
        assert_eq!(
            AnnotationProcessor::error_handling(&[fail_fast]),
            Some(ErrorHandlingMode::FailFast)
        );

        let compensate = Annotation {
            name: "errorHandling".into(),
            value: Some("compensate".into()),
            ..Default::default()
        };
        assert_eq!(
            AnnotationProcessor::error_handling(&[compensate]),
            Some(ErrorHandlingMode::Compensate)
        );

        assert_eq!(AnnotationProcessor::error_handling(&[]), None);
    }

    #[test]
    fn error_handling_default_mode_is_continue() {
        assert_eq!(ErrorHandlingMode::default(), ErrorHandlingMode::Continue);
    }
}

//! Engine configuration types.
//!
//! `EngineConfig` is resolved once (see `stepgraph_core::config`) and threaded
//! explicitly through graph preparation and execution. All fields have
//! defaults so an empty `stepgraph.toml` is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Retry policy for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    #[serde(default = "default_retry_limit")]
    pub limit: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Upper bound for the doubled delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_retry_limit() -> u32 {
    0
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl RetryConfig {
    pub fn limited(limit: u32) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Top-level configuration for graph execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global cap on concurrently running steps per container (None = no cap).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,

    /// Retry policy for steps that do not declare their own.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Default step timeout in seconds (None = no timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,

    /// Whether an expired step timeout is retryable.
    #[serde(default)]
    pub timeout_is_transient: bool,

    /// Root directory for per-step working directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Container image recorded on script templates that name none.
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Object-storage endpoint handed to storage adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_endpoint: Option<String>,

    /// Capacity of the run event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("stepgraph")
}

fn default_image() -> String {
    "python:3.11".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: None,
            retry: RetryConfig::default(),
            step_timeout_secs: None,
            timeout_is_transient: false,
            work_dir: default_work_dir(),
            default_image: default_image(),
            storage_endpoint: None,
            event_capacity: default_event_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert!(config.parallelism.is_none());
        assert_eq!(config.retry.limit, 0);
        assert!(!config.timeout_is_transient);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
parallelism = 4
step_timeout_secs = 30
timeout_is_transient = true
work_dir = "/var/tmp/sg"

[retry]
limit = 2
backoff_ms = 50
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.parallelism, Some(4));
        assert_eq!(config.step_timeout_secs, Some(30));
        assert!(config.timeout_is_transient);
        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/sg"));
        assert_eq!(config.retry.limit, 2);
        assert_eq!(config.retry.backoff_ms, 50);
        assert_eq!(config.retry.max_backoff_ms, 10_000);
    }
}

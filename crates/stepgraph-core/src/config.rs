//! Engine configuration loader.
//!
//! Reads `stepgraph.toml` from a directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed, then applies environment overrides.

use std::path::{Path, PathBuf};

use stepgraph_types::config::EngineConfig;

/// File name looked up by [`load_engine_config`].
pub const CONFIG_FILE: &str = "stepgraph.toml";

/// Overrides `EngineConfig::parallelism`.
pub const ENV_PARALLELISM: &str = "STEPGRAPH_PARALLELISM";

/// Overrides `EngineConfig::work_dir`.
pub const ENV_WORK_DIR: &str = "STEPGRAPH_WORK_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Strictly parse a configuration document.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    Ok(toml::from_str::<EngineConfig>(content)?)
}

/// Load engine configuration from `{dir}/stepgraph.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or malformed file: a warning is logged and defaults are used.
/// - `STEPGRAPH_PARALLELISM` and `STEPGRAPH_WORK_DIR` override the result.
///
/// # Errors
///
/// Only an unparseable environment override is an error.
pub async fn load_engine_config(dir: &Path) -> Result<EngineConfig, ConfigError> {
    let config = read_config_file(&dir.join(CONFIG_FILE)).await;
    apply_env_overrides(config, |var| std::env::var(var).ok())
}

async fn read_config_file(config_path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// Apply environment overrides read through `lookup`.
pub fn apply_env_overrides(
    mut config: EngineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<EngineConfig, ConfigError> {
    if let Some(value) = lookup(ENV_PARALLELISM) {
        let parsed: usize = value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnv {
            var: ENV_PARALLELISM,
            value: value.clone(),
            reason: e.to_string(),
        })?;
        if parsed == 0 {
            return Err(ConfigError::InvalidEnv {
                var: ENV_PARALLELISM,
                value,
                reason: "must be positive".to_string(),
            });
        }
        config.parallelism = Some(parsed);
    }
    if let Some(value) = lookup(ENV_WORK_DIR) {
        if !value.trim().is_empty() {
            config.work_dir = PathBuf::from(value);
        }
    }
    Ok(config)
}

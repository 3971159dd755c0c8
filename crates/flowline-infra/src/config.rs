//! Orchestrator configuration loader.
//!
//! Reads `config.toml` from the data directory and deserializes it into
//! [`OrchestratorConfig`]. Falls back to defaults when the file is missing
//! or malformed -- a broken config file degrades to documented defaults
//! instead of refusing to start, and the fallback is logged.

use std::path::Path;

use flowline_types::config::OrchestratorConfig;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns [`OrchestratorConfig::default()`].
/// - Unreadable or unparseable file: logs a warning, returns the default.
pub async fn load_config(data_dir: &Path) -> OrchestratorConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "no config.toml at {}, using defaults",
                config_path.display()
            );
            return OrchestratorConfig::default();
        }
        Err(err) => {
            tracing::warn!(
                "failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return OrchestratorConfig::default();
        }
    };

    match toml::from_str::<OrchestratorConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            OrchestratorConfig::default()
        }
    }
}

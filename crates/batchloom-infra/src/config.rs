//! Scheduler configuration loader.
//!
//! Reads `batchloom.toml` from the data directory and deserializes it into
//! [`SchedulerConfig`]. Falls back to the defaults when the file is missing,
//! unreadable, malformed, or fails validation.

use std::path::Path;

use batchloom_types::config::SchedulerConfig;

use crate::filesystem::config_path;

/// Load `{data_dir}/batchloom.toml`.
///
/// - Missing file: [`SchedulerConfig::default()`].
/// - Unreadable, unparsable or invalid file: a warning and the default.
pub async fn load_config(data_dir: &Path) -> SchedulerConfig {
    let path = config_path(data_dir);

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No batchloom.toml found at {}, using defaults", path.display());
            return SchedulerConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return SchedulerConfig::default();
        }
    };

    let config = match toml::from_str::<SchedulerConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            return SchedulerConfig::default();
        }
    };

    match config.validate() {
        Ok(()) => config,
        Err(err) => {
            tracing::warn!("Invalid {}: {err}, using defaults", path.display());
            SchedulerConfig::default()
        }
    }
}

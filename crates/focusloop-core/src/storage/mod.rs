pub mod analytics;
mod config;
pub mod migrations;
mod report;

pub use analytics::{
    normalize_description, AnalyticsStore, HistoryKey, SessionRecord, SessionStore, TaskHistory,
};
pub use config::{ClassifierConfig, Config, TimerConfig};
pub use report::{display_time, Report, TaskReport};

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns `~/.config/focusloop[-dev]/` based on FOCUSLOOP_ENV.
///
/// Set FOCUSLOOP_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("FOCUSLOOP_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("focusloop-dev")
    } else {
        base_dir.join("focusloop")
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}

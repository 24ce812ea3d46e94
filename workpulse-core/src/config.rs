//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/workpulse/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/workpulse/` (~/.config/workpulse/)
//! - Data: `$XDG_DATA_HOME/workpulse/` (~/.local/share/workpulse/)
//! - State/Logs: `$XDG_STATE_HOME/workpulse/` (~/.local/state/workpulse/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shortest backpause window accepted regardless of configuration.
pub const MIN_BACKPAUSE: Duration = Duration::from_secs(1);

/// Longest backpause window accepted regardless of configuration.
pub const MAX_BACKPAUSE: Duration = Duration::from_secs(60 * 60);

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Time tracking and persistence settings
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Daily total warning thresholds
    #[serde(default)]
    pub warnings: WarningConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Time tracking configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    /// Days of history to keep; 0 disables persistence
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Reclassify trailing activity as pause on long desktop locks
    #[serde(default = "default_autopause")]
    pub autopause: bool,

    /// Backpause window in minutes
    #[serde(default = "default_autopause_threshold_minutes")]
    pub autopause_threshold_minutes: u32,

    /// Minutes between checkpoint saves of the open activity segment
    #[serde(default = "default_checkpoint_interval_minutes")]
    pub checkpoint_interval_minutes: u32,

    /// Activity credited for machine start-up on the first start of a day
    #[serde(default)]
    pub boot_time_seconds: u32,

    /// Number of backup snapshots kept next to the store
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            autopause: default_autopause(),
            autopause_threshold_minutes: default_autopause_threshold_minutes(),
            checkpoint_interval_minutes: default_checkpoint_interval_minutes(),
            boot_time_seconds: 0,
            backup_keep: default_backup_keep(),
        }
    }
}

impl TrackingConfig {
    /// Backpause window, clamped to `[MIN_BACKPAUSE, MAX_BACKPAUSE]`.
    pub fn autopause_threshold(&self) -> Duration {
        clamp_backpause(Duration::from_secs(
            u64::from(self.autopause_threshold_minutes) * 60,
        ))
    }

    /// Checkpoint interval, never shorter than one minute.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.checkpoint_interval_minutes.max(1)) * 60)
    }

    pub fn boot_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.boot_time_seconds))
    }

    /// Whether anything is persisted at all
    pub fn persistence_enabled(&self) -> bool {
        self.retention_days > 0
    }
}

/// Clamp a backpause window into the accepted range.
pub fn clamp_backpause(threshold: Duration) -> Duration {
    threshold.clamp(MIN_BACKPAUSE, MAX_BACKPAUSE)
}

fn default_retention_days() -> u32 {
    90
}

fn default_autopause() -> bool {
    true
}

fn default_autopause_threshold_minutes() -> u32 {
    10
}

fn default_checkpoint_interval_minutes() -> u32 {
    5
}

fn default_backup_keep() -> usize {
    10
}

/// Thresholds for the daily activity total
#[derive(Debug, Deserialize, Clone)]
pub struct WarningConfig {
    /// Minutes of activity after which the total is reported as approaching the limit
    #[serde(default = "default_activity_warning_minutes")]
    pub activity_warning_minutes: u32,

    /// Minutes of activity after which the total is reported as exceeded
    #[serde(default = "default_activity_limit_minutes")]
    pub activity_limit_minutes: u32,
}

impl Default for WarningConfig {
    fn default() -> Self {
        Self {
            activity_warning_minutes: default_activity_warning_minutes(),
            activity_limit_minutes: default_activity_limit_minutes(),
        }
    }
}

impl WarningConfig {
    /// Validate configuration, returning error message if invalid
    ///
    /// A threshold of zero disables that warning and is never compared.
    pub fn validate(&self) -> Result<()> {
        let both_enabled = self.activity_warning_minutes > 0 && self.activity_limit_minutes > 0;
        if both_enabled && self.activity_warning_minutes > self.activity_limit_minutes {
            return Err(Error::Config(
                "warnings.activity_warning_minutes must not exceed warnings.activity_limit_minutes"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_activity_warning_minutes() -> u32 {
    8 * 60
}

fn default_activity_limit_minutes() -> u32 {
    10 * 60
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.warnings.validate()?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/workpulse/config.toml` (~/.config/workpulse/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("workpulse").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite store and its backups)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("workpulse")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("workpulse")
    }

    /// Returns the store file path
    ///
    /// `$XDG_DATA_HOME/workpulse/workpulse.db` (~/.local/share/workpulse/workpulse.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("workpulse.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tracking.retention_days, 90);
        assert!(config.tracking.autopause);
        assert_eq!(config.tracking.checkpoint_interval_minutes, 5);
        assert_eq!(config.tracking.boot_time_seconds, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[tracking]
retention_days = 0
autopause_threshold_minutes = 15
boot_time_seconds = 120

[warnings]
activity_warning_minutes = 420

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.tracking.retention_days, 0);
        assert!(!config.tracking.persistence_enabled());
        assert_eq!(config.tracking.autopause_threshold(), Duration::from_secs(900));
        assert_eq!(config.tracking.boot_time(), Duration::from_secs(120));
        assert_eq!(config.warnings.activity_warning_minutes, 420);
        assert_eq!(config.warnings.activity_limit_minutes, 600);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_backpause_threshold_is_clamped() {
        let mut tracking = TrackingConfig {
            autopause_threshold_minutes: 0,
            ..Default::default()
        };
        assert_eq!(tracking.autopause_threshold(), MIN_BACKPAUSE);

        tracking.autopause_threshold_minutes = 24 * 60;
        assert_eq!(tracking.autopause_threshold(), MAX_BACKPAUSE);
    }

    #[test]
    fn test_checkpoint_interval_floor() {
        let tracking = TrackingConfig {
            checkpoint_interval_minutes: 0,
            ..Default::default()
        };
        assert_eq!(tracking.checkpoint_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_warning_validation() {
        assert!(WarningConfig::default().validate().is_ok());

        let config = WarningConfig {
            activity_warning_minutes: 700,
            activity_limit_minutes: 600,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threshold_disables_warning() {
        let config: Config = toml::from_str("[warnings]\nactivity_limit_minutes = 0").unwrap();
        assert_eq!(config.warnings.activity_warning_minutes, 480);
        assert!(config.warnings.validate().is_ok());

        let config = WarningConfig {
            activity_warning_minutes: 0,
            activity_limit_minutes: 600,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tracking]\nretention_days = 7\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.tracking.retention_days, 7);

        std::fs::write(&path, "[tracking\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}

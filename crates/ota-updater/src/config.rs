//! Configuration structures for the update controller.
//!
//! Defines the running build identity, download pacing, network settings,
//! and feed merge policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Main updater configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Directory receiving downloaded packages
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// JSON file holding the persisted update records
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Capacity of the change notification channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Identity of the running build
    #[serde(default)]
    pub build: BuildInfo,

    /// Download pacing
    #[serde(default)]
    pub download: DownloadConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Feed merge policy
    #[serde(default)]
    pub feed: FeedPolicy,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            state_file: default_state_file(),
            event_capacity: default_event_capacity(),
            build: BuildInfo::default(),
            download: DownloadConfig::default(),
            network: NetworkConfig::default(),
            feed: FeedPolicy::default(),
        }
    }
}

impl UpdaterConfig {
    /// Configuration rooted at `data_dir`, with packages under
    /// `data_dir/updates` and records in `data_dir/updates.json`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>, build: BuildInfo) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            download_dir: data_dir.join("updates"),
            state_file: data_dir.join("updates.json"),
            build,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the controller cannot work with.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.event_capacity == 0 {
            return Err(UpdateError::ConfigError(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.download.eta_window_samples < 2 {
            return Err(UpdateError::ConfigError(
                "eta_window_samples must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity of the build currently running on the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Platform version string (compared case-insensitively)
    #[serde(default)]
    pub version: String,

    /// Build timestamp in seconds since epoch
    #[serde(default)]
    pub timestamp: i64,

    /// Device codename
    #[serde(default)]
    pub device: String,
}

/// Pacing of download progress reports and ETA smoothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Minimum time between two progress notifications
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Trailing window used for the throughput estimate
    #[serde(default = "default_eta_window_secs")]
    pub eta_window_secs: u64,

    /// Maximum number of samples kept in the window
    #[serde(default = "default_eta_window_samples")]
    pub eta_window_samples: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval(),
            eta_window_secs: default_eta_window_secs(),
            eta_window_samples: default_eta_window_samples(),
        }
    }
}

impl DownloadConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn eta_window(&self) -> Duration {
        Duration::from_secs(self.eta_window_secs)
    }
}

/// Network configuration for downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Read timeout for streaming in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// User agent string
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Proxy URL (empty = system proxy)
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            read_timeout_seconds: default_read_timeout(),
            user_agent: default_user_agent(),
            proxy: None,
        }
    }
}

/// What happens to records that vanish from the feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Keep the record, set `available_online = false`
    #[default]
    FlagOnly,
    /// Drop records with nothing on disk and no work attached; flag the rest
    RemoveIdle,
}

/// Order of changelog sections in a merged entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangelogOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Feed merge policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedPolicy {
    #[serde(default)]
    pub stale_policy: StalePolicy,

    #[serde(default)]
    pub changelog_order: ChangelogOrder,

    /// Remove the package file once the running build includes it
    #[serde(default)]
    pub auto_delete_installed: bool,
}

// Default value functions for serde
fn default_download_dir() -> PathBuf {
    default_data_dir().join("updates")
}

fn default_state_file() -> PathBuf {
    default_data_dir().join("updates.json")
}

fn default_event_capacity() -> usize {
    256
}

fn default_progress_interval() -> u64 {
    500
}

fn default_eta_window_secs() -> u64 {
    10
}

fn default_eta_window_samples() -> usize {
    20
}

fn default_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("ota-updater/{}", env!("CARGO_PKG_VERSION"))
}

/// Platform-appropriate data directory.
fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(data_home).join("ota-updater");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("ota-updater");
        }
    }

    PathBuf::from(".").join("ota-updater")
}

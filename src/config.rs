//! Dashboard configuration stored in ~/.leaddesk/config.json.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "LEADDESK_CONFIG";

/// Sync and board settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeskConfig {
    /// Board refresh interval while the board is visible. 0 disables polling.
    #[serde(default = "default_board_poll_ms")]
    pub board_poll_ms: u64,
    /// Open-conversation refresh interval. 0 disables polling.
    #[serde(default = "default_timeline_poll_ms")]
    pub timeline_poll_ms: u64,
    /// Upper bound on a single fetch before it counts as a transient failure.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// How far after a pending reply a server row may be and still confirm it.
    #[serde(default = "default_confirm_window_secs")]
    pub confirm_window_secs: i64,
    /// Subscribe to the store's change feed when it has one.
    #[serde(default = "default_true")]
    pub push_enabled: bool,
    /// Title of the bucket holding leads without a known stage.
    #[serde(default = "default_unclassified_label")]
    pub unclassified_label: String,
    /// Column order used until the stage list has been read from the store.
    #[serde(default)]
    pub stages: Vec<String>,
    /// Capacity of the signal broadcast channel.
    #[serde(default = "default_signal_buffer")]
    pub signal_buffer: usize,
}

fn default_board_poll_ms() -> u64 {
    15_000
}

fn default_timeline_poll_ms() -> u64 {
    1_000
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_confirm_window_secs() -> i64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_unclassified_label() -> String {
    "Sin estado".to_string()
}

fn default_signal_buffer() -> usize {
    64
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            board_poll_ms: default_board_poll_ms(),
            timeline_poll_ms: default_timeline_poll_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            confirm_window_secs: default_confirm_window_secs(),
            push_enabled: true,
            unclassified_label: default_unclassified_label(),
            stages: Vec::new(),
            signal_buffer: default_signal_buffer(),
        }
    }
}

impl DeskConfig {
    pub fn board_poll_interval(&self) -> Option<Duration> {
        (self.board_poll_ms > 0).then(|| Duration::from_millis(self.board_poll_ms))
    }

    pub fn timeline_poll_interval(&self) -> Option<Duration> {
        (self.timeline_poll_ms > 0).then(|| Duration::from_millis(self.timeline_poll_ms))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms.max(1))
    }

    pub fn confirm_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.confirm_window_secs.max(0))
    }
}

/// Get the canonical config file path (~/.leaddesk/config.json)
pub fn config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".leaddesk").join("config.json"))
}

/// Load config from a specific file. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<DeskConfig, String> {
    if !path.exists() {
        log::debug!("Config: {} not found, using defaults", path.display());
        return Ok(DeskConfig::default());
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
}

/// Load config from the canonical location.
pub fn load_config() -> Result<DeskConfig, String> {
    let path = config_path()?;
    load_config_from(&path)
}

//! Startup configuration: channels, panels and shared constants.
//!
//! ```json
//! {
//!   "channels": [{ "name": "sysmon", "capacity": 16, "timeout_ms": 1000 }],
//!   "panels": [{ "name": "log", "kind": "logger", "channels": ["sysmon"] }],
//!   "constants": { "refresh_hint": 2 }
//! }
//! ```

use crate::panel_manager::HOST_CALL_CHANNEL;
use capy_bus::{ChannelOptions, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read-only values shared with every panel.
pub type Constants = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate panel in config: {0}")]
    DuplicatePanel(String),

    #[error("Panel '{panel}' subscribes to undefined channel '{channel}'")]
    UndefinedChannel { panel: String, channel: String },

    #[error("Invalid definition '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DashConfig {
    pub channels: Vec<ChannelDef>,
    pub panels: Vec<PanelDef>,
    pub constants: Constants,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelDef {
    pub name: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Omitted means unbounded.
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl ChannelDef {
    pub fn options(&self) -> ChannelOptions {
        ChannelOptions {
            capacity: self.capacity,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PanelDef {
    pub name: String,
    pub kind: String,
    #[serde(default = "default_show")]
    pub show: bool,
    #[serde(default)]
    pub pos: DockPosition,
    /// Channels to subscribe to, in order.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Kind-specific arguments, passed to the panel factory untouched.
    #[serde(default)]
    pub args: Value,
}

/// Where the host docks a panel.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DockPosition {
    Right,
    Top,
    Bottom,
    /// Also used for unrecognised positions.
    #[default]
    #[serde(other)]
    Left,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_show() -> bool {
    true
}

/// `$XDG_CONFIG_HOME/CapyDash/config.json`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let xdg_config = std::env::var("XDG_CONFIG_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_default();
        format!("{}/.config", home)
    });
    PathBuf::from(xdg_config).join("CapyDash").join("config.json")
}

/// Read, parse and validate a config file.
pub fn load(path: &Path) -> Result<DashConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_json(&text)
}

pub fn from_json(text: &str) -> Result<DashConfig, ConfigError> {
    let config: DashConfig = serde_json::from_str(text)?;
    config.validate()?;
    Ok(config)
}

impl DashConfig {
    /// Checks everything that can be checked without a bus. Duplicate channel
    /// names are left to the bus, which rejects them at creation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    name: channel.name.clone(),
                    reason: "channel name must not be empty".to_string(),
                });
            }
            if channel.name == HOST_CALL_CHANNEL {
                return Err(ConfigError::Invalid {
                    name: channel.name.clone(),
                    reason: "reserved for host calls".to_string(),
                });
            }
        }
        let known: HashSet<&str> = self.channels.iter().map(|c| c.name.as_str()).collect();

        let mut panels = HashSet::new();
        for panel in &self.panels {
            if panel.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    name: panel.kind.clone(),
                    reason: "panel name must not be empty".to_string(),
                });
            }
            if !panels.insert(panel.name.as_str()) {
                return Err(ConfigError::DuplicatePanel(panel.name.clone()));
            }
            if let Some(missing) = panel.channels.iter().find(|c| !known.contains(c.as_str())) {
                return Err(ConfigError::UndefinedChannel {
                    panel: panel.name.clone(),
                    channel: missing.clone(),
                });
            }
        }
        Ok(())
    }
}

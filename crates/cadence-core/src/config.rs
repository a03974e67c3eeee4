//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }
}

/// Scan-loop and engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between scan ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Max concurrently processed due instances per tick.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Instance store path (sqlite).
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Hard cap on catch-up loop steps per instance; a breach
    /// deactivates the instance instead of spinning forever.
    #[serde(default = "default_catchup_step_guard")]
    pub catchup_step_guard: u64,
}

fn default_tick_secs() -> u64 {
    60
}
fn default_max_concurrent() -> usize {
    8
}
fn default_db_path() -> String {
    CadenceConfig::home_dir()
        .join("instances.db")
        .to_string_lossy()
        .into_owned()
}
fn default_catchup_step_guard() -> u64 {
    100_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            max_concurrent: default_max_concurrent(),
            db_path: default_db_path(),
            catchup_step_guard: default_catchup_step_guard(),
        }
    }
}

/// Delivery channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub webhook: Option<WebhookChannelConfig>,
    #[serde(default)]
    pub telegram: Option<TelegramChannelConfig>,
}

/// Generic HTTP webhook channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Telegram Bot API channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChannelConfig {
    pub bot_token: String,
    /// Default chat when a recipient address is not a chat id.
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_toml() {
        let config: CadenceConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.tick_secs, 60);
        assert_eq!(config.engine.max_concurrent, 8);
        assert!(config.channel.webhook.is_none());
    }

    #[test]
    fn partial_section_fills_defaults() {
        let config: CadenceConfig = toml::from_str(
            "[engine]\ntick_secs = 15\n\n[channel.webhook]\nurl = \"http://localhost:9000/sms\"\n",
        )
        .unwrap();
        assert_eq!(config.engine.tick_secs, 15);
        assert_eq!(config.engine.max_concurrent, 8);
        let webhook = config.channel.webhook.unwrap();
        assert!(webhook.enabled);
        assert_eq!(webhook.url, "http://localhost:9000/sms");
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    // Backend connection
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Journal autosave
    #[serde(default = "default_autosave_delay_secs")]
    pub autosave_delay_secs: u64,

    // Conversation resync policy: refetch the authoritative session once the
    // local log reaches a multiple of this many messages
    #[serde(default = "default_resync_every_messages")]
    pub resync_every_messages: usize,

    // Opt-in retry policy for plain reads
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    // Mood trend window
    #[serde(default = "default_mood_trend_days")]
    pub mood_trend_days: u32,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_autosave_delay_secs() -> u64 {
    3
}

fn default_resync_every_messages() -> usize {
    5
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_mood_trend_days() -> u32 {
    7
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            autosave_delay_secs: default_autosave_delay_secs(),
            resync_every_messages: default_resync_every_messages(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            mood_trend_days: default_mood_trend_days(),
        }
    }
}

impl ClientConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("haven_config.toml")
    }

    /// Load config from haven_config.toml (next to executable), falling back
    /// to the XDG config directory, then to defaults + env vars
    pub fn load() -> Self {
        let path = Self::config_path();
        if let Some(config) = Self::load_from_path(&path) {
            return config;
        }

        if let Some(xdg_path) = dirs::config_dir().map(|dir| dir.join("haven/config.toml")) {
            if let Some(config) = Self::load_from_path(&xdg_path) {
                return config;
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    fn load_from_path(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        match toml::from_str::<ClientConfig>(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse {:?}: {}", path, e);
                None
            }
        }
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("HAVEN_API_BASE_URL") {
            if !url.trim().is_empty() {
                config.api_base_url = url;
            }
        }

        if let Ok(timeout) = env::var("HAVEN_REQUEST_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.request_timeout_secs = seconds;
            }
        }

        if let Ok(delay) = env::var("HAVEN_AUTOSAVE_DELAY_SECS") {
            if let Ok(seconds) = delay.parse() {
                config.autosave_delay_secs = seconds;
            }
        }

        if let Ok(every) = env::var("HAVEN_RESYNC_EVERY_MESSAGES") {
            if let Ok(count) = every.parse() {
                config.resync_every_messages = count;
            }
        }

        if let Ok(days) = env::var("HAVEN_MOOD_TREND_DAYS") {
            if let Ok(days) = days.parse() {
                config.mood_trend_days = days;
            }
        }

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_secs(self.autosave_delay_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

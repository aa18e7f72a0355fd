//! Configuration Module
//!
//! Settings read from `config.toml` in the application data directory,
//! with environment overrides for development.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::librelink::DEFAULT_BASE_URL;
use crate::messages::Locale;

pub const APP_DIR_NAME: &str = "GlucoseTray";
pub const CONFIG_FILE_NAME: &str = "config.toml";

const ENV_API_URL: &str = "GLUCOSE_TRAY_API_URL";
const ENV_POLL_SECS: &str = "GLUCOSE_TRAY_POLL_SECS";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// LibreLinkUp API root, before any regional redirect
    pub api_base_url: String,
    /// Protocol version prefilled in the login form
    pub default_protocol_version: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub locale: Locale,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            default_protocol_version: "4.12.0".to_string(),
            poll_interval_secs: 90,
            request_timeout_secs: 30,
            locale: Locale::Es,
        }
    }
}

impl AppConfig {
    /// Load from the data directory, falling back to defaults, then apply env overrides
    pub fn load(data_dir: &Path) -> Self {
        let mut config = Self::load_from_path(data_dir.join(CONFIG_FILE_NAME));
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load configuration from a file, defaults if it is missing or invalid
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Invalid config file {:?}: {}. Using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        if !self.api_base_url.starts_with("http") {
            return Err(ConfigError::Invalid(format!("bad api_base_url: {}", self.api_base_url)));
        }
        Ok(())
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(raw) = lookup(ENV_POLL_SECS) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => self.poll_interval_secs = secs,
                _ => warn!("Ignoring invalid {}={}", ENV_POLL_SECS, raw),
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Root directory for config, credentials and logs
pub fn data_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

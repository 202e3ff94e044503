//! Configuration management for the gateway
//!
//! Configuration is loaded from `~/.zpwoot/config.json` (or an explicit path)
//! with environment variable overrides following the pattern
//! `ZPWOOT_SECTION_KEY`.

mod types;
mod validate;

pub use types::*;

use crate::error::Result;
use std::path::{Path, PathBuf};

impl Config {
    /// Returns the gateway configuration directory path (~/.zpwoot)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".zpwoot")
    }

    /// Returns the path to the config file (~/.zpwoot/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Resolved database path: configured value or `~/.zpwoot/zpwoot.db`.
    pub fn db_path(&self) -> PathBuf {
        if self.storage.db_path.is_empty() {
            Self::dir().join("zpwoot.db")
        } else {
            PathBuf::from(&self.storage.db_path)
        }
    }

    /// Resolved media cache directory: configured value or `~/.zpwoot/media`.
    pub fn media_dir(&self) -> PathBuf {
        if self.media.cache_dir.is_empty() {
            Self::dir().join("media")
        } else {
            PathBuf::from(&self.media.cache_dir)
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: ZPWOOT_SECTION_KEY
    fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(val) = std::env::var("ZPWOOT_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("ZPWOOT_SERVER_PORT") {
            if let Ok(v) = val.parse() {
                self.server.port = v;
            }
        }

        // Storage
        if let Ok(val) = std::env::var("ZPWOOT_STORAGE_DB_PATH") {
            self.storage.db_path = val;
        }

        // Bridge
        if let Ok(val) = std::env::var("ZPWOOT_BRIDGE_BASE_URL") {
            self.bridge.base_url = val;
        }

        // Webhooks
        if let Ok(val) = std::env::var("ZPWOOT_WEBHOOKS_QUEUE_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.webhooks.queue_capacity = v;
            }
        }
        if let Ok(val) = std::env::var("ZPWOOT_WEBHOOKS_WORKERS") {
            if let Ok(v) = val.parse() {
                self.webhooks.workers = v;
            }
        }
        if let Ok(val) = std::env::var("ZPWOOT_WEBHOOKS_MAX_ATTEMPTS") {
            if let Ok(v) = val.parse() {
                self.webhooks.max_attempts = v;
            }
        }

        // Media
        if let Ok(val) = std::env::var("ZPWOOT_MEDIA_CACHE_DIR") {
            self.media.cache_dir = val;
        }
        if let Ok(val) = std::env::var("ZPWOOT_MEDIA_TTL_SECS") {
            if let Ok(v) = val.parse() {
                self.media.ttl_secs = v;
            }
        }

        // Logging
        if let Ok(val) = std::env::var("ZPWOOT_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }
}

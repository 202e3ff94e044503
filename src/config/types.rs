//! Configuration type definitions for the gateway
//!
//! This module defines all configuration structs used throughout the gateway.
//! All types implement serde traits for JSON serialization and have sensible defaults.

use serde::{Deserialize, Serialize};

/// Main configuration struct for the gateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP API server configuration
    pub server: ServerConfig,
    /// SQLite storage configuration
    pub storage: StorageConfig,
    /// External WhatsApp protocol bridge configuration
    pub bridge: BridgeConfig,
    /// Webhook delivery subsystem configuration
    pub webhooks: WebhookDeliveryConfig,
    /// Media cache configuration
    pub media: MediaConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// SQLite storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file. Empty means `~/.zpwoot/zpwoot.db`.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
        }
    }
}

/// External WhatsApp protocol bridge configuration.
///
/// The gateway does not implement the WhatsApp wire protocol itself; it talks
/// to a bridge process over WebSocket, one connection per session. The bridge
/// handles encryption, pairing, and session persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base WebSocket URL of the bridge (e.g. "ws://localhost:3001").
    /// Each session connects to `<base_url>/session/<session-id>`.
    pub base_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:3001".to_string(),
        }
    }
}

/// Webhook delivery subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookDeliveryConfig {
    /// Capacity of the process-wide delivery queue
    pub queue_capacity: usize,
    /// Number of delivery worker tasks
    pub workers: usize,
    /// Maximum delivery attempts per task (first try + retries)
    pub max_attempts: u32,
    /// Per-attempt HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for WebhookDeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            workers: 5,
            max_attempts: 3,
            timeout_secs: 30,
        }
    }
}

/// Media cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory for cached media files. Empty means `~/.zpwoot/media`.
    pub cache_dir: String,
    /// Time-to-live for cached entries, in seconds
    pub ttl_secs: u64,
    /// Interval between cache expiry sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 15 * 60,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable text
    #[default]
    Pretty,
    /// Structured JSON lines for log aggregators
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level filter when `RUST_LOG` is unset (e.g. "info")
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Optional log file path; stdout when unset
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

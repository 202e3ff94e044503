//! Configuration validation.

use crate::error::{GatewayError, Result};

use super::Config;

impl Config {
    /// Validates the loaded configuration before the gateway starts.
    ///
    /// Returns the first problem found; a bad value here would otherwise
    /// surface much later as a confusing runtime failure.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(GatewayError::Config(
                "server.port must be non-zero".to_string(),
            ));
        }

        let url = self.bridge.base_url.trim();
        if url.is_empty() {
            return Err(GatewayError::Config(
                "bridge.base_url must not be empty".to_string(),
            ));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(GatewayError::Config(format!(
                "bridge.base_url must be a ws:// or wss:// URL, got {}",
                url
            )));
        }

        if self.webhooks.queue_capacity == 0 {
            return Err(GatewayError::Config(
                "webhooks.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.webhooks.workers == 0 || self.webhooks.workers > 64 {
            return Err(GatewayError::Config(
                "webhooks.workers must be between 1 and 64".to_string(),
            ));
        }
        if self.webhooks.max_attempts == 0 {
            return Err(GatewayError::Config(
                "webhooks.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.webhooks.timeout_secs == 0 {
            return Err(GatewayError::Config(
                "webhooks.timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.media.ttl_secs == 0 {
            return Err(GatewayError::Config(
                "media.ttl_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

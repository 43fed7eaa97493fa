//! `[sync]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [sync]
//! server = "ws://127.0.0.1:4005"   # Relay base URL, session appended as /map/<id>
//! resync_interval_secs = 300        # Full resync period while connected
//! max_backoff_secs = 120            # Reconnect delay cap
//! initial_backoff_ms = 100          # First reconnect delay
//! presence_timeout_secs = 30        # Drop silent peers after this long
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sync::{Backoff, SyncOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay base URL. Only `ws://` is supported.
    pub server: String,

    pub resync_interval_secs: u64,

    pub max_backoff_secs: u64,

    pub initial_backoff_ms: u64,

    pub presence_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:4005".into(),
            resync_interval_secs: 300,
            max_backoff_secs: 120,
            initial_backoff_ms: 100,
            presence_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            presence_timeout: Duration::from_secs(self.presence_timeout_secs),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_secs(self.max_backoff_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::test_parse_config;

    #[test]
    fn test_sync_config_defaults() {
        let config = test_parse_config("");
        assert_eq!(config.sync.server, "ws://127.0.0.1:4005");
        assert_eq!(config.sync.options().resync_interval, Duration::from_secs(300));
        assert_eq!(config.sync.options().presence_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_sync_config_partial_override() {
        let config = test_parse_config("[sync]\nserver = \"ws://maps.example.com\"\nmax_backoff_secs = 10");
        assert_eq!(config.sync.server, "ws://maps.example.com");
        assert_eq!(config.sync.max_backoff_secs, 10);
        // untouched fields keep defaults
        assert_eq!(config.sync.initial_backoff_ms, 100);

        let mut backoff = config.sync.backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}

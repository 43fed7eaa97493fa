//! Configuration management for `topomap.toml`.
//!
//! # Module Structure
//!
//! ```text
//! config/
//! ├── section/       # [sync], [cache], [render], [relay]
//! ├── error.rs       # ConfigError
//! ├── util.rs        # Config file lookup
//! └── mod.rs         # TopomapConfig (this file)
//! ```
//!
//! # Sections
//!
//! | Section    | Purpose                                          |
//! |------------|--------------------------------------------------|
//! | `[sync]`   | Relay URL, resync period, backoff, presence      |
//! | `[cache]`  | Durable local cache                              |
//! | `[render]` | Headless renderer frame tick                     |
//! | `[relay]`  | Relay server bind address                        |
//!
//! Every section and field is optional. Without a config file the defaults
//! apply. Command-line flags override file values.

mod error;
pub mod section;
mod util;

pub use error::ConfigError;
pub use section::{CacheConfig, RelayConfig, RenderConfig, SyncConfig};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{Cli, Commands};
use crate::log;
use crate::sync::transport::session_url;
use util::find_config_file;

/// Root configuration structure representing topomap.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopomapConfig {
    /// Absolute path to the config file, if one was found
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// Directory relative paths resolve against
    #[serde(skip)]
    pub root: PathBuf,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

impl TopomapConfig {
    /// Load configuration for a CLI invocation.
    ///
    /// Searches upward from cwd for the config file; falls back to defaults
    /// rooted at cwd when there is none.
    pub fn load(cli: &Cli) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current working directory")?;

        let mut config = match find_config_file(&cli.config) {
            Some(path) => {
                let mut config = Self::from_path(&path)?;
                config.root = path.parent().map(Path::to_path_buf).unwrap_or(cwd);
                config.config_path = Some(path);
                config
            }
            None => Self {
                root: cwd,
                ..Self::default()
            },
        };

        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file path with unknown field detection.
    fn from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            Self::print_unknown_fields_warning(&ignored, path);
        }
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    fn print_unknown_fields_warning(fields: &[String], path: &Path) {
        let display_path = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());
        log!("warning"; "unknown fields in {} are ignored:", display_path);
        for field in fields {
            log!("warning"; "  {}", field);
        }
    }

    /// Command-line flags win over file values.
    fn apply_cli(&mut self, cli: &Cli) {
        match &cli.command {
            Commands::Join {
                server, no_cache, ..
            } => {
                if let Some(server) = server {
                    self.sync.server = server.clone();
                }
                if *no_cache {
                    self.cache.enable = false;
                }
            }
            Commands::Relay { interface, port } => {
                if let Some(interface) = interface {
                    self.relay.interface = *interface;
                }
                if let Some(port) = port {
                    self.relay.port = *port;
                }
            }
            Commands::Style { .. } => {}
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.resync_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sync.resync_interval_secs must be greater than 0".into(),
            ));
        }
        if self.sync.max_backoff_secs.saturating_mul(1000) < self.sync.initial_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "sync.max_backoff_secs ({}s) is below sync.initial_backoff_ms ({}ms)",
                self.sync.max_backoff_secs, self.sync.initial_backoff_ms
            )));
        }
        if self.sync.presence_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "sync.presence_timeout_secs must be greater than 0".into(),
            ));
        }
        session_url(&self.sync.server, "check")
            .map_err(|e| ConfigError::Validation(format!("sync.server: {e}")))?;
        Ok(())
    }

    /// Cache directory, resolved against the config root.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(&self.cache.dir)
    }
}

#[cfg(test)]
pub fn test_parse_config(extra: &str) -> TopomapConfig {
    let (parsed, ignored) = TopomapConfig::parse_with_ignored(extra).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_unknown_fields_are_collected() {
        let (config, ignored) =
            TopomapConfig::parse_with_ignored("[sync]\nserver = \"ws://x\"\nspeed = 3\n[extra]\na = 1")
                .unwrap();
        assert_eq!(config.sync.server, "ws://x");
        assert_eq!(ignored, vec!["sync.speed", "extra"]);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(matches!(
            TopomapConfig::parse_with_ignored("[sync\n"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(test_parse_config("").validate().is_ok());

        let zero = test_parse_config("[sync]\nresync_interval_secs = 0");
        assert!(matches!(zero.validate(), Err(ConfigError::Validation(_))));

        let backoff = test_parse_config("[sync]\nmax_backoff_secs = 1\ninitial_backoff_ms = 5000");
        assert!(matches!(backoff.validate(), Err(ConfigError::Validation(_))));

        let scheme = test_parse_config("[sync]\nserver = \"http://example.com\"");
        assert!(matches!(scheme.validate(), Err(ConfigError::Validation(_))));

        let tls = test_parse_config("[sync]\nserver = \"wss://example.com\"");
        assert!(matches!(tls.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["topomap", "join", "s1", "--server", "ws://x.org", "--no-cache"]);
        let mut config = test_parse_config("[sync]\nserver = \"ws://file\"");
        config.apply_cli(&cli);
        assert_eq!(config.sync.server, "ws://x.org");
        assert!(!config.cache.enable);

        let cli = Cli::parse_from(["topomap", "relay", "--port", "9001"]);
        let mut config = test_parse_config("[relay]\nport = 7000");
        config.apply_cli(&cli);
        assert_eq!(config.relay.port, 9001);
    }

    #[test]
    fn test_cache_dir_resolves_against_root() {
        let mut config = test_parse_config("[cache]\ndir = \"c\"");
        config.root = PathBuf::from("/srv/maps");
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/maps/c"));
    }
}

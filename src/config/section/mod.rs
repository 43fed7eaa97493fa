//! Configuration sections of `topomap.toml`.
//!
//! # Example
//!
//! ```toml
//! [cache]
//! enable = true
//! dir = ".topomap/cache"      # Relative to the config file
//!
//! [render]
//! frame_interval_ms = 16      # Frame tick of the headless renderer
//! sprite_url = "/sprite"       # Icon images, registered as <sprite_url>/<name>.png
//!
//! [relay]
//! interface = "127.0.0.1"
//! port = 4005
//! ```

mod sync;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use sync::SyncConfig;

/// Local durable cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enable: bool,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable: true,
            dir: PathBuf::from(".topomap/cache"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub frame_interval_ms: u64,

    /// Base URL of icon images, without a trailing slash.
    pub sprite_url: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            sprite_url: "/sprite".into(),
        }
    }
}

impl RenderConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Session relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Network interface to bind.
    /// - `127.0.0.1` (default): localhost only
    /// - `0.0.0.0`: all interfaces
    pub interface: IpAddr,

    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interface: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 4005,
        }
    }
}

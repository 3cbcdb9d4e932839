//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - A TOML file (`MURMUR_CONFIG`, or the first of the default paths found)
//! - Environment variables (`MURMUR_*`, `__` between nested keys)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MURMUR_CONFIG";

const DEFAULT_PATHS: [&str; 3] = [
    "murmur.toml",
    "/etc/murmur/murmur.toml",
    "~/.config/murmur/murmur.toml",
];

/// Top-level settings. Every section falls back to its defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
    pub heartbeat: HeartbeatConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Route serving the WebSocket upgrade.
    pub websocket_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upgrades beyond this many open sockets get 503.
    pub max_connections: usize,
    /// Largest inbound text frame, in bytes.
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Milliseconds between server pings.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `:memory:` keeps everything in memory.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Port of the Prometheus listener.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: "/ws".into(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_message_size: murmur_protocol::codec::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "murmur.db".into(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the file and environment layers.
    ///
    /// # Errors
    ///
    /// Returns an error if `MURMUR_CONFIG` names a missing file, or if a file
    /// or variable cannot be parsed.
    pub fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(explicit) => Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref())),
            Err(_) => DEFAULT_PATHS
                .iter()
                .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
                .find(|path| path.exists()),
        };

        Self::build(path.as_deref(), environment())
    }

    /// Merge an optional file with an environment source.
    fn build(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            tracing::info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(env)
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Listening address built from `host` and `port`.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid bind host {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Database path with `~` expanded.
    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.path).as_ref())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("MURMUR")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

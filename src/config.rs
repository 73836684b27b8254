use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::amqp::{ConnectionSettings, Endpoint, DEFAULT_RECONNECT_BACKOFF};
use crate::cache::DEFAULT_MAX_TTL;
use crate::incoming::DataSource;

/// Top-level configuration for the telemetry gateway.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Suffix for the AMQP container id and link name.
    #[serde(default = "default_unique_name")]
    pub unique_name: String,

    /// Bus endpoints to consume from, one connection each.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    /// Link credit window. 0 receives one message at a time. Default: 0.
    #[serde(default)]
    pub prefetch: u32,

    /// Stop each connection after this many messages. Default: unbounded.
    #[serde(default)]
    pub message_count: Option<u64>,

    /// Message buffer capacity per connection. Default: 100.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Delay between reconnect attempts. Default: 2s.
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Sample cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Scrape endpoint configuration.
    #[serde(default)]
    pub exporter: ExporterConfig,
}

/// One bus endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Endpoint URL, e.g. "amqp://127.0.0.1:5672/collectd/telemetry".
    #[serde(default)]
    pub url: String,

    /// Message format published on this endpoint.
    pub data_source: DataSource,
}

/// Sample cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Idle time after which a shard's stale items are reaped. Default: 300s.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

/// Scrape endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Listen address. Default: "127.0.0.1:8081".
    #[serde(default = "default_exporter_addr")]
    pub addr: String,

    /// Attach producer collection times to exported samples.
    #[serde(default)]
    pub use_timestamp: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_unique_name() -> String {
    "telemetry-gateway".to_string()
}

fn default_buffer_size() -> usize {
    100
}

fn default_reconnect_backoff() -> Duration {
    DEFAULT_RECONNECT_BACKOFF
}

fn default_cache_ttl() -> Duration {
    DEFAULT_MAX_TTL
}

fn default_exporter_addr() -> String {
    "127.0.0.1:8081".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            unique_name: default_unique_name(),
            connections: Vec::new(),
            prefetch: 0,
            message_count: None,
            buffer_size: default_buffer_size(),
            reconnect_backoff: default_reconnect_backoff(),
            cache: CacheConfig::default(),
            exporter: ExporterConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            addr: default_exporter_addr(),
            use_timestamp: false,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML (or JSON) file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.connections.is_empty() {
            bail!("at least one entry in connections is required");
        }

        for (i, conn) in self.connections.iter().enumerate() {
            if conn.url.trim().is_empty() {
                bail!("connections[{i}].url is required");
            }
            Endpoint::parse(&conn.url).with_context(|| format!("connections[{i}].url"))?;
        }

        if self.unique_name.is_empty() {
            bail!("unique_name must not be empty");
        }

        if self.buffer_size == 0 {
            bail!("buffer_size must be positive");
        }

        if self.reconnect_backoff.is_zero() {
            bail!("reconnect_backoff must be positive");
        }

        if self.message_count == Some(0) {
            bail!("message_count must be positive when set");
        }

        if self.cache.ttl < Duration::from_secs(1) {
            bail!("cache.ttl must be at least 1s");
        }

        if self.exporter.addr.is_empty() {
            bail!("exporter.addr is required");
        }

        Ok(())
    }

    /// Runtime settings for the connection at `index`.
    pub fn connection_settings(&self, index: usize) -> Option<ConnectionSettings> {
        let conn = self.connections.get(index)?;

        Some(ConnectionSettings {
            index,
            data_source: conn.data_source,
            buffer_size: self.buffer_size,
            reconnect_backoff: self.reconnect_backoff,
            message_count: self.message_count,
        })
    }
}

//! Configuration loading, validation, and reload bookkeeping.
//!
//! The config file is JSON; unknown keys are ignored so operators can carry
//! annotations the proxy does not consume. A loaded [`Config`] is immutable:
//! reload parses and validates a fresh instance and the server swaps the
//! live reference atomically, so a broken edit can never take down a running
//! proxy.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("listen_port must be in 1..=65535")]
    InvalidPort,
    #[error("no backends configured")]
    NoBackends,
    #[error("backend {index} has an empty host or port")]
    InvalidBackend { index: usize },
}

/// Backend selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    Weighted,
    LeastConnections,
    IpHash,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::Weighted => "weighted",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::IpHash => "ip_hash",
        }
    }
}

/// One configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_backend_max_connections")]
    pub max_connections: u32,
}

/// Connection pool settings. Presence of the section enables pooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub max_size: usize,
    /// Connection time-to-live in seconds; 0 disables expiry.
    #[serde(rename = "ttl", default = "default_pool_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_pool_max_requests")]
    pub max_requests: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_size(),
            ttl_seconds: default_pool_ttl(),
            max_requests: default_pool_max_requests(),
        }
    }
}

/// Rate limiting settings. Presence of the section enables limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per second per client IP.
    #[serde(rename = "per_ip", default = "default_per_ip_rate")]
    pub per_ip_rate: f64,
    /// Global requests per second across all clients; 0 disables the cap.
    #[serde(rename = "global", default)]
    pub global_rate: f64,
    #[serde(rename = "burst", default = "default_burst_size")]
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,

    /// Admin listener port serving `GET /metrics`; absent disables it.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// PID file used for the drain handshake between instances.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    #[serde(skip)]
    pub config_file: PathBuf,
    #[serde(skip)]
    pub file_mtime: Option<SystemTime>,
    #[serde(skip)]
    pub loaded_at: Option<SystemTime>,
}

fn default_listen_port() -> u16 {
    8080
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_backlog() -> i32 {
    128
}
fn default_algorithm() -> Algorithm {
    Algorithm::RoundRobin
}
fn default_weight() -> u32 {
    1
}
fn default_backend_max_connections() -> u32 {
    100
}
fn default_pool_size() -> usize {
    64
}
fn default_pool_ttl() -> u64 {
    60
}
fn default_pool_max_requests() -> u64 {
    1000
}
fn default_per_ip_rate() -> f64 {
    100.0
}
fn default_burst_size() -> u32 {
    10
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_write_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
fn default_drain_timeout_seconds() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_address: default_bind_address(),
            backlog: default_backlog(),
            algorithm: default_algorithm(),
            backends: Vec::new(),
            pool: None,
            rate_limit: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            drain_timeout_seconds: default_drain_timeout_seconds(),
            metrics_port: None,
            pid_file: None,
            config_file: PathBuf::new(),
            file_mtime: None,
            loaded_at: None,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        cfg.config_file = path.to_path_buf();
        cfg.file_mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
        cfg.loaded_at = Some(SystemTime::now());

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a candidate file without touching the current
    /// configuration. The caller decides whether to swap.
    pub fn reload(path: &Path) -> Result<Self, ConfigError> {
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        for (index, backend) in self.backends.iter().enumerate() {
            if backend.host.is_empty() || backend.port == 0 {
                return Err(ConfigError::InvalidBackend { index });
            }
        }
        Ok(())
    }

    /// Semantic equality: listen port, policy, and the ordered backend set
    /// with weights. Timeouts and ancillary settings do not participate.
    pub fn equivalent(&self, other: &Config) -> bool {
        self.listen_port == other.listen_port
            && self.algorithm == other.algorithm
            && self.backends.len() == other.backends.len()
            && self
                .backends
                .iter()
                .zip(&other.backends)
                .all(|(a, b)| a.host == b.host && a.port == b.port && a.weight == b.weight)
    }

    /// True when the file on disk has a different mtime than the one this
    /// config was loaded from.
    pub fn changed(&self) -> bool {
        let current = fs::metadata(&self.config_file)
            .ok()
            .and_then(|m| m.modified().ok());
        match (current, self.file_mtime) {
            (Some(now), Some(loaded)) => now != loaded,
            _ => false,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn pool_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn rate_limit_enabled(&self) -> bool {
        self.rate_limit.is_some()
    }
}

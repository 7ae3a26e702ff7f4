use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::pool::PoolLimits;
use crate::server::ServerOptions;
use crate::server::hint::MemoryHintOptions;

/// Environment variable naming an optional YAML config file.
pub const CONFIG_ENV: &str = "FERRY_CONFIG";
/// Environment variable overriding `listen_addr`.
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub backlog: u32,
    pub max_connections: usize,
    pub timeout_ms: u64,
    pub max_requests_per_connection: usize,
    pub batch_size: usize,
    pub read_buffer_size: usize,
    pub close_grace_ms: u64,
    pub pool: PoolLimits,
    pub memory_hint: MemoryHintOptions,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            backlog: 511,
            max_connections: 0,
            timeout_ms: 120_000,
            max_requests_per_connection: 1000,
            batch_size: 16,
            read_buffer_size: 16 * 1024,
            close_grace_ms: 5_000,
            pool: PoolLimits::default(),
            memory_hint: MemoryHintOptions::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the YAML file named by `FERRY_CONFIG` (if set), then
    /// the `LISTEN` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var(LISTEN_ENV) {
            cfg.listen_addr = listen_addr;
        }

        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        // An empty document deserializes to unit, not to a defaulted map.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            backlog: self.backlog,
            max_connections: self.max_connections,
            timeout: Duration::from_millis(self.timeout_ms),
            max_requests_per_connection: self.max_requests_per_connection,
            batch_size: self.batch_size,
            read_buffer_size: self.read_buffer_size,
            close_grace: Duration::from_millis(self.close_grace_ms),
            pool: self.pool,
            memory_hint: self.memory_hint,
        }
    }
}

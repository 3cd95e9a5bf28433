// src/config.rs
use crate::error::{EmberError, EmberResult};
use crate::pool::PoolConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Smallest read or write buffer the server will run with.
pub const MIN_BUFFER_SIZE: usize = 256;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 9006)
    pub port: u16,

    /// Directory static files are served from (default: ./root)
    pub root: PathBuf,

    /// Timer sweep interval in seconds; idle connections live three ticks (default: 5)
    pub tick_secs: u64,

    /// Connection table size (default: 4096)
    pub max_connections: usize,

    /// Workers kept alive when idle (default: 2)
    pub min_workers: usize,

    /// Upper bound on workers (default: number of CPUs)
    pub max_workers: usize,

    /// How often the pool manager rebalances (default: 3000)
    pub manager_interval_ms: u64,

    /// Per-connection read buffer; also caps a request (default: 2048)
    pub read_buffer_size: usize,

    /// Per-connection header buffer (default: 1024)
    pub write_buffer_size: usize,

    /// Flat user file; in-memory users when unset
    pub users_file: Option<PathBuf>,

    /// Connections held by the user backend pool (default: 8)
    pub user_pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let min_workers = 2;
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            root: PathBuf::from("./root"),
            tick_secs: 5,
            max_connections: 4096,
            min_workers,
            max_workers: num_cpus::get().max(min_workers),
            manager_interval_ms: 3000,
            read_buffer_size: 2048,
            write_buffer_size: 1024,
            users_file: None,
            user_pool_size: 8,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key/value source. Missing or unparsable
    /// values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: T) -> T {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();
        let min_workers = parsed(&lookup, "EMBER_MIN_WORKERS", defaults.min_workers);
        let max_workers = match lookup("EMBER_MAX_WORKERS").and_then(|v| v.trim().parse().ok()) {
            Some(n) => n,
            None => defaults.max_workers.max(min_workers),
        };

        ServerConfig {
            host: lookup("EMBER_HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "EMBER_PORT", defaults.port),
            root: lookup("EMBER_ROOT").map(PathBuf::from).unwrap_or(defaults.root),
            tick_secs: parsed(&lookup, "EMBER_TICK_SECS", defaults.tick_secs),
            max_connections: parsed(&lookup, "EMBER_MAX_CONNECTIONS", defaults.max_connections),
            min_workers,
            max_workers,
            manager_interval_ms: parsed(
                &lookup,
                "EMBER_MANAGER_INTERVAL_MS",
                defaults.manager_interval_ms,
            ),
            read_buffer_size: parsed(&lookup, "EMBER_READ_BUFFER", defaults.read_buffer_size),
            write_buffer_size: parsed(&lookup, "EMBER_WRITE_BUFFER", defaults.write_buffer_size),
            users_file: lookup("EMBER_USERS_FILE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            user_pool_size: parsed(&lookup, "EMBER_USER_POOL_SIZE", defaults.user_pool_size),
        }
    }

    pub fn validate(&self) -> EmberResult<()> {
        if self.min_workers == 0 {
            return Err(EmberError::Config("min_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(EmberError::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_connections == 0 {
            return Err(EmberError::Config("max_connections must be at least 1".into()));
        }
        if self.tick_secs == 0 {
            return Err(EmberError::Config("tick_secs must be at least 1".into()));
        }
        if self.read_buffer_size < MIN_BUFFER_SIZE || self.write_buffer_size < MIN_BUFFER_SIZE {
            return Err(EmberError::Config(format!(
                "buffers must hold at least {} bytes",
                MIN_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Connections idle for three ticks are closed.
    pub fn idle_timeout(&self) -> Duration {
        self.tick() * 3
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            manager_interval: Duration::from_millis(self.manager_interval_ms),
            ..PoolConfig::default()
        }
    }

    /// Get the full listen address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

//! Server configuration.
//!
//! [`ServerConfig`] can be built in code with the `with_*` methods, parsed
//! from JSON, or loaded from environment variables:
//!
//! | Variable                       | Field                             | Default      |
//! |--------------------------------|-----------------------------------|--------------|
//! | `APODO_HOST`                   | `host`                            | `127.0.0.1`  |
//! | `APODO_PORT`                   | `port`                            | `8000`       |
//! | `APODO_WORKERS`                | `workers`                         | CPU count    |
//! | `APODO_KEEP_ALIVE`             | `keep_alive`                      | `true`       |
//! | `APODO_NECROMANCER_INTERVAL`   | `necromancer_interval` (seconds)  | `5`          |
//! | `APODO_KEEP_ALIVE_TIMEOUT`     | `limits.keep_alive_timeout` (s)   | `30`         |
//! | `APODO_WORKER_TIMEOUT`         | `limits.worker_timeout` (s)       | `60`         |
//! | `APODO_DRAIN_TIMEOUT`          | `limits.drain_timeout` (s)        | `10`         |
//! | `APODO_MAX_HEAD_SIZE`          | `limits.max_head_size` (bytes)    | `65536`      |
//!
//! ```rust
//! use apodo::config::ServerConfig;
//!
//! let config = ServerConfig::from_json(r#"{"port": 9000, "workers": 2}"#).unwrap();
//! assert_eq!(config.port, 9000);
//! assert_eq!(config.limits.worker_timeout.as_secs(), 60);
//! ```

use std::env;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Timeouts and size limits applied by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    /// Idle time after which a kept-alive connection is closed. Zero disables
    /// idle eviction.
    #[serde(with = "seconds")]
    pub keep_alive_timeout: Duration,
    /// Longest a handler may run before its worker is killed.
    #[serde(with = "seconds")]
    pub worker_timeout: Duration,
    /// How long a worker waits for open connections after SIGTERM.
    #[serde(with = "seconds")]
    pub drain_timeout: Duration,
    /// Largest accepted request line plus headers, in bytes.
    pub max_head_size: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(10),
            max_head_size: 64 * 1024,
        }
    }
}

/// Everything the server needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Number of worker processes.
    pub workers: usize,
    /// Whether connections may serve more than one request.
    pub keep_alive: bool,
    /// How often the supervisor checks for dead workers.
    #[serde(with = "seconds")]
    pub necromancer_interval: Duration,
    pub limits: ServerLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8000,
            workers: default_workers(),
            keep_alive: true,
            necromancer_interval: Duration::from_secs(5),
            limits: ServerLimits::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ServerConfig {
    /// Reads `APODO_*` variables, falling back to defaults for unset ones.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set but cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup("APODO_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "APODO_PORT", "a port number")? {
            config.port = port;
        }
        if let Some(workers) = parse::<usize, _>(&lookup, "APODO_WORKERS", "a worker count")? {
            config.workers = workers.max(1);
        }
        if let Some(value) = lookup("APODO_KEEP_ALIVE") {
            config.keep_alive = parse_bool("APODO_KEEP_ALIVE", &value)?;
        }
        if let Some(secs) = parse(&lookup, "APODO_NECROMANCER_INTERVAL", "seconds")? {
            config.necromancer_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "APODO_KEEP_ALIVE_TIMEOUT", "seconds")? {
            config.limits.keep_alive_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "APODO_WORKER_TIMEOUT", "seconds")? {
            config.limits.worker_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "APODO_DRAIN_TIMEOUT", "seconds")? {
            config.limits.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse(&lookup, "APODO_MAX_HEAD_SIZE", "a size in bytes")? {
            config.limits.max_head_size = bytes;
        }
        Ok(config)
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed input.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the `host:port` string the workers bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_necromancer_interval(mut self, interval: Duration) -> Self {
        self.necromancer_interval = interval;
        self
    }

    #[must_use]
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.limits.keep_alive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.limits.worker_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.limits.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_head_size(mut self, bytes: usize) -> Self {
        self.limits.max_head_size = bytes;
        self
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key,
                value,
                expected,
            }),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            expected: "a boolean",
        }),
    }
}

// Durations are written as whole seconds in JSON.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:8000");
        assert!(config.workers >= 1);
        assert!(config.keep_alive);
        assert_eq!(config.necromancer_interval, Duration::from_secs(5));
        assert_eq!(config.limits.keep_alive_timeout, Duration::from_secs(30));
        assert_eq!(config.limits.worker_timeout, Duration::from_secs(60));
        assert_eq!(config.limits.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.limits.max_head_size, 65536);
    }

    #[test]
    fn env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("APODO_HOST", "0.0.0.0"),
            ("APODO_PORT", "9090"),
            ("APODO_WORKERS", "3"),
            ("APODO_KEEP_ALIVE", "off"),
            ("APODO_KEEP_ALIVE_TIMEOUT", "0"),
            ("APODO_WORKER_TIMEOUT", "15"),
        ]))
        .unwrap();
        assert_eq!(config.addr(), "0.0.0.0:9090");
        assert_eq!(config.workers, 3);
        assert!(!config.keep_alive);
        assert_eq!(config.limits.keep_alive_timeout, Duration::ZERO);
        assert_eq!(config.limits.worker_timeout, Duration::from_secs(15));
        assert_eq!(config.limits.drain_timeout, Duration::from_secs(10));
    }

    #[test]
    fn env_rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup(&[("APODO_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "APODO_PORT", .. }));
        let err = ServerConfig::from_lookup(lookup(&[("APODO_KEEP_ALIVE", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "APODO_KEEP_ALIVE", .. }));
    }

    #[test]
    fn json_with_partial_limits() {
        let config = ServerConfig::from_json(
            r#"{"host": "::1", "keep_alive": false, "limits": {"worker_timeout": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.host, "::1");
        assert!(!config.keep_alive);
        assert_eq!(config.limits.worker_timeout, Duration::from_secs(5));
        assert_eq!(config.limits.keep_alive_timeout, Duration::from_secs(30));
        assert!(matches!(ServerConfig::from_json("{"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn builder() {
        let config = ServerConfig::default()
            .with_port(0)
            .with_workers(0)
            .with_drain_timeout(Duration::from_secs(1));
        assert_eq!(config.port, 0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.limits.drain_timeout, Duration::from_secs(1));
    }
}

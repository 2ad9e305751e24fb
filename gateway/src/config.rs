//! Environment configuration
//!
//! | Variable | Type | Default |
//! |----------|------|---------|
//! | `KAIKU_CONCURRENCY` | `usize` (≥1) | `2` |
//! | `KAIKU_QUEUE_CAPACITY` | `usize` (≥1) | `1024` |
//! | `KAIKU_METRICS_ENABLED` | `bool` | `false` |
//! | `KAIKU_METRICS_ADDR` | `SocketAddr` | `0.0.0.0:8000` |
//! | `KAIKU_LOG_LEVEL` | filter directive | `info` |
//! | `KAIKU_LOG_FORMAT` | `pretty` / `json` | `pretty` |
//! | `KAIKU_TOKEN_NAME` | `String` | `JSESSIONID` |
//!
//! Unset variables keep their default; a set but unparseable variable is a
//! [`GatewayError::Config`].

use crate::error::{GatewayError, Result};
use std::net::SocketAddr;
use std::str::FromStr;

/// Worker count
pub const ENV_CONCURRENCY: &str = "KAIKU_CONCURRENCY";
/// Bounded queue size between reader and workers
pub const ENV_QUEUE_CAPACITY: &str = "KAIKU_QUEUE_CAPACITY";
/// Start the metrics HTTP server
pub const ENV_METRICS_ENABLED: &str = "KAIKU_METRICS_ENABLED";
/// Metrics HTTP listen address
pub const ENV_METRICS_ADDR: &str = "KAIKU_METRICS_ADDR";
/// Default log filter when `RUST_LOG` is unset
pub const ENV_LOG_LEVEL: &str = "KAIKU_LOG_LEVEL";
/// Log output format
pub const ENV_LOG_FORMAT: &str = "KAIKU_LOG_FORMAT";
/// Cookie correlated by the session handler
pub const ENV_TOKEN_NAME: &str = "KAIKU_TOKEN_NAME";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'pretty' or 'json', got {other:?}")),
        }
    }
}

/// Process configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Worker count
    pub concurrency: usize,
    /// Bounded queue size
    pub queue_capacity: usize,
    /// Start the metrics HTTP server
    pub metrics_enabled: bool,
    /// Metrics listen address
    pub metrics_addr: SocketAddr,
    /// Default log filter
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Correlated cookie name
    pub token_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 2,
            queue_capacity: 1024,
            metrics_enabled: false,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            token_name: "JSESSIONID".to_string(),
        }
    }
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key -> value source
    ///
    /// ```
    /// use kaiku_gateway::Config;
    ///
    /// let config = Config::from_lookup(|key| match key {
    ///     "KAIKU_CONCURRENCY" => Some("8".to_string()),
    ///     _ => None,
    /// })
    /// .unwrap();
    /// assert_eq!(config.concurrency, 8);
    /// assert_eq!(config.queue_capacity, 1024);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(val) = lookup(ENV_CONCURRENCY) {
            config.concurrency = parse_positive(ENV_CONCURRENCY, &val)?;
        }
        if let Some(val) = lookup(ENV_QUEUE_CAPACITY) {
            config.queue_capacity = parse_positive(ENV_QUEUE_CAPACITY, &val)?;
        }
        if let Some(val) = lookup(ENV_METRICS_ENABLED) {
            config.metrics_enabled = parse_bool(ENV_METRICS_ENABLED, &val)?;
        }
        if let Some(val) = lookup(ENV_METRICS_ADDR) {
            config.metrics_addr = parse(ENV_METRICS_ADDR, &val)?;
        }
        if let Some(val) = lookup(ENV_LOG_LEVEL) {
            config.log_level = val.trim().to_string();
        }
        if let Some(val) = lookup(ENV_LOG_FORMAT) {
            config.log_format = parse(ENV_LOG_FORMAT, &val)?;
        }
        if let Some(val) = lookup(ENV_TOKEN_NAME) {
            let name = val.trim();
            if name.is_empty() {
                return Err(invalid(ENV_TOKEN_NAME, &val, "must not be empty"));
            }
            config.token_name = name.to_string();
        }

        Ok(config)
    }
}

fn invalid(var: &str, val: &str, reason: impl std::fmt::Display) -> GatewayError {
    GatewayError::Config(format!("invalid value for {var}: {val:?} ({reason})"))
}

fn parse<T>(var: &str, val: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    val.trim().parse::<T>().map_err(|e| invalid(var, val, e))
}

fn parse_positive(var: &str, val: &str) -> Result<usize> {
    match parse::<usize>(var, val)? {
        0 => Err(invalid(var, val, "must be at least 1")),
        n => Ok(n),
    }
}

fn parse_bool(var: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, val, "expected boolean")),
    }
}

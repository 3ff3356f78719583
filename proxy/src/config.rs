//! Proxy configuration.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Main proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Upstream endpoint configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on for client connections.
    #[serde(default = "ProxyConfig::default_listen")]
    pub listen: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
        }
    }
}

impl ProxyConfig {
    fn default_listen() -> SocketAddr {
        "0.0.0.0:6380".parse().unwrap()
    }
}

/// Upstream endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream host name or address.
    #[serde(default = "UpstreamConfig::default_host")]
    pub host: String,

    /// Upstream port.
    #[serde(default = "UpstreamConfig::default_port")]
    pub port: u16,

    /// What to do when the upstream sends more replies than there are
    /// clients awaiting them (e.g. unsolicited push frames).
    #[serde(default)]
    pub excess_replies: ExcessReplyPolicy,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            excess_replies: ExcessReplyPolicy::default(),
        }
    }
}

impl UpstreamConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        6379
    }
}

/// Policy for replies that have no awaiting client.
///
/// The position-based routing contract cannot attribute such a reply, so
/// it is never delivered; the policies differ in how loudly that fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExcessReplyPolicy {
    /// Treat as fatal: log the buffer and exit 1 (default).
    #[default]
    Exit,
    /// Drop the upstream connection and its awaiting clients, keep serving.
    Disconnect,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

//! Configuration for engines and connections.
//!
//! Loaded from a JSON file named by `--config` or the `FLOWLINK_CONFIG`
//! environment variable; every field has a default, and `FLOWLINK_HOST` /
//! `FLOWLINK_PORT` override the engine's listening address.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::host::PortPool;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Listening engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Outbound connection timeouts.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Ports available to throwaway response engines and log receivers.
    #[serde(default)]
    pub ports: PortPoolConfig,

    /// Restart behavior.
    #[serde(default)]
    pub restart: RestartConfig,

    /// Remote logging defaults.
    #[serde(default)]
    pub logging: RemoteLoggingConfig,
}

/// Engine settings (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Address to bind listeners on.
    #[serde(default = "default_host")]
    pub bind_host: String,

    /// Address remote hosts should use to reach this one.
    #[serde(default = "default_host")]
    pub advertise_host: String,

    /// Port the long-running engine listens on.
    #[serde(default = "default_engine_port")]
    pub port: u16,

    /// Per-connection read/write timeout in milliseconds.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_host: default_host(),
            advertise_host: default_host(),
            port: default_engine_port(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

/// Connection timeouts (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// How long a caller waits for a response on its throwaway engine.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortPoolConfig {
    #[serde(default = "default_pool_start")]
    pub start: u16,

    #[serde(default = "default_pool_end")]
    pub end: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            start: default_pool_start(),
            end: default_pool_end(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    /// How long Restart/Stop wait for flows to stop before abandoning them.
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteLoggingConfig {
    /// Idle time after which a forwarding sink deregisters itself.
    #[serde(default = "default_logging_timeout")]
    pub timeout_ms: u64,
}

impl Default for RemoteLoggingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_logging_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

const fn default_engine_port() -> u16 {
    12345
}

const fn default_io_timeout() -> u64 {
    10_000
}

const fn default_connect_timeout() -> u64 {
    5_000
}

const fn default_read_timeout() -> u64 {
    30_000
}

const fn default_response_timeout() -> u64 {
    60_000
}

const fn default_pool_start() -> u16 {
    12400
}

const fn default_pool_end() -> u16 {
    12499
}

const fn default_grace_period() -> u64 {
    5_000
}

const fn default_logging_timeout() -> u64 {
    60_000
}

impl Config {
    /// Load from `FLOWLINK_CONFIG` if set, then apply env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("FLOWLINK_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from a JSON file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let mut config = Self::from_file(path)?;
                config.apply_env_overrides()?;
                Ok(config)
            }
            None => Self::from_env(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("FLOWLINK_HOST") {
            self.engine.bind_host = host;
        }
        if let Ok(port) = std::env::var("FLOWLINK_PORT") {
            self.engine.port = port
                .parse()
                .with_context(|| format!("FLOWLINK_PORT is not a port number: {port}"))?;
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings::from_config(&self.engine)
    }

    pub const fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings::from_config(&self.connection)
    }

    pub fn port_pool(&self) -> Result<PortPool> {
        PortPool::new(self.ports.start..=self.ports.end).context("Invalid port pool")
    }

    pub const fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart.grace_period_ms)
    }

    pub const fn logging_timeout(&self) -> Duration {
        Duration::from_millis(self.logging.timeout_ms)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

/// Parsed engine settings with `Duration` fields.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub bind_host: String,
    pub port: u16,
    pub io_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            bind_host: config.bind_host.clone(),
            port: config.port,
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        }
    }

    /// Same settings on a different port.
    #[must_use]
    pub fn on_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

/// Parsed connection settings with `Duration` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

impl ConnectionSettings {
    pub const fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.engine.port, 12345);
        assert_eq!(config.engine.bind_host, "127.0.0.1");
        assert_eq!(config.ports.start, 12400);
        assert_eq!(config.ports.end, 12499);
        assert_eq!(config.restart_grace(), Duration::from_secs(5));
        assert_eq!(config.logging_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let json = r#"{
            "engine": { "port": 9000, "io_timeout_ms": 250 },
            "connection": { "read_timeout_ms": 1500 }
        }"#;
        let config = Config::from_json(json).unwrap();

        let engine = config.engine_settings();
        assert_eq!(engine.port, 9000);
        assert_eq!(engine.io_timeout, Duration::from_millis(250));
        assert_eq!(engine.bind_host, "127.0.0.1");

        let connection = config.connection_settings();
        assert_eq!(connection.read_timeout, Duration::from_millis(1500));
        assert_eq!(connection.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn on_port_keeps_other_settings() {
        let settings = EngineSettings::default().on_port(12401);
        assert_eq!(settings.port, 12401);
        assert_eq!(settings.io_timeout, Duration::from_secs(10));
    }

    #[test]
    fn inverted_port_pool_is_rejected() {
        let config = Config::from_json(r#"{"ports": {"start": 200, "end": 100}}"#).unwrap();
        assert!(config.port_pool().is_err());
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowlink.json");
        std::fs::write(&path, r#"{"restart": {"grace_period_ms": 100}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.restart_grace(), Duration::from_millis(100));
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/flowlink.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

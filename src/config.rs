//! Service configuration
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Durations are expressed in milliseconds or seconds in the
//! TOML and converted on access.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{RetryPolicy, SyncError};
use crate::hub::HubConfig;
use crate::sequencer::RetentionPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub hub: HubSection,
    pub sequencer: SequencerSection,
    pub client: ClientSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind, self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// Bounded per-connection outbound queue; a full queue drops the connection.
    pub send_queue_capacity: usize,
    /// Bounded queue in front of the hub's control loop.
    pub control_queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            control_queue_capacity: 1024,
            ping_interval_secs: 15,
            pong_timeout_secs: 45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerSection {
    /// Operations retained per session before the oldest are evicted.
    pub max_retained_ops: usize,
    /// Optional age bound for retained operations.
    pub retention_secs: Option<u64>,
    /// Cap on operations returned by a full sync (newest N); `None` sends all.
    pub snapshot_limit: Option<usize>,
    /// Period of the background retention sweep.
    pub sweep_interval_secs: u64,
    /// Drop a session whose log has emptied and sat untouched this long.
    pub idle_session_secs: u64,
}

impl Default for SequencerSection {
    fn default() -> Self {
        Self {
            max_retained_ops: 10_000,
            retention_secs: None,
            snapshot_limit: None,
            sweep_interval_secs: 30,
            idle_session_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Re-issue an unanswered `request_missing` after this long.
    pub gap_request_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            reconnect_initial_delay_ms: 250,
            reconnect_max_delay_ms: 10_000,
            reconnect_max_attempts: 8,
            gap_request_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Directory for daily-rolling log files; stdout only when unset.
    pub directory: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            ansi: true,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.hub.send_queue_capacity == 0 {
            return Err(SyncError::Config("hub.send_queue_capacity must be > 0".into()));
        }
        if self.hub.control_queue_capacity == 0 {
            return Err(SyncError::Config("hub.control_queue_capacity must be > 0".into()));
        }
        if self.hub.ping_interval_secs == 0 {
            return Err(SyncError::Config("hub.ping_interval_secs must be > 0".into()));
        }
        if self.hub.pong_timeout_secs < self.hub.ping_interval_secs {
            return Err(SyncError::Config(
                "hub.pong_timeout_secs must be >= hub.ping_interval_secs".into(),
            ));
        }
        if self.sequencer.max_retained_ops == 0 {
            return Err(SyncError::Config("sequencer.max_retained_ops must be > 0".into()));
        }
        if self.sequencer.sweep_interval_secs == 0 {
            return Err(SyncError::Config("sequencer.sweep_interval_secs must be > 0".into()));
        }
        if self.client.reconnect_max_attempts == 0 {
            return Err(SyncError::Config("client.reconnect_max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            send_queue_capacity: self.hub.send_queue_capacity,
            control_queue_capacity: self.hub.control_queue_capacity,
            ping_interval: Duration::from_secs(self.hub.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.hub.pong_timeout_secs),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_ops: self.sequencer.max_retained_ops,
            max_age: self.sequencer.retention_secs.map(Duration::from_secs),
            snapshot_limit: self.sequencer.snapshot_limit,
            sweep_interval: Duration::from_secs(self.sequencer.sweep_interval_secs),
            idle_session_ttl: Duration::from_secs(self.sequencer.idle_session_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.client.reconnect_max_attempts,
            initial_delay: Duration::from_millis(self.client.reconnect_initial_delay_ms),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(self.client.reconnect_max_delay_ms),
        }
    }

    pub fn gap_request_timeout(&self) -> Duration {
        Duration::from_millis(self.client.gap_request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.hub.send_queue_capacity, 256);
        assert_eq!(config.retention().max_ops, 10_000);
        assert!(config.retention().max_age.is_none());
        assert_eq!(config.retention().sweep_interval, Duration::from_secs(30));
        assert_eq!(config.retention().idle_session_ttl, Duration::from_secs(300));
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let err =
            SyncConfig::from_toml_str("[sequencer]
sweep_interval_secs = 0
").unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));
    }

    #[test]
    fn partial_sections_override() {
        let config = SyncConfig::from_toml_str(
            r#"
            [hub]
            send_queue_capacity = 8
            ping_interval_secs = 5
            pong_timeout_secs = 10

            [sequencer]
            max_retained_ops = 100
            retention_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.hub_config().send_queue_capacity, 8);
        assert_eq!(config.hub_config().pong_timeout, Duration::from_secs(10));
        assert_eq!(config.hub.control_queue_capacity, 1024);
        assert_eq!(config.retention().max_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = SyncConfig::from_toml_str("[hub]\nsend_queue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("send_queue_capacity"));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 4100").unwrap();
        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.server.addr().unwrap().port(), 4100);
    }
}

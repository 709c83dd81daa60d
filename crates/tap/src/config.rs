//! Configuration for a tap.
//!
//! [`TapConfig`] holds every setting that is plain data. Functions (callbacks,
//! sink handler, timestamp formatter) are attached to the [`Tap`](crate::Tap)
//! itself. The record can be built in code or loaded from YAML:
//!
//! ```yaml
//! mode:
//!   type: relay
//!   remote_host: 10.0.0.12
//!   remote_port: 5432
//! local_port: 15432
//! verbosity: 2
//! log_file: tap.log
//! defrag_delay_secs: 0.05
//! ```

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Bytes read from the client per wakeup.
pub const DEFAULT_CLIENT_CHUNK_SIZE: usize = 10_000;

/// Bytes read from the server per wakeup.
pub const DEFAULT_SERVER_CHUNK_SIZE: usize = 100_000;

/// Pending connections the OS queues while the acceptor is busy.
pub const DEFAULT_BACKLOG: u32 = 128;

/// How much the tap reports about the traffic it relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize)]
#[serde(from = "u8")]
pub enum Verbosity {
    /// Nothing on the console.
    Silent,
    /// Connect, disconnect and byte counts.
    #[default]
    Normal,
    /// Everything, including payloads and callback markers.
    Debug,
}

impl Verbosity {
    /// Numeric level (0, 1 or 2).
    pub fn level(self) -> u8 {
        match self {
            Self::Silent => 0,
            Self::Normal => 1,
            Self::Debug => 2,
        }
    }
}

impl From<u8> for Verbosity {
    fn from(level: u8) -> Self {
        match level {
            0 => Self::Silent,
            1 => Self::Normal,
            _ => Self::Debug,
        }
    }
}

/// What sits behind the tap.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TapMode {
    /// Forward to a real server.
    Relay { remote_host: String, remote_port: u16 },
    /// No server; a local handler answers every message.
    Sink,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_parallel() -> bool {
    true
}
fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}
fn default_client_chunk_size() -> usize {
    DEFAULT_CLIENT_CHUNK_SIZE
}
fn default_server_chunk_size() -> usize {
    DEFAULT_SERVER_CHUNK_SIZE
}

/// Configuration for a tap.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TapConfig {
    /// Relay target or sink mode.
    pub mode: TapMode,
    /// Port to listen on. Falls back to the remote port in relay mode.
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Interface to listen on.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Console/log detail level.
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Append-mode log file. `None` or empty disables the log.
    #[serde(default)]
    pub log_file: Option<String>,
    /// Pause before each read so fragmented writes coalesce (0 = off).
    #[serde(default)]
    pub defrag_delay_secs: f64,
    /// One task per connection when true, one connection at a time otherwise.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Listen backlog; also the queue depth for serial mode.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum bytes per client read.
    #[serde(default = "default_client_chunk_size")]
    pub client_chunk_size: usize,
    /// Maximum bytes per server read.
    #[serde(default = "default_server_chunk_size")]
    pub server_chunk_size: usize,
    /// Cap on concurrently dispatched connections. Connections over the cap
    /// are served inline by the acceptor instead of being refused.
    #[serde(default)]
    pub max_parallel_connections: Option<usize>,
}

impl TapConfig {
    fn with_mode(mode: TapMode) -> Self {
        Self {
            mode,
            local_port: None,
            bind_host: default_bind_host(),
            verbosity: Verbosity::default(),
            log_file: None,
            defrag_delay_secs: 0.0,
            parallel: true,
            backlog: DEFAULT_BACKLOG,
            client_chunk_size: DEFAULT_CLIENT_CHUNK_SIZE,
            server_chunk_size: DEFAULT_SERVER_CHUNK_SIZE,
            max_parallel_connections: None,
        }
    }

    /// Configuration for a full relay to `remote_host:remote_port`.
    pub fn relay(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self::with_mode(TapMode::Relay {
            remote_host: remote_host.into(),
            remote_port,
        })
    }

    /// Configuration for a sink listening on `local_port`.
    pub fn sink(local_port: u16) -> Self {
        Self {
            local_port: Some(local_port),
            ..Self::with_mode(TapMode::Sink)
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<String>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_defrag_delay(mut self, secs: f64) -> Self {
        self.defrag_delay_secs = secs;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_chunk_sizes(mut self, client: usize, server: usize) -> Self {
        self.client_chunk_size = client;
        self.server_chunk_size = server;
        self
    }

    pub fn with_max_parallel_connections(mut self, max: usize) -> Self {
        self.max_parallel_connections = Some(max);
        self
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<()> {
        match &self.mode {
            TapMode::Relay {
                remote_host,
                remote_port,
            } => {
                if remote_host.trim().is_empty() {
                    return Err(Error::Config("remote host is required".into()));
                }
                if *remote_port == 0 {
                    return Err(Error::Config("remote port is required".into()));
                }
            }
            TapMode::Sink => {
                if self.local_port.is_none() {
                    return Err(Error::Config("sink mode requires a local port".into()));
                }
            }
        }
        validate_defrag_delay(self.defrag_delay_secs)?;
        if self.backlog == 0 {
            return Err(Error::Config("backlog must be at least 1".into()));
        }
        if self.client_chunk_size == 0 || self.server_chunk_size == 0 {
            return Err(Error::Config("chunk sizes must be non-zero".into()));
        }
        if self.max_parallel_connections == Some(0) {
            return Err(Error::Config(
                "max_parallel_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Port the tap listens on.
    pub fn effective_local_port(&self) -> u16 {
        match (&self.mode, self.local_port) {
            (_, Some(port)) => port,
            (TapMode::Relay { remote_port, .. }, None) => *remote_port,
            (TapMode::Sink, None) => 0,
        }
    }

    /// Address the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.effective_local_port())
    }

    /// Address of the real server, if any.
    pub fn remote_address(&self) -> Option<String> {
        match &self.mode {
            TapMode::Relay {
                remote_host,
                remote_port,
            } => Some(format!("{}:{}", remote_host, remote_port)),
            TapMode::Sink => None,
        }
    }

    /// Defrag delay as a duration, `None` when disabled.
    pub fn defrag_delay(&self) -> Option<Duration> {
        defrag_duration(self.defrag_delay_secs)
    }
}

pub(crate) fn validate_defrag_delay(secs: f64) -> Result<()> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::Config(format!(
            "defrag delay must be a non-negative number of seconds, got {}",
            secs
        )));
    }
    Ok(())
}

pub(crate) fn defrag_duration(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_defaults() {
        let config = TapConfig::relay("example.com", 8080);
        assert_eq!(config.effective_local_port(), 8080);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.remote_address().as_deref(), Some("example.com:8080"));
        assert_eq!(config.verbosity, Verbosity::Normal);
        assert!(config.parallel);
        assert_eq!(config.defrag_delay(), None);
        assert_eq!(config.client_chunk_size, DEFAULT_CLIENT_CHUNK_SIZE);
        assert_eq!(config.server_chunk_size, DEFAULT_SERVER_CHUNK_SIZE);
        config.validate().unwrap();
    }

    #[test]
    fn test_local_port_overrides_remote() {
        let config = TapConfig::relay("example.com", 8080).with_local_port(9090);
        assert_eq!(config.effective_local_port(), 9090);
    }

    #[test]
    fn test_sink_has_no_remote() {
        let config = TapConfig::sink(7000);
        assert_eq!(config.effective_local_port(), 7000);
        assert_eq!(config.remote_address(), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_remote_fields_rejected() {
        assert!(matches!(
            TapConfig::relay("", 80).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            TapConfig::relay("localhost", 0).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_bad_defrag_delay_rejected() {
        for secs in [-1.0, f64::NAN, f64::INFINITY] {
            let config = TapConfig::relay("localhost", 80).with_defrag_delay(secs);
            assert!(config.validate().is_err(), "accepted {}", secs);
        }
    }

    #[test]
    fn test_fractional_defrag_delay() {
        let config = TapConfig::relay("localhost", 80).with_defrag_delay(0.25);
        assert_eq!(config.defrag_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(Verbosity::from(0), Verbosity::Silent);
        assert_eq!(Verbosity::from(1), Verbosity::Normal);
        assert_eq!(Verbosity::from(2), Verbosity::Debug);
        assert_eq!(Verbosity::from(9), Verbosity::Debug);
        assert!(Verbosity::Debug > Verbosity::Normal);
    }

    #[test]
    fn test_yaml_relay() {
        let yaml = r#"
mode:
  type: relay
  remote_host: 10.0.0.12
  remote_port: 5432
local_port: 15432
verbosity: 2
log_file: tap.log
defrag_delay_secs: 0.05
parallel: false
"#;
        let config = TapConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.mode,
            TapMode::Relay {
                remote_host: "10.0.0.12".into(),
                remote_port: 5432
            }
        );
        assert_eq!(config.effective_local_port(), 15432);
        assert_eq!(config.verbosity, Verbosity::Debug);
        assert_eq!(config.log_file.as_deref(), Some("tap.log"));
        assert!(!config.parallel);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
    }

    #[test]
    fn test_yaml_sink_requires_port() {
        let err = TapConfig::from_yaml_str("mode:\n  type: sink\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_yaml_unknown_field() {
        let yaml = "mode:\n  type: sink\nlocal_port: 1\nbogus: true\n";
        assert!(matches!(
            TapConfig::from_yaml_str(yaml),
            Err(Error::Yaml(_))
        ));
    }
}

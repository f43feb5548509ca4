//! Relay configuration

use crate::error::{RelayError, Result};
use crate::packet::MAX_TCP_MSS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Silent,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP termination settings
    pub tcp: TcpConfig,

    /// UDP forwarding settings
    pub udp: UdpConfig,

    /// Maximum concurrent sessions across both protocols
    pub max_sessions: usize,

    /// Worker tasks allowed to run I/O passes at once
    pub worker_pool_size: usize,

    /// Seconds between idle sweeps on the event loop
    pub sweep_interval_secs: u64,

    /// Log level used by `init_logging`
    pub log_level: LogLevel,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            max_sessions: 65536,
            worker_pool_size: 16,
            sweep_interval_secs: 10,
            log_level: LogLevel::Info,
        }
    }
}

/// TCP termination settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TcpConfig {
    /// Largest segment payload we accept and advertise in SYN-ACK
    pub mss: u16,

    /// Receive window field advertised to the client
    pub window: u16,

    /// Window scale shift offered when the client supports scaling
    pub window_scale: u8,

    /// Upper bound for one read from the outbound socket
    pub read_chunk: usize,

    /// Idle seconds before a TCP session is evicted
    pub idle_timeout_secs: u64,

    /// MSS assumed when the client SYN carries no MSS option
    pub default_client_mss: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1360, // Conservative MSS for tunnel MTUs
            window: 65535,
            window_scale: 0,
            read_chunk: 65535,
            idle_timeout_secs: 300,
            default_client_mss: 536,
        }
    }
}

/// UDP forwarding settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UdpConfig {
    /// Idle seconds before a UDP session is evicted
    pub idle_timeout_secs: u64,

    /// Receive buffer for one datagram from the remote
    pub max_datagram: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            max_datagram: 65507,
        }
    }
}

impl RelayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| RelayError::Config(format!("Invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tcp.mss < 64 || self.tcp.mss > MAX_TCP_MSS {
            return Err(RelayError::Config(format!(
                "tcp.mss must be within 64..={}, got {}",
                MAX_TCP_MSS, self.tcp.mss
            )));
        }
        if self.tcp.default_client_mss == 0 {
            return Err(RelayError::Config("tcp.default_client_mss must be positive".into()));
        }
        if self.tcp.window_scale > 14 {
            return Err(RelayError::Config(format!(
                "tcp.window_scale must be at most 14, got {}",
                self.tcp.window_scale
            )));
        }
        if self.tcp.read_chunk == 0 {
            return Err(RelayError::Config("tcp.read_chunk must be positive".into()));
        }
        if self.udp.max_datagram == 0 || self.udp.max_datagram > 65507 {
            return Err(RelayError::Config(format!(
                "udp.max_datagram out of range: {}",
                self.udp.max_datagram
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(RelayError::Config("worker_pool_size must be positive".into()));
        }
        if self.max_sessions == 0 {
            return Err(RelayError::Config("max_sessions must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(RelayError::Config("sweep_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp.idle_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

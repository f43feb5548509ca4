//! Error types for the VeloGuard transport relay

use std::io;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Header parse error: {0}")]
    HeaderParse(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Session limit reached: {0}")]
    SessionLimit(usize),

    #[error("Sink full")]
    SinkFull,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether the error came from decoding a tunnel packet
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            RelayError::HeaderParse(_)
                | RelayError::PacketTooShort { .. }
                | RelayError::InvalidIpVersion(_)
                | RelayError::UnsupportedProtocol(_)
        )
    }
}

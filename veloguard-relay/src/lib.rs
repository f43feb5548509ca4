//! VeloGuard Relay - user-space transport relay for tunnel traffic
//!
//! IPv4 packets captured from a local tunnel interface are terminated here:
//! each TCP or UDP flow becomes a session backed by a real socket to the
//! intended destination, and everything the destination sends back is
//! re-encapsulated into checksummed IPv4/TCP/UDP packets for the tunnel.
//!
//! # Features
//!
//! - Server-side TCP per flow: handshake, sequence tracking, half-close, RST
//! - UDP sessions over connected ephemeral sockets
//! - Non-blocking outbound I/O driven by a single readiness loop
//! - Capture sink receiving a copy of every packet in both directions
//! - Idle eviction and traffic statistics
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                   Tunnel (client side)                      |
//! +-------------------------------------------------------------+
//!             | IPv4 packets                  ^ replies
//!             v                               |
//! +-------------------------------------------------------------+
//! |                   Relay                                     |
//! | +-----------------+   +----------------+  +-------------+   |
//! | | SessionHandler  |-->| SessionManager |  | PacketSink  |   |
//! | | (parse, TCP FSM)|   | (flow table)   |  | client/capt.|   |
//! | +-----------------+   +----------------+  +-------------+   |
//! |          |                    |                 ^           |
//! |          v                    v                 |           |
//! | +-----------------+   +----------------+        |           |
//! | |   WorkerPool    |<--|   EventLoop    |        |           |
//! | | (read / write)  |-->| (readiness,    |        |           |
//! | +-----------------+   |  idle sweep)   |        |           |
//! |          |            +----------------+        |           |
//! |          +--------------------------------------+           |
//! +-------------------------------------------------------------+
//!             |                               ^
//!             v                               |
//! +-------------------------------------------------------------+
//! |              Outbound sockets (real network)                |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use veloguard_relay::Relay;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (reply_tx, mut reply_rx) = mpsc::channel(4096);
//!     let relay = Relay::builder()
//!         .mss(1360)
//!         .client_sink(reply_tx)
//!         .build()
//!         .unwrap();
//!
//!     relay.start().unwrap();
//!
//!     // feed packets read from the tunnel
//!     let (tun_tx, tun_rx) = mpsc::channel(4096);
//!     relay.run(tun_rx).await;
//! }
//! ```

pub mod channel;
pub mod checksum;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod logging;
pub mod manager;
pub mod packet;
pub mod relay;
pub mod session;
pub mod sink;
pub mod stats;
pub mod worker;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use channel::{OutboundChannel, Readiness};
pub use config::{LogLevel, RelayConfig, TcpConfig, UdpConfig};
pub use error::{RelayError, Result};
pub use logging::init_logging;
pub use manager::SessionManager;
pub use packet::{build_ipv4_tcp, build_ipv4_udp, parse_packet, ParsedPacket, TcpFlags, TcpSegment};
pub use relay::{Relay, RelayBuilder, RelayContext};
pub use session::{FlowKey, Protocol, Session, TcpState};
pub use sink::{NullSink, PacketSink};
pub use stats::{RelayStats, StatsSnapshot};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::RelayConfig;
    pub use crate::error::{RelayError, Result};
    pub use crate::relay::{Relay, RelayBuilder};
    pub use crate::sink::PacketSink;
    pub use crate::stats::RelayStats;
}

//! Statistics tracking for the relay

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Relay-wide statistics
#[derive(Debug, Default)]
pub struct RelayStats {
    start_time: Option<Instant>,

    // Tunnel side
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,

    // Sessions
    pub tcp_sessions_total: AtomicU64,
    pub tcp_sessions_active: AtomicU64,
    pub udp_sessions_total: AtomicU64,
    pub udp_sessions_active: AtomicU64,
    pub session_failures: AtomicU64,
    pub channels_closed: AtomicU64,

    // Outbound side
    pub outbound_writes: AtomicU64,
    pub outbound_bytes: AtomicU64,
    pub inbound_bytes: AtomicU64,

    // Protocol events
    pub resets_sent: AtomicU64,
    pub duplicate_segments: AtomicU64,
    pub out_of_order_segments: AtomicU64,
    pub window_stalls: AtomicU64,
    pub duplicate_acks: AtomicU64,
    pub retransmits: AtomicU64,

    // Errors
    pub parse_errors: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub sink_errors: AtomicU64,
    pub packets_dropped: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }

    /// Packet read from the tunnel
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Packet written to the client sink
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_session(&self) {
        self.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        self.udp_sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_failure(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes handed to an outbound socket
    pub fn record_outbound(&self, bytes: usize) {
        self.outbound_writes.fetch_add(1, Ordering::Relaxed);
        self.outbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes read from an outbound socket
    pub fn record_inbound(&self, bytes: usize) {
        self.inbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_stall(&self) {
        self.window_stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Pure ACK that did not advance while data was in flight
    pub fn record_duplicate_ack(&self) {
        self.duplicate_acks.fetch_add(1, Ordering::Relaxed);
    }

    /// Enough duplicate ACKs to signal a lost segment
    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checksum_error(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            tcp_sessions_total: self.tcp_sessions_total.load(Ordering::Relaxed),
            tcp_sessions_active: self.tcp_sessions_active.load(Ordering::Relaxed),
            udp_sessions_total: self.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: self.udp_sessions_active.load(Ordering::Relaxed),
            session_failures: self.session_failures.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            outbound_writes: self.outbound_writes.load(Ordering::Relaxed),
            outbound_bytes: self.outbound_bytes.load(Ordering::Relaxed),
            inbound_bytes: self.inbound_bytes.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            duplicate_segments: self.duplicate_segments.load(Ordering::Relaxed),
            out_of_order_segments: self.out_of_order_segments.load(Ordering::Relaxed),
            window_stalls: self.window_stalls.load(Ordering::Relaxed),
            duplicate_acks: self.duplicate_acks.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub tcp_sessions_total: u64,
    pub tcp_sessions_active: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: u64,
    pub session_failures: u64,
    pub channels_closed: u64,
    pub outbound_writes: u64,
    pub outbound_bytes: u64,
    pub inbound_bytes: u64,
    pub resets_sent: u64,
    pub duplicate_segments: u64,
    pub out_of_order_segments: u64,
    pub window_stalls: u64,
    pub duplicate_acks: u64,
    pub retransmits: u64,
    pub parse_errors: u64,
    pub checksum_errors: u64,
    pub sink_errors: u64,
    pub packets_dropped: u64,
}

impl StatsSnapshot {
    /// Calculate packets per second (requires two snapshots)
    pub fn packets_per_second(&self, previous: &StatsSnapshot, interval: Duration) -> f64 {
        let delta = self.packets_received.saturating_sub(previous.packets_received);
        delta as f64 / interval.as_secs_f64()
    }

    /// Get total active sessions (TCP + UDP)
    pub fn active_sessions(&self) -> u64 {
        self.tcp_sessions_active + self.udp_sessions_active
    }
}

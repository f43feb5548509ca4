//! Packet sinks for the tunnel writer and the capture store

use crate::error::{RelayError, Result};
use bytes::BytesMut;
use tokio::sync::mpsc;

/// Accepts one complete IPv4 datagram per call.
///
/// Implementations must not block: sinks are called while a session's
/// control block is locked.
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: &[u8]) -> Result<()>;
}

impl PacketSink for mpsc::Sender<BytesMut> {
    fn send_packet(&self, packet: &[u8]) -> Result<()> {
        self.try_send(BytesMut::from(packet)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::SinkFull,
            mpsc::error::TrySendError::Closed(_) => RelayError::ChannelClosed,
        })
    }
}

impl PacketSink for mpsc::UnboundedSender<BytesMut> {
    fn send_packet(&self, packet: &[u8]) -> Result<()> {
        self.send(BytesMut::from(packet)).map_err(|_| RelayError::ChannelClosed)
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PacketSink for NullSink {
    fn send_packet(&self, _packet: &[u8]) -> Result<()> {
        Ok(())
    }
}

//! Real outbound sockets backing relay sessions

use crate::error::{RelayError, Result};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

/// Readiness a worker waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Read,
    Write,
}

/// Non-blocking outbound channel owned by one session
#[derive(Debug)]
pub enum OutboundChannel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl OutboundChannel {
    /// Start a non-blocking TCP connect. The handshake completes in the
    /// background; the first readiness event reports success or failure.
    pub fn connect_tcp(remote: SocketAddrV4) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));
        socket.set_tcp_keepalive(&keepalive)?;

        // EINPROGRESS is expected for non-blocking sockets
        match socket.connect(&SocketAddr::V4(remote).into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                return Err(RelayError::Resource(format!("connect {}: {}", remote, e)));
            }
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;
        trace!("Outbound TCP connect started to {}", remote);
        Ok(OutboundChannel::Tcp(stream))
    }

    /// Bind an ephemeral UDP socket and fix its target
    pub fn bind_udp(remote: SocketAddrV4) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
        socket
            .connect(&SocketAddr::V4(remote).into())
            .map_err(|e| RelayError::Resource(format!("udp target {}: {}", remote, e)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        trace!("Outbound UDP socket bound for {}", remote);
        Ok(OutboundChannel::Udp(socket))
    }

    /// Wait until the channel is ready for `readiness`
    pub async fn ready(&self, readiness: Readiness) -> io::Result<()> {
        match (self, readiness) {
            (OutboundChannel::Tcp(s), Readiness::Read) => s.readable().await,
            (OutboundChannel::Tcp(s), Readiness::Write) => s.writable().await,
            (OutboundChannel::Udp(s), Readiness::Read) => s.readable().await,
            (OutboundChannel::Udp(s), Readiness::Write) => s.writable().await,
        }
    }

    /// Single non-blocking read (TCP) or receive (UDP)
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            OutboundChannel::Tcp(s) => s.try_read(buf),
            OutboundChannel::Udp(s) => s.try_recv(buf),
        }
    }

    /// Single non-blocking write (TCP) or send (UDP)
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutboundChannel::Tcp(s) => s.try_write(buf),
            OutboundChannel::Udp(s) => s.try_send(buf),
        }
    }

    /// Pending socket error, such as a refused connect
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            OutboundChannel::Tcp(s) => s.take_error(),
            OutboundChannel::Udp(s) => s.take_error(),
        }
    }

    /// Half-close the outbound stream after the client finished sending
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self {
            OutboundChannel::Tcp(s) => SockRef::from(s).shutdown(Shutdown::Write),
            OutboundChannel::Udp(_) => Ok(()),
        }
    }

    /// Tear the socket down. The descriptor closes once the last handle drops.
    pub fn close(&self) {
        if let OutboundChannel::Tcp(s) = self {
            if let Err(e) = SockRef::from(s).shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    debug!("Outbound shutdown failed: {}", e);
                }
            }
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, OutboundChannel::Tcp(_))
    }
}

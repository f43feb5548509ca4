//! End-to-end relay scenarios against loopback sockets
//!
//! Client packets are synthesized and fed through `Relay::process_packet`;
//! replies are collected from an unbounded client sink and decoded.

use crate::packet::{
    build_ipv4_tcp, build_ipv4_udp, ipv4_checksum_ok, parse_packet, TcpFlags, TcpHeader, TcpOptions, TcpSegment,
    TransportHeader,
};
use crate::relay::{Relay, RelayBuilder};
use crate::session::{FlowKey, TcpState};
use bytes::BytesMut;
use socket2::SockRef;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const CLIENT: &str = "10.8.0.2:41000";

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => panic!("expected ipv4"),
    }
}

fn client() -> SocketAddrV4 {
    CLIENT.parse().unwrap()
}

struct Harness {
    relay: Relay,
    replies: mpsc::UnboundedReceiver<BytesMut>,
    captured: mpsc::UnboundedReceiver<BytesMut>,
}

impl Harness {
    fn new() -> Self {
        Self::with(|builder| builder)
    }

    fn with(configure: impl FnOnce(RelayBuilder) -> RelayBuilder) -> Self {
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (capture_tx, captured) = mpsc::unbounded_channel();
        let relay = configure(Relay::builder()).client_sink(reply_tx).capture_sink(capture_tx).build().unwrap();
        relay.start().unwrap();
        Self { relay, replies, captured }
    }

    async fn next_reply(&mut self) -> Vec<u8> {
        timeout(Duration::from_secs(5), self.replies.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("client sink closed")
            .to_vec()
    }

    /// Next reply, decoded as a TCP segment from `remote` to the client
    async fn next_tcp(&mut self, remote: SocketAddrV4) -> (TcpHeader, Vec<u8>) {
        let pkt = self.next_reply().await;
        let parsed = parse_packet(&pkt).unwrap();
        assert!(ipv4_checksum_ok(&pkt, &parsed.ip));
        assert!(parsed.transport_checksum_ok());
        assert_eq!(parsed.src_socket(), remote);
        assert_eq!(parsed.dst_socket(), client());
        match parsed.transport {
            TransportHeader::Tcp(tcp) => (tcp, parsed.payload.to_vec()),
            TransportHeader::Udp(_) => panic!("expected a TCP reply"),
        }
    }

    fn send(&self, pkt: &[u8]) {
        self.relay.process_packet(pkt).unwrap();
    }

    fn session_state(&self, key: &FlowKey) -> Option<TcpState> {
        self.relay.session_manager().get_session(key).map(|s| s.state())
    }

    /// Handshake with a listener; returns the accepted peer and the relay's ISS
    async fn connect(&mut self, listener: &TcpListener, isn: u32) -> (TcpStream, u32) {
        let remote = v4(listener.local_addr().unwrap());
        self.send(&syn(remote, isn));
        let (syn_ack, _) = self.next_tcp(remote).await;
        assert!(syn_ack.flags.syn && syn_ack.flags.ack);
        assert_eq!(syn_ack.ack, isn.wrapping_add(1));

        let (peer, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
        self.send(&segment(remote, isn.wrapping_add(1), syn_ack.seq.wrapping_add(1), TcpFlags::ack_only(), b""));
        (peer, syn_ack.seq)
    }
}

fn syn(remote: SocketAddrV4, isn: u32) -> Vec<u8> {
    syn_with(remote, isn, 65535, 1460)
}

fn syn_with(remote: SocketAddrV4, isn: u32, window: u16, mss: u16) -> Vec<u8> {
    build_ipv4_tcp(&TcpSegment {
        src: client(),
        dst: remote,
        seq: isn,
        ack: 0,
        flags: TcpFlags { syn: true, ..Default::default() },
        window,
        options: TcpOptions { mss: Some(mss), ..Default::default() },
        payload: &[],
    })
}

fn segment(remote: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
    segment_with_window(remote, seq, ack, flags, 65535, payload)
}

fn segment_with_window(
    remote: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    build_ipv4_tcp(&TcpSegment {
        src: client(),
        dst: remote,
        seq,
        ack,
        flags,
        window,
        options: TcpOptions::default(),
        payload,
    })
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_handshake_then_remote_data() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());
    let key = FlowKey::tcp(client(), remote);

    h.send(&syn(remote, 1000));
    let (syn_ack, payload) = h.next_tcp(remote).await;
    assert!(syn_ack.flags.syn && syn_ack.flags.ack);
    assert_eq!(syn_ack.ack, 1001);
    assert_eq!(syn_ack.options.mss, Some(1360));
    assert!(payload.is_empty());
    assert_eq!(h.session_state(&key), Some(TcpState::SynReceived));
    let s0 = syn_ack.seq;

    let (mut peer, _) = listener.accept().await.unwrap();
    h.send(&segment(remote, 1001, s0.wrapping_add(1), TcpFlags::ack_only(), b""));
    assert_eq!(h.session_state(&key), Some(TcpState::Established));

    peer.write_all(b"0123456789").await.unwrap();
    let (data, payload) = h.next_tcp(remote).await;
    assert_eq!(data.seq, s0.wrapping_add(1));
    assert_eq!(data.ack, 1001);
    assert!(data.flags.psh && data.flags.ack);
    assert_eq!(payload, b"0123456789");

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_client_data_reaches_remote() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());
    let (mut peer, s0) = h.connect(&listener, 5000).await;

    h.send(&segment(remote, 5001, s0.wrapping_add(1), TcpFlags::psh_ack(), b"hello "));
    let (ack, _) = h.next_tcp(remote).await;
    assert_eq!(ack.ack, 5007);

    // retransmission of the same bytes is re-acked but not forwarded twice
    h.send(&segment(remote, 5001, s0.wrapping_add(1), TcpFlags::psh_ack(), b"hello "));
    let (dup_ack, _) = h.next_tcp(remote).await;
    assert_eq!(dup_ack.ack, 5007);

    h.send(&segment(remote, 5007, s0.wrapping_add(1), TcpFlags::psh_ack(), b"world"));
    let (ack, _) = h.next_tcp(remote).await;
    assert_eq!(ack.ack, 5012);

    let mut buf = vec![0u8; 11];
    timeout(Duration::from_secs(5), peer.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello world");
    assert_eq!(h.relay.stats().snapshot().duplicate_segments, 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_graceful_close() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());
    let key = FlowKey::tcp(client(), remote);
    let (mut peer, s0) = h.connect(&listener, 1999).await;

    h.send(&segment(remote, 2000, s0.wrapping_add(1), TcpFlags::fin_ack(), b""));
    let (ack, _) = h.next_tcp(remote).await;
    assert!(ack.flags.ack && !ack.flags.fin);
    assert_eq!(ack.ack, 2001);
    assert_eq!(h.session_state(&key), Some(TcpState::CloseWait));

    // the client's FIN becomes a half-close toward the remote
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), peer.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());
    drop(peer);

    let (fin, _) = h.next_tcp(remote).await;
    assert!(fin.flags.fin && fin.flags.ack);
    assert_eq!(fin.seq, s0.wrapping_add(1));
    assert_eq!(fin.ack, 2001);

    h.send(&segment(remote, 2001, s0.wrapping_add(2), TcpFlags::ack_only(), b""));
    assert!(h.relay.session_manager().get_session(&key).is_none());
    assert_eq!(h.relay.stats().snapshot().channels_closed, 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_client_reset_releases_once() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());
    let key = FlowKey::tcp(client(), remote);
    let (_peer, s0) = h.connect(&listener, 300).await;
    let session = h.relay.session_manager().get_session(&key).unwrap();

    h.send(&segment(remote, 301, s0.wrapping_add(1), TcpFlags::rst_only(), b""));
    assert!(session.is_aborting());

    let manager = h.relay.session_manager();
    assert!(wait_until(|| manager.get_session(&key).is_none()).await);
    assert!(wait_until(|| session.is_closed()).await);
    assert!(!manager.close_session(&session));
    assert_eq!(h.relay.stats().snapshot().channels_closed, 1);

    // no reply to a client RST
    assert!(h.replies.try_recv().is_err());
    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_retransmitted_syn_gets_same_syn_ack() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());

    h.send(&syn(remote, 42));
    let (first, _) = h.next_tcp(remote).await;
    h.send(&syn(remote, 42));
    let (second, _) = h.next_tcp(remote).await;

    assert_eq!(first.seq, second.seq);
    assert_eq!(first.ack, second.ack);
    assert_eq!(h.relay.session_manager().tcp_count(), 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_segments_without_session() {
    let mut h = Harness::new();
    let remote: SocketAddrV4 = "127.0.0.1:9".parse().unwrap();

    h.send(&segment(remote, 10, 777, TcpFlags::ack_only(), b"x"));
    let (rst, _) = h.next_tcp(remote).await;
    assert!(rst.flags.rst && !rst.flags.ack);
    assert_eq!(rst.seq, 777);

    h.send(&segment(remote, 10, 777, TcpFlags::fin_ack(), b""));
    let (ack, _) = h.next_tcp(remote).await;
    assert!(ack.flags.ack && !ack.flags.rst);
    assert_eq!(ack.ack, 11);

    h.send(&segment(remote, 10, 777, TcpFlags::rst_only(), b""));
    assert!(h.replies.try_recv().is_err());
    assert_eq!(h.relay.session_manager().session_count(), 0);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_refused_connection_resets_client() {
    let mut h = Harness::new();
    // grab a free port, then close it so the connect is refused
    let remote = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        v4(listener.local_addr().unwrap())
    };
    let key = FlowKey::tcp(client(), remote);

    h.send(&syn(remote, 9000));
    let (syn_ack, _) = h.next_tcp(remote).await;
    assert!(syn_ack.flags.syn);

    let (rst, _) = h.next_tcp(remote).await;
    assert!(rst.flags.rst);
    let manager = h.relay.session_manager();
    assert!(wait_until(|| manager.get_session(&key).is_none()).await);
    assert_eq!(h.relay.stats().snapshot().resets_sent, 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_udp_round_trip() {
    let mut h = Harness::new();
    let remote_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(remote_socket.local_addr().unwrap());

    h.send(&build_ipv4_udp(client(), remote, b"ping"));

    let mut buf = [0u8; 64];
    let (n, from) = timeout(Duration::from_secs(5), remote_socket.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(h.relay.session_manager().udp_count(), 1);

    remote_socket.send_to(b"pong", from).await.unwrap();
    let pkt = h.next_reply().await;
    let parsed = parse_packet(&pkt).unwrap();
    assert!(matches!(parsed.transport, TransportHeader::Udp(_)));
    assert!(parsed.transport_checksum_ok());
    assert_eq!(parsed.src_socket(), remote);
    assert_eq!(parsed.dst_socket(), client());
    assert_eq!(parsed.payload, b"pong");

    let stats = h.relay.stats();
    assert!(wait_until(|| stats.snapshot().outbound_writes == 1).await);
    assert_eq!(stats.snapshot().udp_sessions_total, 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_capture_sees_both_directions() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());

    let syn_pkt = syn(remote, 77);
    h.send(&syn_pkt);
    let syn_ack = h.next_reply().await;

    let first = h.captured.recv().await.unwrap();
    let second = h.captured.recv().await.unwrap();
    assert_eq!(&first[..], &syn_pkt[..]);
    assert_eq!(&second[..], &syn_ack[..]);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_remote_data_respects_client_window() {
    const WINDOW: u16 = 300;
    const MSS: u16 = 100;

    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());

    h.send(&syn_with(remote, 100, WINDOW, MSS));
    let (syn_ack, _) = h.next_tcp(remote).await;
    let s0 = syn_ack.seq;
    let (mut peer, _) = listener.accept().await.unwrap();
    h.send(&segment_with_window(remote, 101, s0.wrapping_add(1), TcpFlags::ack_only(), WINDOW, b""));

    let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    peer.write_all(&data).await.unwrap();

    let mut received = Vec::new();
    let mut acked = 0;
    let mut checked_stall = false;
    while received.len() < data.len() {
        let (seg, payload) = h.next_tcp(remote).await;
        assert_eq!(seg.seq, s0.wrapping_add(1 + received.len() as u32));
        assert!(!payload.is_empty() && payload.len() <= usize::from(MSS));
        received.extend_from_slice(&payload);

        let in_flight = received.len() - acked;
        assert!(in_flight <= usize::from(WINDOW));
        if in_flight < usize::from(WINDOW) && received.len() < data.len() {
            continue;
        }

        if !checked_stall {
            // a full window holds the reader until the client acknowledges
            assert!(timeout(Duration::from_millis(200), h.replies.recv()).await.is_err());
            let stats = h.relay.stats();
            assert!(wait_until(|| stats.snapshot().window_stalls > 0).await);
            checked_stall = true;
        }
        acked = received.len();
        let ack = s0.wrapping_add(1 + acked as u32);
        h.send(&segment_with_window(remote, 101, ack, TcpFlags::ack_only(), WINDOW, b""));
    }

    assert_eq!(received, data);
    assert!(checked_stall);
    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_acks_count_retransmit_request() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());
    let (mut peer, s0) = h.connect(&listener, 600).await;

    peer.write_all(b"lost bytes").await.unwrap();
    let (data, payload) = h.next_tcp(remote).await;
    assert_eq!(data.seq, s0.wrapping_add(1));
    assert_eq!(payload.len(), 10);

    // the client keeps acknowledging only the SYN
    for _ in 0..3 {
        h.send(&segment(remote, 601, s0.wrapping_add(1), TcpFlags::ack_only(), b""));
    }
    let snap = h.relay.stats().snapshot();
    assert_eq!(snap.duplicate_acks, 3);
    assert_eq!(snap.retransmits, 1);

    h.send(&segment(remote, 601, s0.wrapping_add(11), TcpFlags::ack_only(), b""));
    let snap = h.relay.stats().snapshot();
    assert_eq!(snap.duplicate_acks, 3);
    assert_eq!(snap.retransmits, 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_idle_udp_session_evicted() {
    let h = Harness::with(|builder| {
        builder
            .udp_idle_timeout(Duration::from_secs(1))
            .sweep_interval(Duration::from_secs(1))
    });
    let remote_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(remote_socket.local_addr().unwrap());
    let key = FlowKey::udp(client(), remote);

    h.send(&build_ipv4_udp(client(), remote, b"once"));
    let mut buf = [0u8; 16];
    timeout(Duration::from_secs(5), remote_socket.recv_from(&mut buf)).await.unwrap().unwrap();
    let session = h.relay.session_manager().get_session(&key).unwrap();

    let manager = h.relay.session_manager();
    assert!(wait_until(|| manager.get_session(&key).is_none()).await);
    assert!(wait_until(|| session.is_closed()).await);
    assert!(session.registration().is_cancelled());

    let snap = h.relay.stats().snapshot();
    assert_eq!(snap.udp_sessions_active, 0);
    assert_eq!(snap.channels_closed, 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn test_remote_reset_resets_client() {
    let mut h = Harness::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = v4(listener.local_addr().unwrap());
    let key = FlowKey::tcp(client(), remote);
    let (peer, s0) = h.connect(&listener, 700).await;

    // zero linger turns the close into an RST
    SockRef::from(&peer).set_linger(Some(Duration::ZERO)).unwrap();
    drop(peer);
    sleep(Duration::from_millis(50)).await;

    h.send(&segment(remote, 701, s0.wrapping_add(1), TcpFlags::psh_ack(), b"into the void"));

    let mut reset = None;
    for _ in 0..4 {
        let (seg, _) = h.next_tcp(remote).await;
        if seg.flags.rst {
            reset = Some(seg);
            break;
        }
    }
    let reset = reset.expect("client was not reset");
    assert_eq!(reset.seq, s0.wrapping_add(1));

    let manager = h.relay.session_manager();
    assert!(wait_until(|| manager.get_session(&key).is_none()).await);
    assert!(h.relay.stats().snapshot().resets_sent >= 1);

    h.relay.shutdown().await;
}

#[test]
fn test_packets_fed_from_plain_thread() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<BytesMut>();
    let relay = Arc::new(Relay::builder().client_sink(reply_tx).build().unwrap());
    let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let remote = v4(listener.local_addr().unwrap());
    runtime.block_on(async { relay.start() }).unwrap();

    // a blocking tunnel reader lives outside the runtime
    let reader = Arc::clone(&relay);
    std::thread::spawn(move || reader.process_packet(&syn(remote, 4242)))
        .join()
        .unwrap()
        .unwrap();

    let reply = runtime
        .block_on(async { timeout(Duration::from_secs(5), replies.recv()).await })
        .unwrap()
        .unwrap();
    let parsed = parse_packet(&reply).unwrap();
    match parsed.transport {
        TransportHeader::Tcp(tcp) => {
            assert!(tcp.flags.syn && tcp.flags.ack);
            assert_eq!(tcp.ack, 4243);
        }
        TransportHeader::Udp(_) => panic!("expected a SYN-ACK"),
    }
    runtime.block_on(async {
        timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
    });
    assert_eq!(relay.session_manager().tcp_count(), 1);

    runtime.block_on(relay.shutdown());
}

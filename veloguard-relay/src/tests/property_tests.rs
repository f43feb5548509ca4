//! Property-based tests for the packet codec and TCP sequence bookkeeping
//!
//! - Encoded TCP/UDP packets parse back to the fields they were built from
//! - Every emitted checksum verifies to zero
//! - Sequence comparison is consistent across wraparound
//! - Payload acceptance never appends a byte twice
//! - Bytes in flight never exceed the client window

use crate::checksum::{internet_checksum, pseudo_header_checksum, PROTO_TCP, PROTO_UDP};
use crate::packet::{
    build_ipv4_tcp, build_ipv4_udp, ipv4_checksum_ok, parse_packet, TcpFlags, TcpOptions, TcpSegment,
    TransportHeader, IPV4_HEADER_LEN,
};
use crate::session::{seq_after, seq_after_eq, AckOutcome, PayloadOutcome, SynParams, TcpControl};
use proptest::prelude::*;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Strategy for IPv4 socket addresses
fn endpoint_strategy() -> impl Strategy<Value = SocketAddrV4> {
    (any::<[u8; 4]>(), 1u16..=u16::MAX).prop_map(|(octets, port)| SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

/// Strategy for the flag combinations the relay emits
fn flags_strategy() -> impl Strategy<Value = TcpFlags> {
    prop_oneof![
        Just(TcpFlags::syn_ack()),
        Just(TcpFlags::ack_only()),
        Just(TcpFlags::psh_ack()),
        Just(TcpFlags::fin_ack()),
        Just(TcpFlags::rst_ack()),
        Just(TcpFlags::rst_only()),
    ]
}

fn options_strategy() -> impl Strategy<Value = TcpOptions> {
    (
        proptest::option::of(536u16..=1460),
        proptest::option::of(0u8..=14),
        proptest::option::of((any::<u32>(), any::<u32>())),
    )
        .prop_map(|(mss, window_scale, timestamp)| TcpOptions {
            mss,
            window_scale,
            timestamp,
            ..Default::default()
        })
}

fn syn(isn: u32, window: u16, mss: u16) -> SynParams {
    SynParams { client_isn: isn, window, mss: Some(mss), window_scale: None, timestamp: None }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A built TCP packet parses back to the same addressing, sequence
    /// numbers, flags, window, options and payload.
    #[test]
    fn test_tcp_build_parse_fields(
        src in endpoint_strategy(),
        dst in endpoint_strategy(),
        seq in any::<u32>(),
        ack in any::<u32>(),
        flags in flags_strategy(),
        window in any::<u16>(),
        options in options_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..1400),
    ) {
        let pkt = build_ipv4_tcp(&TcpSegment { src, dst, seq, ack, flags, window, options, payload: &payload });
        let parsed = parse_packet(&pkt).unwrap();

        prop_assert_eq!(parsed.src_socket(), src);
        prop_assert_eq!(parsed.dst_socket(), dst);
        prop_assert_eq!(parsed.payload, &payload[..]);
        match parsed.transport {
            TransportHeader::Tcp(tcp) => {
                prop_assert_eq!(tcp.seq, seq);
                prop_assert_eq!(tcp.ack, ack);
                prop_assert_eq!(tcp.flags, flags);
                prop_assert_eq!(tcp.window, window);
                prop_assert_eq!(tcp.options.mss, options.mss);
                prop_assert_eq!(tcp.options.window_scale, options.window_scale);
                prop_assert_eq!(tcp.options.timestamp, options.timestamp);
                prop_assert_eq!(tcp.header_len % 4, 0);
            }
            TransportHeader::Udp(_) => prop_assert!(false, "expected TCP"),
        }
    }

    /// IP and transport checksums of every emitted packet verify to zero.
    #[test]
    fn test_emitted_checksums_verify(
        src in endpoint_strategy(),
        dst in endpoint_strategy(),
        seq in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..600),
    ) {
        let tcp = build_ipv4_tcp(&TcpSegment {
            src,
            dst,
            seq,
            ack: seq.wrapping_add(1),
            flags: TcpFlags::psh_ack(),
            window: 65535,
            options: TcpOptions::default(),
            payload: &payload,
        });
        prop_assert_eq!(internet_checksum(&tcp[..IPV4_HEADER_LEN]), 0);
        prop_assert_eq!(pseudo_header_checksum(*src.ip(), *dst.ip(), PROTO_TCP, &tcp[IPV4_HEADER_LEN..]), 0);

        let udp = build_ipv4_udp(src, dst, &payload);
        let parsed = parse_packet(&udp).unwrap();
        prop_assert!(ipv4_checksum_ok(&udp, &parsed.ip));
        prop_assert!(parsed.transport_checksum_ok());
        prop_assert_eq!(pseudo_header_checksum(*src.ip(), *dst.ip(), PROTO_UDP, &udp[IPV4_HEADER_LEN..]), 0);
        prop_assert_eq!(parsed.payload, &payload[..]);
    }

    /// Forward distances below 2^31 compare as "after", regardless of where
    /// the base sits in sequence space.
    #[test]
    fn test_seq_comparison_modular(base in any::<u32>(), delta in 1u32..0x8000_0000) {
        let ahead = base.wrapping_add(delta);
        prop_assert!(seq_after(ahead, base));
        prop_assert!(seq_after_eq(ahead, base));
        prop_assert!(!seq_after(base, ahead));
        prop_assert!(seq_after_eq(base, base));
    }

    /// Replaying already received ranges never appends bytes twice and
    /// `recv_next` only moves forward by the number of new bytes.
    #[test]
    fn test_duplicate_suppression(
        isn in any::<u32>(),
        chunks in prop::collection::vec(1usize..200, 1..20),
        replays in prop::collection::vec((any::<prop::sample::Index>(), 1usize..300), 0..20),
    ) {
        let mut ctl = TcpControl::passive_open(0, &syn(isn, 65535, 1460), 1360, 536, 0);
        let stream: Vec<u8> = (0..chunks.iter().sum::<usize>()).map(|i| i as u8).collect();
        let base = isn.wrapping_add(1);

        let mut offset = 0;
        for len in &chunks {
            let seq = base.wrapping_add(offset as u32);
            let outcome = ctl.accept_payload(seq, &stream[offset..offset + len]);
            prop_assert_eq!(outcome, PayloadOutcome::Accepted(*len));
            offset += len;

            for (start, len) in &replays {
                let start = start.index(offset);
                let end = (start + len).min(offset);
                if end > start {
                    let outcome = ctl.accept_payload(base.wrapping_add(start as u32), &stream[start..end]);
                    prop_assert_eq!(outcome, PayloadOutcome::Duplicate);
                }
            }
        }

        prop_assert_eq!(ctl.recv_next(), base.wrapping_add(stream.len() as u32));
        prop_assert_eq!(ctl.ingress_len(), stream.len());
        let mut collected = Vec::new();
        while let Some(chunk) = ctl.pop_ingress() {
            collected.extend_from_slice(&chunk);
        }
        prop_assert_eq!(collected, stream);
    }

    /// With a client window that never shrinks below what is in flight,
    /// segmentation never puts more than the window in flight and never
    /// exceeds the MSS.
    #[test]
    fn test_window_invariant(
        iss in any::<u32>(),
        mss in 100u16..1460,
        initial_window in 1u16..=u16::MAX,
        steps in prop::collection::vec((1usize..5000, 0u32..5000, 0u16..2000), 1..30),
    ) {
        let mut ctl = TcpControl::passive_open(iss, &syn(7, initial_window, mss), 1460, 536, 0);
        prop_assert_eq!(ctl.accept_ack(iss.wrapping_add(1), initial_window), AckOutcome::Advanced(1));

        for (data, ack_bytes, grow) in steps {
            ctl.push_egress(&vec![0u8; data]);
            while let Some((_, chunk, _)) = ctl.next_egress_segment() {
                prop_assert!(chunk.len() <= usize::from(mss));
                prop_assert!(ctl.in_flight() <= ctl.client_window());
            }

            // acknowledge part of what is in flight; the window never ends
            // below the right edge already used
            let acked = ack_bytes.min(ctl.in_flight());
            let ack = ctl.send_unacked().wrapping_add(acked);
            let remaining = ctl.in_flight() - acked;
            let window = (remaining + u32::from(grow)).min(u32::from(u16::MAX)) as u16;
            prop_assert!(!matches!(ctl.accept_ack(ack, window), AckOutcome::Rejected));
            prop_assert!(ctl.in_flight() <= ctl.client_window());
        }
    }
}

//! IPv4/TCP/UDP packet parsing and building
//!
//! Parsing validates lengths through smoltcp wire types; building writes raw
//! bytes and recomputes every checksum.

use crate::checksum::{internet_checksum, pseudo_header_checksum, udp_checksum, PROTO_TCP, PROTO_UDP};
use crate::error::{RelayError, Result};
use smoltcp::wire::{Ipv4Packet, TcpPacket, UdpPacket};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const DEFAULT_TTL: u8 = 64;

/// Bytes a timestamp option occupies in every segment once negotiated
pub const TIMESTAMP_OPTION_LEN: usize = 12;

/// Largest MSS whose segments, timestamp option included, still fit the
/// 16-bit IPv4 total length
pub const MAX_TCP_MSS: u16 = (u16::MAX as usize - IPV4_HEADER_LEN - TCP_HEADER_LEN - TIMESTAMP_OPTION_LEN) as u16;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WINDOW_SCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_TIMESTAMP: u8 = 8;
const OPT_ALT_CHECKSUM: u8 = 14;
const OPT_SACK_OLD: u8 = 15;

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// TCP options understood by the relay. Everything else is skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    /// (TSval, TSecr)
    pub timestamp: Option<(u32, u32)>,
    pub alt_checksum: Option<u8>,
}

impl TcpOptions {
    /// Encoded length of the options the builder emits, NOP padded to 32 bits
    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.mss.is_some() { len += 4; }
        if self.window_scale.is_some() { len += 4; }
        if self.timestamp.is_some() { len += TIMESTAMP_OPTION_LEN; }
        len
    }

    fn encode(&self, out: &mut [u8]) {
        let mut i = 0;
        if let Some(mss) = self.mss {
            out[i] = OPT_MSS;
            out[i + 1] = 4;
            out[i + 2..i + 4].copy_from_slice(&mss.to_be_bytes());
            i += 4;
        }
        if let Some(shift) = self.window_scale {
            out[i] = OPT_NOP;
            out[i + 1] = OPT_WINDOW_SCALE;
            out[i + 2] = 3;
            out[i + 3] = shift;
            i += 4;
        }
        if let Some((ts_val, ts_ecr)) = self.timestamp {
            out[i] = OPT_NOP;
            out[i + 1] = OPT_NOP;
            out[i + 2] = OPT_TIMESTAMP;
            out[i + 3] = 10;
            out[i + 4..i + 8].copy_from_slice(&ts_val.to_be_bytes());
            out[i + 8..i + 12].copy_from_slice(&ts_ecr.to_be_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: TcpOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

/// A decoded tunnel datagram borrowing from the raw buffer
#[derive(Debug, Clone)]
pub struct ParsedPacket<'a> {
    pub ip: Ipv4Header,
    pub transport: TransportHeader,
    /// Transport header plus payload, bounded by the IPv4 total length
    pub segment: &'a [u8],
    pub payload: &'a [u8],
}

impl ParsedPacket<'_> {
    pub fn src_socket(&self) -> SocketAddrV4 {
        let port = match self.transport {
            TransportHeader::Tcp(ref tcp) => tcp.src_port,
            TransportHeader::Udp(ref udp) => udp.src_port,
        };
        SocketAddrV4::new(self.ip.src, port)
    }

    pub fn dst_socket(&self) -> SocketAddrV4 {
        let port = match self.transport {
            TransportHeader::Tcp(ref tcp) => tcp.dst_port,
            TransportHeader::Udp(ref udp) => udp.dst_port,
        };
        SocketAddrV4::new(self.ip.dst, port)
    }

    /// Whether the transport checksum (pseudo-header included) verifies.
    /// A UDP checksum of zero means "not computed" and always verifies.
    pub fn transport_checksum_ok(&self) -> bool {
        match self.transport {
            TransportHeader::Tcp(_) => {
                pseudo_header_checksum(self.ip.src, self.ip.dst, PROTO_TCP, self.segment) == 0
            }
            TransportHeader::Udp(ref udp) => {
                udp.checksum == 0
                    || pseudo_header_checksum(self.ip.src, self.ip.dst, PROTO_UDP, self.segment) == 0
            }
        }
    }
}

pub fn parse_ipv4_header(data: &[u8]) -> Result<Ipv4Header> {
    if data.is_empty() {
        return Err(RelayError::PacketTooShort { expected: IPV4_HEADER_LEN, actual: 0 });
    }
    let version = data[0] >> 4;
    if version != 4 {
        return Err(RelayError::InvalidIpVersion(version));
    }
    if data.len() < IPV4_HEADER_LEN {
        return Err(RelayError::PacketTooShort { expected: IPV4_HEADER_LEN, actual: data.len() });
    }

    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| RelayError::HeaderParse(format!("IPv4: {}", e)))?;

    Ok(Ipv4Header {
        header_len: usize::from(pkt.header_len()),
        tos: data[1],
        total_len: pkt.total_len(),
        identification: pkt.ident(),
        dont_fragment: pkt.dont_frag(),
        ttl: pkt.hop_limit(),
        protocol: u8::from(pkt.next_header()),
        checksum: pkt.checksum(),
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
    })
}

pub fn parse_tcp_header(data: &[u8]) -> Result<TcpHeader> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| RelayError::HeaderParse(format!("TCP: {}", e)))?;

    let header_len = usize::from(pkt.header_len());
    let options = parse_tcp_options(&data[TCP_HEADER_LEN..header_len]);

    Ok(TcpHeader {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        header_len,
        flags: TcpFlags::from_byte(data[13]),
        window: pkt.window_len(),
        checksum: pkt.checksum(),
        urgent: pkt.urgent_at(),
        options,
    })
}

/// Walk TCP options by their declared length. Unknown kinds are skipped and a
/// malformed length ends the walk without failing the segment.
pub fn parse_tcp_options(opts: &[u8]) -> TcpOptions {
    let mut options = TcpOptions::default();
    let mut i = 0;
    while i < opts.len() {
        let kind = opts[i];
        match kind {
            OPT_END => break,
            OPT_NOP => {
                i += 1;
                continue;
            }
            _ => {}
        }
        let Some(&len) = opts.get(i + 1) else { break };
        let len = usize::from(len);
        if len < 2 || i + len > opts.len() {
            break;
        }
        let body = &opts[i + 2..i + len];
        match (kind, body.len()) {
            (OPT_MSS, 2) => options.mss = Some(u16::from_be_bytes([body[0], body[1]])),
            (OPT_WINDOW_SCALE, 1) => options.window_scale = Some(body[0]),
            (OPT_SACK_PERMITTED, 0) => options.sack_permitted = true,
            (OPT_TIMESTAMP, 8) => {
                let ts_val = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let ts_ecr = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                options.timestamp = Some((ts_val, ts_ecr));
            }
            (OPT_ALT_CHECKSUM, 1) => options.alt_checksum = Some(body[0]),
            (OPT_SACK | OPT_SACK_OLD, _) => {}
            _ => {}
        }
        i += len;
    }
    options
}

pub fn parse_udp_header(data: &[u8]) -> Result<UdpHeader> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| RelayError::HeaderParse(format!("UDP: {}", e)))?;

    Ok(UdpHeader {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        length: pkt.len(),
        checksum: pkt.checksum(),
    })
}

/// Parse a tunnel datagram. Only IPv4 carrying TCP or UDP is accepted.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>> {
    let ip = parse_ipv4_header(data)?;
    let segment = &data[ip.header_len..usize::from(ip.total_len)];

    match ip.protocol {
        PROTO_TCP => {
            let tcp = parse_tcp_header(segment)?;
            Ok(ParsedPacket {
                ip,
                transport: TransportHeader::Tcp(tcp),
                segment,
                payload: &segment[tcp.header_len..],
            })
        }
        PROTO_UDP => {
            let udp = parse_udp_header(segment)?;
            Ok(ParsedPacket {
                ip,
                transport: TransportHeader::Udp(udp),
                segment,
                payload: &segment[UDP_HEADER_LEN..usize::from(udp.length)],
            })
        }
        other => Err(RelayError::UnsupportedProtocol(other)),
    }
}

/// Whether the IPv4 header checksum of a raw datagram verifies
pub fn ipv4_checksum_ok(data: &[u8], header: &Ipv4Header) -> bool {
    data.len() >= header.header_len && internet_checksum(&data[..header.header_len]) == 0
}

/// Addressing and per-session fields shared by every reply segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTemplate {
    /// Remote endpoint, the source of replies
    pub src: SocketAddrV4,
    /// Client endpoint inside the tunnel
    pub dst: SocketAddrV4,
    /// Receive window field we advertise
    pub window: u16,
    /// (TSval, TSecr) when timestamps were negotiated
    pub timestamp: Option<(u32, u32)>,
}

impl ReplyTemplate {
    /// Template for answering a packet no session owns
    pub fn answering(src: SocketAddrV4, dst: SocketAddrV4, window: u16) -> Self {
        Self { src: dst, dst: src, window, timestamp: None }
    }
}

/// A TCP segment ready to be encoded
#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub options: TcpOptions,
    pub payload: &'a [u8],
}

fn write_ipv4_header(pkt: &mut [u8], protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    debug_assert!(pkt.len() <= usize::from(u16::MAX), "IPv4 packet of {} bytes", pkt.len());
    let total_len = pkt.len() as u16;
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&total_len.to_be_bytes());

    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());

    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = DEFAULT_TTL;
    pkt[9] = protocol;
    pkt[10..12].copy_from_slice(&[0, 0]);
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());

    let ip_cksum = internet_checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}

/// Build an IPv4 TCP packet
pub fn build_ipv4_tcp(seg: &TcpSegment<'_>) -> Vec<u8> {
    let tcp_hdr_len = TCP_HEADER_LEN + seg.options.encoded_len();
    let total_len = IPV4_HEADER_LEN + tcp_hdr_len + seg.payload.len();

    let mut pkt = vec![0u8; total_len];
    write_ipv4_header(&mut pkt, PROTO_TCP, *seg.src.ip(), *seg.dst.ip());

    let tcp = &mut pkt[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&seg.src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&seg.dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seg.seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&seg.ack.to_be_bytes());
    tcp[12] = ((tcp_hdr_len / 4) as u8) << 4;
    tcp[13] = seg.flags.to_byte();
    tcp[14..16].copy_from_slice(&seg.window.to_be_bytes());
    seg.options.encode(&mut tcp[TCP_HEADER_LEN..tcp_hdr_len]);
    tcp[tcp_hdr_len..].copy_from_slice(seg.payload);

    let tcp_cksum = pseudo_header_checksum(*seg.src.ip(), *seg.dst.ip(), PROTO_TCP, tcp);
    tcp[16..18].copy_from_slice(&tcp_cksum.to_be_bytes());

    pkt
}

/// Build an IPv4 UDP packet
pub fn build_ipv4_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut pkt = vec![0u8; IPV4_HEADER_LEN + udp_len];
    write_ipv4_header(&mut pkt, PROTO_UDP, *src.ip(), *dst.ip());

    let udp = &mut pkt[IPV4_HEADER_LEN..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let cksum = udp_checksum(*src.ip(), *dst.ip(), udp);
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    pkt
}

fn reply(tpl: &ReplyTemplate, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
    build_ipv4_tcp(&TcpSegment {
        src: tpl.src,
        dst: tpl.dst,
        seq,
        ack,
        flags,
        window: tpl.window,
        options: TcpOptions { timestamp: tpl.timestamp, ..Default::default() },
        payload,
    })
}

/// SYN-ACK answering a client SYN. The window scale option is only echoed
/// when the client offered one.
pub fn build_syn_ack(tpl: &ReplyTemplate, seq: u32, ack: u32, mss: u16, window_scale: Option<u8>) -> Vec<u8> {
    build_ipv4_tcp(&TcpSegment {
        src: tpl.src,
        dst: tpl.dst,
        seq,
        ack,
        flags: TcpFlags::syn_ack(),
        window: tpl.window,
        options: TcpOptions {
            mss: Some(mss),
            window_scale,
            timestamp: tpl.timestamp,
            ..Default::default()
        },
        payload: &[],
    })
}

pub fn build_ack(tpl: &ReplyTemplate, seq: u32, ack: u32) -> Vec<u8> {
    reply(tpl, seq, ack, TcpFlags::ack_only(), &[])
}

/// Data segment carrying remote bytes; `push` marks the final chunk of a read.
pub fn build_data_segment(tpl: &ReplyTemplate, seq: u32, ack: u32, payload: &[u8], push: bool) -> Vec<u8> {
    let flags = if push { TcpFlags::psh_ack() } else { TcpFlags::ack_only() };
    reply(tpl, seq, ack, flags, payload)
}

/// The relay's own FIN after the remote side reached end of stream
pub fn build_fin(tpl: &ReplyTemplate, seq: u32, ack: u32) -> Vec<u8> {
    reply(tpl, seq, ack, TcpFlags::fin_ack(), &[])
}

/// FIN that also acknowledges the client's FIN at `client_fin_seq`
pub fn build_fin_ack(tpl: &ReplyTemplate, seq: u32, client_fin_seq: u32) -> Vec<u8> {
    reply(tpl, seq, client_fin_seq.wrapping_add(1), TcpFlags::fin_ack(), &[])
}

/// Reset. With `ack` set the segment is RST|ACK, otherwise a bare RST.
pub fn build_rst(tpl: &ReplyTemplate, seq: u32, ack: Option<u32>) -> Vec<u8> {
    match ack {
        Some(ack) => reply(tpl, seq, ack, TcpFlags::rst_ack(), &[]),
        None => reply(tpl, seq, 0, TcpFlags::rst_only(), &[]),
    }
}

//! Internet checksum (RFC 1071)

use std::net::Ipv4Addr;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// One's-complement sum of 16-bit big-endian words, odd byte padded with zero.
fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 checksum, used for the IPv4 header.
///
/// Running it over a header that already carries its checksum yields zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// TCP/UDP checksum including the IPv4 pseudo-header.
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum = sum.wrapping_add(u32::from(protocol));
    sum = sum.wrapping_add(segment.len() as u32);
    fold(sum_words(segment, sum))
}

/// UDP variant: a computed zero is transmitted as all ones.
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> u16 {
    match pseudo_header_checksum(src, dst, PROTO_UDP, datagram) {
        0 => 0xFFFF,
        cksum => cksum,
    }
}

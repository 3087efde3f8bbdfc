//! Checksum & packet builder (spec §4.1).
//!
//! Builds the synthesised IPv4+TCP / IPv4+UDP datagrams the client injects back
//! to the game client. Header construction and the standard checksum algorithm
//! are delegated to `etherparse`, which implements the RFC 791/793/768
//! pseudo-header checksum exactly; this module is the flow-aware front end that
//! plugs in identification, flags, sequence/ack and window before handing off
//! to it (mirrored in `firezone-firezone/rust/ip-packet/src/make.rs`, our
//! closest grounding example for this pattern in the corpus).
//!
//! [`recompute_checksums`] is the "diverter helper" fallback path from §4.1: a
//! hand-rolled one's-complement recompute over an already-framed raw buffer,
//! for the rare case a packet is mutated in place after having been built
//! rather than rebuilt from scratch. Both paths must be byte-exact.

use std::net::Ipv4Addr;

use etherparse::{IpNumber, Ipv4Header, TcpHeader, UdpHeader};

use crate::error::PacketError;

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn ack_only() -> Self {
        TcpFlags {
            ack: true,
            ..Default::default()
        }
    }

    pub fn fin_ack() -> Self {
        TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn psh_ack() -> Self {
        TcpFlags {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }
}

/// Parameters for one synthesised IPv4+TCP segment (spec §4.1, §6 "Packet emission").
pub struct TcpSegmentSpec<'a> {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: TcpFlags,
    pub ip_id: u16,
    pub payload: &'a [u8],
}

/// Builds a complete 20-byte-IPv4 + 20-byte-TCP + payload datagram. TTL is
/// fixed at 64, DF/MF are cleared, and there are no IP or TCP options, per §6.
pub fn build_tcp_segment(spec: &TcpSegmentSpec) -> Result<Vec<u8>, PacketError> {
    let mut tcp = TcpHeader::new(spec.src_port, spec.dst_port, spec.seq, spec.window);
    tcp.acknowledgment_number = spec.ack;
    tcp.syn = spec.flags.syn;
    tcp.ack = spec.flags.ack;
    tcp.fin = spec.flags.fin;
    tcp.rst = spec.flags.rst;
    tcp.psh = spec.flags.psh;

    let payload_len = spec.payload.len();
    let total_tcp_len = tcp.header_len() as usize + payload_len;
    let mut ip = Ipv4Header::new(
        total_tcp_len as u16,
        64,
        IpNumber::TCP,
        spec.src_ip.octets(),
        spec.dst_ip.octets(),
    )
    .map_err(|e| PacketError::Build(e.to_string()))?;
    ip.identification = spec.ip_id;
    ip.dont_fragment = true;
    ip.more_fragments = false;

    tcp.checksum = tcp
        .calc_checksum_ipv4(&ip, spec.payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    let mut out = Vec::with_capacity(ip.header_len() as usize + total_tcp_len);
    ip.write(&mut out).map_err(|e| PacketError::Build(e.to_string()))?;
    tcp.write(&mut out).map_err(|e| PacketError::Build(e.to_string()))?;
    out.extend_from_slice(spec.payload);
    Ok(out)
}

/// Parameters for one synthesised IPv4+UDP datagram.
pub struct UdpDatagramSpec<'a> {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_id: u16,
    pub payload: &'a [u8],
}

/// Builds a complete 20-byte-IPv4 + 8-byte-UDP + payload datagram.
pub fn build_udp_datagram(spec: &UdpDatagramSpec) -> Result<Vec<u8>, PacketError> {
    let total_udp_len = UdpHeader::LEN + spec.payload.len();
    let mut ip = Ipv4Header::new(
        total_udp_len as u16,
        64,
        IpNumber::UDP,
        spec.src_ip.octets(),
        spec.dst_ip.octets(),
    )
    .map_err(|e| PacketError::Build(e.to_string()))?;
    ip.identification = spec.ip_id;
    ip.dont_fragment = true;
    ip.more_fragments = false;

    let mut udp = UdpHeader::new(spec.src_port, spec.dst_port);
    udp.length = total_udp_len as u16;
    udp.checksum = udp
        .calc_checksum_ipv4(&ip, spec.payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    let mut out = Vec::with_capacity(ip.header_len() as usize + total_udp_len);
    ip.write(&mut out).map_err(|e| PacketError::Build(e.to_string()))?;
    udp.write(&mut out).map_err(|e| PacketError::Build(e.to_string()))?;
    out.extend_from_slice(spec.payload);
    Ok(out)
}

/// A monotonically wrapping IPv4 identification counter, one per flow (§3 "IP
/// identification counter", initial value 10000, wraps at 65536).
#[derive(Debug, Clone, Copy)]
pub struct IpIdCounter(u32);

impl IpIdCounter {
    pub fn new() -> Self {
        IpIdCounter(10_000)
    }

    pub fn next(&mut self) -> u16 {
        let id = (self.0 % 65_536) as u16;
        self.0 = (self.0 + 1) % 65_536;
        id
    }
}

impl Default for IpIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Recomputes the IPv4 header checksum and the TCP or UDP checksum of an
/// already-framed raw datagram in place, matching the fallback recompute path
/// described in §4.1. `buf` must be a 20-byte IPv4 header (no options) followed
/// by a full TCP or UDP segment.
pub fn recompute_checksums(buf: &mut [u8]) -> Result<(), PacketError> {
    if buf.len() < 20 {
        return Err(PacketError::TooShortForIpv4);
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::UnsupportedIpVersion(version));
    }
    let ihl = (buf[0] & 0x0f) as usize * 4;
    if buf.len() < ihl {
        return Err(PacketError::TooShortForIpv4);
    }
    let protocol = buf[9];

    // IPv4 header checksum: zero the checksum field, sum 16-bit words, fold, negate.
    buf[10] = 0;
    buf[11] = 0;
    let ip_checksum = ones_complement_sum(&buf[0..ihl]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    let src = [buf[12], buf[13], buf[14], buf[15]];
    let dst = [buf[16], buf[17], buf[18], buf[19]];
    let segment = &mut buf[ihl..];

    match protocol {
        6 => {
            if segment.len() < 20 {
                return Err(PacketError::TooShortForTransport("TCP"));
            }
            segment[16] = 0;
            segment[17] = 0;
            let checksum = transport_checksum(src, dst, 6, segment);
            let segment = &mut buf[ihl..];
            segment[16..18].copy_from_slice(&checksum.to_be_bytes());
        }
        17 => {
            if segment.len() < 8 {
                return Err(PacketError::TooShortForTransport("UDP"));
            }
            segment[6] = 0;
            segment[7] = 0;
            let checksum = transport_checksum(src, dst, 17, segment);
            let segment = &mut buf[ihl..];
            segment[6..8].copy_from_slice(&checksum.to_be_bytes());
        }
        other => {
            return Err(PacketError::Build(format!(
                "unsupported transport protocol {other}"
            )))
        }
    }
    Ok(())
}

/// The standard one's-complement 16-bit-word sum over a buffer, folded and
/// negated into a checksum. An odd-length buffer is padded with a trailing
/// zero byte for the purposes of the sum only, per §4.1.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn transport_checksum(src: [u8; 4], dst: [u8; 4], protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + segment.len() + 1);
    pseudo.extend_from_slice(&src);
    pseudo.extend_from_slice(&dst);
    pseudo.push(0);
    pseudo.push(protocol);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    ones_complement_sum(&pseudo)
}

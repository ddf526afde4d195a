//! Raw-IP packet parsing
//!
//! The tun device delivers bare IP packets (no link-layer framing). This
//! module extracts the connection 5-tuple and the transport payload from a
//! raw buffer, for both IPv4 and IPv6 (walking the common extension
//! headers).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

// IPv6
const IPV6_HLEN: usize = 40;
const IPV6_NEXT_HDR_OFFSET: usize = 6;
const IPV6_SRC_OFFSET: usize = 8;
const IPV6_DST_OFFSET: usize = 24;

// IPv6 extension header protocol numbers
const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_DEST_OPTIONS: u8 = 60;

// L4 protocol numbers
const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

// L4 header sizes
const TCP_MIN_HLEN: usize = 20;
const UDP_HLEN: usize = 8;
const ICMP_HLEN: usize = 8;

/// TCP SYN flag
pub const TH_SYN: u8 = 0x02;
/// TCP ACK flag
pub const TH_ACK: u8 = 0x10;

/// Packet parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer ends before a header is complete
    #[error("truncated packet at {0} layer")]
    Truncated(&'static str),

    /// First nibble is neither 4 nor 6
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// Transport protocol the NAT cannot proxy
    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),
}

/// Transport-layer protocol of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
}

impl L4Proto {
    /// Protocol name as reported to the host when no L7 classification
    /// applies
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
        }
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection key: `(ip version, transport, src, dst)`
///
/// Canonical and immutable once a connection exists. The IP version is
/// carried by the address variants; ports are host byte order and zero for
/// ICMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub proto: L4Proto,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FiveTuple {
    /// IP version of both endpoints (4 or 6)
    #[must_use]
    pub const fn ip_version(&self) -> u8 {
        match self.src_ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} -> {}:{}",
            self.proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Borrowed view of one parsed packet
#[derive(Debug, Clone)]
pub struct PacketView<'a> {
    /// Connection key extracted from the headers
    pub tuple: FiveTuple,
    /// Full L3 bytes as read from the tun device
    pub data: &'a [u8],
    /// Transport payload (after the L4 header)
    pub l7: &'a [u8],
    /// Raw TCP flags byte, zero for non-TCP packets
    pub tcp_flags: u8,
}

impl PacketView<'_> {
    /// Whether this packet belongs to an already-established TCP flow.
    ///
    /// A TCP packet that is not a bare SYN cannot legitimately create a
    /// new connection: mid-stream arrivals with no matching entry are
    /// stale and must not be admitted.
    #[must_use]
    pub fn is_tcp_established(&self) -> bool {
        self.tuple.proto == L4Proto::Tcp
            && (self.tcp_flags & TH_SYN == 0 || self.tcp_flags & TH_ACK != 0)
    }
}

/// Parse a raw IP packet into a [`PacketView`].
///
/// # Errors
///
/// Returns [`PacketError`] when the buffer is truncated at any layer, the
/// version nibble is unknown, or the transport protocol is not one of
/// TCP/UDP/ICMP.
pub fn parse_packet(data: &[u8]) -> Result<PacketView<'_>, PacketError> {
    let first = *data.first().ok_or(PacketError::Truncated("ip"))?;
    match first >> 4 {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        v => Err(PacketError::UnsupportedVersion(v)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<PacketView<'_>, PacketError> {
    if data.len() < IPV4_MIN_HLEN {
        return Err(PacketError::Truncated("ipv4"));
    }

    let ihl = usize::from(data[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HLEN || data.len() < ihl {
        return Err(PacketError::Truncated("ipv4 options"));
    }

    let src = Ipv4Addr::from(ipv4_octets(data, IPV4_SRC_OFFSET));
    let dst = Ipv4Addr::from(ipv4_octets(data, IPV4_DST_OFFSET));

    parse_l4(data, ihl, data[IPV4_PROTO_OFFSET], src.into(), dst.into())
}

fn parse_ipv6(data: &[u8]) -> Result<PacketView<'_>, PacketError> {
    if data.len() < IPV6_HLEN {
        return Err(PacketError::Truncated("ipv6"));
    }

    let src = Ipv6Addr::from(ipv6_octets(data, IPV6_SRC_OFFSET));
    let dst = Ipv6Addr::from(ipv6_octets(data, IPV6_DST_OFFSET));

    // Walk extension headers until a transport protocol is found.
    let mut next = data[IPV6_NEXT_HDR_OFFSET];
    let mut offset = IPV6_HLEN;
    loop {
        match next {
            EXT_HOP_BY_HOP | EXT_ROUTING | EXT_DEST_OPTIONS => {
                if data.len() < offset + 2 {
                    return Err(PacketError::Truncated("ipv6 extension"));
                }
                next = data[offset];
                offset += (usize::from(data[offset + 1]) + 1) * 8;
            }
            EXT_FRAGMENT => {
                if data.len() < offset + 8 {
                    return Err(PacketError::Truncated("ipv6 fragment"));
                }
                next = data[offset];
                offset += 8;
            }
            _ => break,
        }
        if data.len() < offset {
            return Err(PacketError::Truncated("ipv6 extension"));
        }
    }

    parse_l4(data, offset, next, src.into(), dst.into())
}

fn parse_l4<'a>(
    data: &'a [u8],
    l4_offset: usize,
    proto: u8,
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Result<PacketView<'a>, PacketError> {
    let l4 = data.get(l4_offset..).ok_or(PacketError::Truncated("l4"))?;

    let (l4proto, src_port, dst_port, payload_offset, tcp_flags) = match proto {
        PROTO_TCP => {
            if l4.len() < TCP_MIN_HLEN {
                return Err(PacketError::Truncated("tcp"));
            }
            let data_off = usize::from(l4[12] >> 4) * 4;
            if data_off < TCP_MIN_HLEN || l4.len() < data_off {
                return Err(PacketError::Truncated("tcp options"));
            }
            (L4Proto::Tcp, be16(l4, 0), be16(l4, 2), data_off, l4[13])
        }
        PROTO_UDP => {
            if l4.len() < UDP_HLEN {
                return Err(PacketError::Truncated("udp"));
            }
            (L4Proto::Udp, be16(l4, 0), be16(l4, 2), UDP_HLEN, 0)
        }
        PROTO_ICMP | PROTO_ICMPV6 => {
            if l4.len() < ICMP_HLEN {
                return Err(PacketError::Truncated("icmp"));
            }
            (L4Proto::Icmp, 0, 0, ICMP_HLEN, 0)
        }
        other => return Err(PacketError::UnsupportedProtocol(other)),
    };

    Ok(PacketView {
        tuple: FiveTuple {
            proto: l4proto,
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        },
        data,
        l7: &l4[payload_offset..],
        tcp_flags,
    })
}

fn be16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn ipv4_octets(data: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&data[offset..offset + 4]);
    out
}

fn ipv6_octets(data: &[u8], offset: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&data[offset..offset + 16]);
    out
}


#[cfg(test)]
mod tests {
    use super::testutil::{build_ipv4, build_tcp_v4, build_udp_v4};
    use super::*;

    #[test]
    fn parses_udp_tuple_and_payload() {
        let pkt = build_udp_v4(
            "10.215.0.2".parse().unwrap(),
            51000,
            "10.215.0.1".parse().unwrap(),
            53,
            b"hello",
        );
        let view = parse_packet(&pkt).unwrap();

        assert_eq!(view.tuple.proto, L4Proto::Udp);
        assert_eq!(view.tuple.src_port, 51000);
        assert_eq!(view.tuple.dst_port, 53);
        assert_eq!(view.tuple.ip_version(), 4);
        assert_eq!(view.l7, b"hello");
        assert!(!view.is_tcp_established());
    }

    #[test]
    fn tcp_syn_is_not_established() {
        let syn = build_tcp_v4(
            "10.215.0.2".parse().unwrap(),
            44000,
            "1.1.1.1".parse().unwrap(),
            853,
            TH_SYN,
            &[],
        );
        let view = parse_packet(&syn).unwrap();
        assert!(!view.is_tcp_established());
        assert_eq!(view.tcp_flags, TH_SYN);
    }

    #[test]
    fn tcp_ack_and_synack_are_established() {
        let src: Ipv4Addr = "10.215.0.2".parse().unwrap();
        let dst: Ipv4Addr = "1.2.3.4".parse().unwrap();

        let ack = build_tcp_v4(src, 44000, dst, 443, TH_ACK, &[]);
        assert!(parse_packet(&ack).unwrap().is_tcp_established());

        let synack = build_tcp_v4(src, 44000, dst, 443, TH_SYN | TH_ACK, &[]);
        assert!(parse_packet(&synack).unwrap().is_tcp_established());
    }

    #[test]
    fn parses_ipv6_udp() {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:4860:4860::8888".parse().unwrap();
        let mut pkt = vec![0u8; IPV6_HLEN];
        pkt[0] = 0x60;
        pkt[IPV6_NEXT_HDR_OFFSET] = PROTO_UDP;
        pkt[IPV6_SRC_OFFSET..IPV6_SRC_OFFSET + 16].copy_from_slice(&src.octets());
        pkt[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16].copy_from_slice(&dst.octets());
        pkt.extend_from_slice(&5000u16.to_be_bytes());
        pkt.extend_from_slice(&53u16.to_be_bytes());
        pkt.extend_from_slice(&8u16.to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        pkt[4..6].copy_from_slice(&8u16.to_be_bytes());

        let view = parse_packet(&pkt).unwrap();
        assert_eq!(view.tuple.ip_version(), 6);
        assert_eq!(view.tuple.dst_ip, IpAddr::V6(dst));
        assert_eq!(view.tuple.dst_port, 53);
    }

    #[test]
    fn rejects_truncated_and_unknown() {
        assert_eq!(parse_packet(&[]).unwrap_err(), PacketError::Truncated("ip"));
        assert_eq!(
            parse_packet(&[0x45; 10]).unwrap_err(),
            PacketError::Truncated("ipv4")
        );
        assert_eq!(
            parse_packet(&[0xA0; 40]).unwrap_err(),
            PacketError::UnsupportedVersion(10)
        );

        let gre = build_ipv4(
            47,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            &[0u8; 8],
        );
        assert_eq!(
            parse_packet(&gre).unwrap_err(),
            PacketError::UnsupportedProtocol(47)
        );
    }

    #[test]
    fn tuple_display() {
        let pkt = build_udp_v4(
            "10.215.0.2".parse().unwrap(),
            51000,
            "8.8.8.8".parse().unwrap(),
            53,
            &[],
        );
        let view = parse_packet(&pkt).unwrap();
        assert_eq!(
            view.tuple.to_string(),
            "[UDP] 10.215.0.2:51000 -> 8.8.8.8:53"
        );
    }
}

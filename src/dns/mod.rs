//! DNS interception policy
//!
//! Traffic towards DNS servers gets special treatment: plaintext UDP/53
//! queries are the only thing allowed through (optionally rewritten to
//! the real upstream resolver), because they are the one DNS transport
//! the capture pipeline can observe. Encrypted resolver transports
//! (DoT, DoH) would take domain visibility away, so connections carrying
//! them are refused before any NAT state exists, forcing clients back to
//! plaintext.
//!
//! The module also owns the set of well-known public resolver addresses
//! and the wire-header peek used by the gate.

pub mod host_cache;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use tracing::debug;

use crate::packet::{FiveTuple, L4Proto};

pub use host_cache::{HostLru, DEFAULT_HOST_CACHE_SIZE};

/// Plain DNS port
pub const DNS_PORT: u16 = 53;

/// Size of the fixed DNS wire header
pub const DNS_HEADER_SIZE: usize = 12;

/// QR bit: set on responses
const DNS_FLAG_RESPONSE: u16 = 0x8000;

/// Fixed DNS message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub transaction_id: u16,
    pub flags: u16,
    pub questions: u16,
    pub answers: u16,
    pub authority: u16,
    pub additional: u16,
}

impl DnsHeader {
    /// Read the header from the start of a UDP payload.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < DNS_HEADER_SIZE {
            return None;
        }
        let be16 = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        Some(Self {
            transaction_id: be16(0),
            flags: be16(2),
            questions: be16(4),
            answers: be16(6),
            authority: be16(8),
            additional: be16(10),
        })
    }

    /// Whether the QR bit marks this message as a query.
    #[must_use]
    pub const fn is_query(&self) -> bool {
        self.flags & DNS_FLAG_RESPONSE == 0
    }
}

/// Longest-prefix set of well-known public resolver addresses.
#[derive(Debug, Clone, Default)]
pub struct KnownDnsServers {
    nets: Vec<IpNet>,
}

impl KnownDnsServers {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The resolvers every mobile OS and browser knows how to reach
    /// directly (Google and Cloudflare, v4 + v6).
    #[must_use]
    pub fn well_known() -> Self {
        let mut set = Self::new();
        for server in [
            "8.8.8.8",
            "8.8.4.4",
            "1.1.1.1",
            "1.0.0.1",
            "2001:4860:4860::8888",
            "2001:4860:4860::8844",
            "2606:4700:4700::64",
            "2606:4700:4700::6400",
        ] {
            set.insert_host(server.parse().expect("static resolver address"));
        }
        set
    }

    /// Add a single host address (a /32 or /128 prefix).
    pub fn insert_host(&mut self, addr: IpAddr) {
        let net = match addr {
            IpAddr::V4(v4) => IpNet::new(IpAddr::V4(v4), 32),
            IpAddr::V6(v6) => IpNet::new(IpAddr::V6(v6), 128),
        };
        if let Ok(net) = net {
            self.nets.push(net);
        }
    }

    /// Longest-prefix match.
    #[must_use]
    pub fn matches(&self, addr: IpAddr) -> bool {
        self.nets
            .iter()
            .filter(|net| net.contains(&addr))
            .max_by_key(|net| net.prefix_len())
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// Gate decision for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsVerdict {
    /// Not DNS-server traffic the gate cares about; admit as-is
    Pass,
    /// A plaintext DNS query; admit and count. `rewrite` asks for DNAT to
    /// the real upstream resolver (the destination was the tun-side
    /// resolver address).
    Query { rewrite: bool },
    /// Refuse the connection before admission (DoT, DoH, malformed or
    /// non-query port-53 payloads)
    Block,
}

/// Per-run DNS policy state.
#[derive(Debug)]
pub struct DnsGate {
    /// Tun-side resolver address handed to the device
    vpn_dns: Ipv4Addr,
    /// Configured IPv6 resolver, when IPv6 is captured
    ipv6_dns: Option<Ipv6Addr>,
    known_servers: KnownDnsServers,
}

impl DnsGate {
    #[must_use]
    pub fn new(vpn_dns: Ipv4Addr, ipv6_dns: Option<Ipv6Addr>) -> Self {
        Self {
            vpn_dns,
            ipv6_dns,
            known_servers: KnownDnsServers::well_known(),
        }
    }

    /// Whether the destination is the tun-side resolver address.
    #[must_use]
    pub fn is_internal_dns(&self, tuple: &FiveTuple) -> bool {
        tuple.dst_ip == IpAddr::V4(self.vpn_dns)
    }

    /// Decide the fate of a new connection from its first packet.
    #[must_use]
    pub fn evaluate(&self, tuple: &FiveTuple, l7: &[u8]) -> DnsVerdict {
        let is_internal = self.is_internal_dns(tuple);
        let is_dns_server = is_internal
            || self
                .ipv6_dns
                .is_some_and(|dns| tuple.dst_ip == IpAddr::V6(dns))
            || self.known_servers.matches(tuple.dst_ip);

        if !is_dns_server {
            return DnsVerdict::Pass;
        }

        match tuple.proto {
            L4Proto::Udp if tuple.dst_port == DNS_PORT => {
                match DnsHeader::parse(l7) {
                    Some(header) if header.is_query() => {
                        debug!("DNS query towards {} ({} B)", tuple.dst_ip, l7.len());
                        DnsVerdict::Query {
                            rewrite: is_internal,
                        }
                    }
                    // Responses and runt payloads have no business
                    // arriving from the device side.
                    _ => DnsVerdict::Block,
                }
            }
            // Other UDP ports towards the internal resolver are the
            // host's own health probes; the reportability filter hides
            // them, the gate lets them through.
            L4Proto::Udp => DnsVerdict::Pass,
            // TCP/853 (DoT), TCP/443 (DoH) and anything else aimed at a
            // resolver address is refused to keep domains observable.
            _ => DnsVerdict::Block,
        }
    }
}

//! Capture configuration
//!
//! One flat structure gathered from the host's preference getters at
//! startup, validated once, then immutable for the run. Field names map
//! onto the host getters: `vpn_ipv4` ← `getVpnIPv4`, `vpn_dns` ←
//! `getVpnDns`, `dns_server` ← `getDnsServer`, `ipv6_dns_server` ←
//! `getIpv6DnsServer`, `ipv6_enabled` ← `getIPv6Enabled`, the `pcap`
//! section ← `dumpPcapToJava` / `dumpPcapToUdp` /
//! `getPcapCollectorAddress` / `getPcapCollectorPort`, and the `socks5`
//! section ← `getSocks5Enabled` / `getSocks5ProxyAddress` /
//! `getSocks5ProxyPort`.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pcap::PcapTransport;

fn default_mtu() -> u32 {
    32767
}

/// Remote pcap collector endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PcapCollectorConfig {
    /// Collector address (IPv4; the collector lives outside the tunnel)
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub transport: PcapTransport,
}

impl PcapCollectorConfig {
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.address, self.port))
    }
}

/// Which pcap sinks are active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PcapDumpConfig {
    /// Buffer records and deliver them through the host callback
    #[serde(default)]
    pub dump_to_host: bool,
    /// Stream records to a remote collector
    #[serde(default)]
    pub collector: Option<PcapCollectorConfig>,
}

impl PcapDumpConfig {
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        self.dump_to_host || self.collector.is_some()
    }
}

/// SOCKS5 proxy for TCP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Socks5Config {
    pub address: Ipv4Addr,
    pub port: u16,
}

/// Per-run capture configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Device address on the tun interface
    pub vpn_ipv4: Ipv4Addr,
    /// Resolver address advertised to the device (tun side)
    pub vpn_dns: Ipv4Addr,
    /// Real upstream resolver queries are rewritten to
    pub dns_server: Ipv4Addr,
    /// Capture IPv6 traffic at all
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// IPv6 resolver subject to the DNS policy
    #[serde(default)]
    pub ipv6_dns_server: Option<Ipv6Addr>,
    /// Tun MTU; also the pcap snap length
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub pcap: PcapDumpConfig,
    /// Redirect TCP through this SOCKS5 proxy when set
    #[serde(default)]
    pub socks5: Option<Socks5Config>,
}

impl CaptureConfig {
    /// Validate cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for impossible combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu == 0 {
            return Err(ConfigError::validation("mtu must be non-zero"));
        }
        if let Some(collector) = &self.pcap.collector {
            if collector.port == 0 {
                return Err(ConfigError::validation("pcap collector port must be set"));
            }
        }
        if let Some(socks5) = &self.socks5 {
            if socks5.port == 0 {
                return Err(ConfigError::validation("socks5 proxy port must be set"));
            }
        }
        if self.vpn_dns.is_unspecified() || self.dns_server.is_unspecified() {
            return Err(ConfigError::validation("DNS addresses must be set"));
        }
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            vpn_ipv4: Ipv4Addr::new(10, 215, 0, 2),
            vpn_dns: Ipv4Addr::new(10, 215, 0, 1),
            dns_server: Ipv4Addr::new(8, 8, 8, 8),
            ipv6_enabled: false,
            ipv6_dns_server: None,
            mtu: default_mtu(),
            pcap: PcapDumpConfig::default(),
            socks5: None,
        }
    }
}

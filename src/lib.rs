//! tuncap: userspace-NAT traffic capture core
//!
//! This crate is the native packet-processing core of a mobile
//! traffic-capture tool. The host platform hands it a tun file
//! descriptor; the core NATs the raw IP stream to real sockets through
//! an external userspace NAT library, classifies every connection with
//! deep packet inspection, enforces a plaintext-only DNS policy, frames
//! packets into libpcap captures, and reports connection batches and
//! aggregate statistics back to the host on a bounded cadence.
//!
//! # Architecture
//!
//! ```text
//! tun fd → select loop → NAT library → sockets
//!              ↓ callbacks
//!      DNS gate / DPI / accounting
//!              ↓
//!   pcap sinks + connection batches → host
//! ```
//!
//! The loop is single-threaded and cooperative; the only cross-thread
//! surface is the atomic flag handle [`CaptureControl`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tuncap::{run, CaptureConfig, CaptureControl, SniffEngine};
//! # fn demo<N: tuncap::PacketNat, H: tuncap::HostBridge>(mut nat: N, host: H, tun_fd: i32) -> Result<(), tuncap::CaptureError> {
//!
//! let config = CaptureConfig::default();
//! let control = Arc::new(CaptureControl::new());
//!
//! // From another thread: control.stop(), control.request_stats_dump(),
//! // control.set_dns_server(...)
//! run(config, tun_fd, &mut nat, SniffEngine::new(), host, control)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`capture`]: the packet loop, housekeeping cadence, and control handle
//! - [`config`]: per-run configuration
//! - [`conn`]: connection records, side table, and report batches
//! - [`dns`]: DNS policy gate, known resolvers, and the host-name cache
//! - [`dpi`]: flow classification driver and the built-in sniffing engine
//! - [`error`]: error hierarchy
//! - [`events`]: host-bound event payloads
//! - [`host`]: host platform bridge trait
//! - [`nat`]: userspace NAT library seam
//! - [`packet`]: raw-IP packet parsing
//! - [`pcap`]: libpcap framing and export sinks

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod capture;
pub mod config;
pub mod conn;
pub mod dns;
pub mod dpi;
pub mod error;
pub mod events;
pub mod host;
pub mod nat;
pub mod packet;
pub mod pcap;

// Re-export the types a host integration touches.
pub use capture::{run, CaptureControl, CaptureCore};
pub use config::{CaptureConfig, PcapCollectorConfig, PcapDumpConfig, Socks5Config};
pub use conn::{ConnCollector, ConnRecord, ConnTable, UID_UNKNOWN};
pub use dns::{DnsGate, DnsHeader, DnsVerdict, HostLru, KnownDnsServers};
pub use dpi::{
    Direction, DpiConclusion, DpiDriver, DpiEngine, FlowMetadata, L7Classification, L7Protocol,
    SniffEngine, MAX_DPI_PACKETS,
};
pub use error::{CaptureError, ConfigError, DpiError, NatError, PcapError};
pub use events::{ConnectionEvent, ServiceStatus, StatsEvent};
pub use host::{HostBridge, UID_NETD, UID_ROOT};
pub use nat::{Admission, ConnEvent, ConnId, ConnStatus, NatEvents, NatStats, PacketNat, Verdict};
pub use packet::{parse_packet, FiveTuple, L4Proto, PacketError, PacketView};
pub use pcap::{
    HostPcapBuffer, PcapCollector, PcapFileHeader, PcapRecordHeader, PcapTransport,
    HOST_BUFFER_CAPACITY,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

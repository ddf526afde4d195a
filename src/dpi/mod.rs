//! Deep packet inspection driver
//!
//! Flow classification is delegated to a [`DpiEngine`]; this module owns
//! the driving policy around it: when to feed packets, when to give up,
//! and which metadata to extract once a flow concludes. The engine's flow
//! handles live in a side map keyed by connection token and are freed as
//! soon as detection concludes, so DPI memory stays bounded by the number
//! of young flows.
//!
//! A payload-sniffing engine good enough for the common protocols ships
//! in [`detector`]; hosts with a full nDPI-class library plug it in
//! through the same trait.

pub mod detector;
pub mod dns;
pub mod http;
pub mod tls;

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DpiError;
use crate::nat::ConnId;
use crate::packet::PacketView;

pub use detector::{SniffEngine, SniffFlow};

/// Detection stops once a flow has seen this many packets in total.
pub const MAX_DPI_PACKETS: u64 = 12;

/// Application-layer protocols the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum L7Protocol {
    #[default]
    Unknown,
    Dns,
    Http,
    Tls,
    Quic,
    Ssh,
    Ntp,
    Ftp,
    Smtp,
    Sip,
}

impl L7Protocol {
    /// Display name used in reports
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Dns => "DNS",
            Self::Http => "HTTP",
            Self::Tls => "TLS",
            Self::Quic => "QUIC",
            Self::Ssh => "SSH",
            Self::Ntp => "NTP",
            Self::Ftp => "FTP",
            Self::Smtp => "SMTP",
            Self::Sip => "SIP",
        }
    }

    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// `(app, master)` classification pair of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct L7Classification {
    /// Most specific protocol detected
    pub app: L7Protocol,
    /// Carrier protocol, used for report naming
    pub master: L7Protocol,
}

/// Direction of a packet relative to the tun device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device towards the network
    FromTun,
    /// Network towards the device
    FromNet,
}

/// Fields the engine extracted from a flow's payloads.
#[derive(Debug, Clone, Default)]
pub struct FlowMetadata {
    /// Hostname seen on the wire: DNS query name, HTTP Host, or TLS SNI
    pub host_name: Option<String>,
    /// Full HTTP URL, when the flow carried a plain request
    pub url: Option<String>,
    /// Address a DNS answer resolved to, already validated by the engine
    /// (non-zero A record, or global-unicast AAAA)
    pub dns_reply: Option<IpAddr>,
}

/// Outcome of a concluded flow, ready to fold into the connection record.
#[derive(Debug, Clone, Default)]
pub struct DpiConclusion {
    pub l7: L7Classification,
    /// Replacement for the record's `info` field, when extracted
    pub info: Option<String>,
    /// HTTP URL, when extracted
    pub url: Option<String>,
    /// `(resolved address, hostname)` pair to learn in the host cache
    pub host_mapping: Option<(IpAddr, String)>,
}

/// Flow classification engine contract.
pub trait DpiEngine {
    /// Per-flow detection state
    type Flow;

    /// Allocate detection state for a new flow.
    ///
    /// # Errors
    ///
    /// Allocation failure is per-connection: the caller proceeds without
    /// DPI for that flow.
    fn new_flow(&mut self) -> Result<Self::Flow, DpiError>;

    /// Feed one packet to the flow; endpoint state inside the flow is
    /// kept aligned to `direction`. Returns the classification so far.
    fn process_packet(
        &mut self,
        flow: &mut Self::Flow,
        pkt: &PacketView<'_>,
        direction: Direction,
        timestamp_ms: u64,
    ) -> L7Classification;

    /// Whether feeding more packets could still refine the result.
    fn extra_dissection_possible(&self, flow: &Self::Flow) -> bool;

    /// Final chance: guess a protocol for a still-unknown flow.
    fn giveup(&mut self, flow: &mut Self::Flow) -> L7Classification;

    /// Metadata extracted so far.
    fn metadata(&self, flow: &Self::Flow) -> FlowMetadata;

    /// Whether `proto` belongs to the set of master protocols worth
    /// reporting in place of the plain transport name.
    fn is_master_protocol(&self, proto: L7Protocol) -> bool;

    /// Display name for a protocol.
    fn protocol_name(&self, proto: L7Protocol) -> &'static str {
        proto.name()
    }
}

/// Drives a [`DpiEngine`] across the packets of every young flow.
pub struct DpiDriver<E: DpiEngine> {
    engine: E,
    flows: HashMap<ConnId, E::Flow>,
}

impl<E: DpiEngine> DpiDriver<E> {
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            flows: HashMap::new(),
        }
    }

    /// Access the engine, e.g. for protocol naming at report time.
    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Allocate detection state for a new connection. On failure the
    /// connection simply runs without DPI.
    pub fn open_flow(&mut self, conn: ConnId) {
        match self.engine.new_flow() {
            Ok(flow) => {
                self.flows.insert(conn, flow);
            }
            Err(e) => warn!("DPI flow allocation failed, proceeding without DPI: {e}"),
        }
    }

    /// Whether detection is still running for this connection.
    #[must_use]
    pub fn has_flow(&self, conn: ConnId) -> bool {
        self.flows.contains_key(&conn)
    }

    /// Number of flows still under detection.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Feed one accounted packet. `total_packets` is the connection's
    /// packet count including this packet; once it reaches
    /// [`MAX_DPI_PACKETS`] the flow is concluded whatever the engine
    /// says. Returns the conclusion when detection finished.
    pub fn process(
        &mut self,
        conn: ConnId,
        pkt: &PacketView<'_>,
        direction: Direction,
        timestamp_ms: u64,
        total_packets: u64,
    ) -> Option<DpiConclusion> {
        let flow = self.flows.get_mut(&conn)?;
        let giveup = total_packets >= MAX_DPI_PACKETS;

        let l7 = self
            .engine
            .process_packet(flow, pkt, direction, timestamp_ms);

        if giveup || (l7.app.is_known() && !self.engine.extra_dissection_possible(flow)) {
            return self.conclude(conn);
        }
        None
    }

    /// Finalize on connection close; no-op when the flow already
    /// concluded.
    pub fn finalize(&mut self, conn: ConnId) -> Option<DpiConclusion> {
        if self.flows.contains_key(&conn) {
            self.conclude(conn)
        } else {
            None
        }
    }

    /// Drop every remaining flow (run teardown).
    pub fn clear(&mut self) {
        self.flows.clear();
    }

    fn conclude(&mut self, conn: ConnId) -> Option<DpiConclusion> {
        let mut flow = self.flows.remove(&conn)?;

        let mut l7 = self.engine.giveup(&mut flow);
        if !l7.master.is_known() {
            l7.master = l7.app;
        }

        let meta = self.engine.metadata(&flow);
        debug!(
            "DPI concluded: app={}, master={}",
            l7.app.name(),
            l7.master.name()
        );

        let mut conclusion = DpiConclusion {
            l7,
            ..DpiConclusion::default()
        };

        match l7.master {
            L7Protocol::Dns => {
                // Ignore names without a dot, they are not real domains.
                if let Some(host) = meta.host_name.filter(|h| h.contains('.')) {
                    if let Some(addr) = meta.dns_reply {
                        debug!("host cache learn: {addr} -> {host}");
                        conclusion.host_mapping = Some((addr, host.clone()));
                    }
                    conclusion.info = Some(host);
                }
            }
            L7Protocol::Http => {
                conclusion.info = meta.host_name;
                conclusion.url = meta.url;
            }
            L7Protocol::Tls => {
                conclusion.info = meta.host_name;
            }
            _ => {}
        }

        Some(conclusion)
    }
}

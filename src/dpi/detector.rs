//! Built-in payload-sniffing DPI engine
//!
//! [`SniffEngine`] implements [`DpiEngine`] by inspecting the first
//! payloads of a flow: TLS `ClientHello` SNI, HTTP request head, and DNS
//! messages, with a port-based guess when give-up time arrives. It covers
//! the protocols the capture pipeline actually extracts metadata from; a
//! host wanting broader coverage can substitute a heavier engine behind
//! the same trait.

use super::{dns, http, tls, Direction, DpiEngine, FlowMetadata, L7Classification, L7Protocol};
use crate::error::DpiError;
use crate::packet::{L4Proto, PacketView};

const PORT_DNS: u16 = 53;
const PORT_HTTP: u16 = 80;
const PORT_HTTP_ALT: u16 = 8080;
const PORT_HTTPS: u16 = 443;
const PORT_SSH: u16 = 22;
const PORT_NTP: u16 = 123;
const PORT_FTP: u16 = 21;
const PORT_SMTP: u16 = 25;
const PORT_SMTP_SUBMISSION: u16 = 587;
const PORT_SIP: u16 = 5060;

/// Payload-sniffing flow classifier.
#[derive(Debug, Default)]
pub struct SniffEngine;

impl SniffEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Per-flow sniffing state.
#[derive(Debug, Default)]
pub struct SniffFlow {
    l7: L7Classification,
    meta: FlowMetadata,
    /// Port-derived fallback, remembered from the first packet
    port_guess: L7Protocol,
    seen_packet: bool,
    /// Set once no further payload could refine the result
    concluded: bool,
}

impl DpiEngine for SniffEngine {
    type Flow = SniffFlow;

    fn new_flow(&mut self) -> Result<Self::Flow, DpiError> {
        Ok(SniffFlow::default())
    }

    fn process_packet(
        &mut self,
        flow: &mut Self::Flow,
        pkt: &PacketView<'_>,
        _direction: Direction,
        _timestamp_ms: u64,
    ) -> L7Classification {
        if !flow.seen_packet {
            flow.seen_packet = true;
            flow.port_guess = guess_by_port(
                pkt.tuple.proto,
                pkt.tuple.src_port,
                pkt.tuple.dst_port,
            );
        }

        if flow.concluded || pkt.l7.is_empty() {
            return flow.l7;
        }

        match pkt.tuple.proto {
            L4Proto::Udp => self.sniff_udp(flow, pkt),
            L4Proto::Tcp => self.sniff_tcp(flow, pkt),
            L4Proto::Icmp => {}
        }

        flow.l7
    }

    fn extra_dissection_possible(&self, flow: &Self::Flow) -> bool {
        !flow.concluded
    }

    fn giveup(&mut self, flow: &mut Self::Flow) -> L7Classification {
        if !flow.l7.app.is_known() {
            flow.l7.app = flow.port_guess;
        }
        flow.concluded = true;
        flow.l7
    }

    fn metadata(&self, flow: &Self::Flow) -> FlowMetadata {
        flow.meta.clone()
    }

    fn is_master_protocol(&self, proto: L7Protocol) -> bool {
        proto.is_known()
    }
}

impl SniffEngine {
    fn sniff_udp(&self, flow: &mut SniffFlow, pkt: &PacketView<'_>) {
        let ports = (pkt.tuple.src_port, pkt.tuple.dst_port);

        if ports.0 == PORT_DNS || ports.1 == PORT_DNS {
            if let Some(d) = dns::dissect(pkt.l7) {
                flow.l7 = classified(L7Protocol::Dns);
                if flow.meta.host_name.is_none() {
                    flow.meta.host_name = d.query_name;
                }
                if d.is_response {
                    flow.meta.dns_reply = d.reply_addr;
                    // The answer is the last thing a DNS flow can teach us.
                    flow.concluded = true;
                }
            }
        } else if ports.1 == PORT_HTTPS || ports.0 == PORT_HTTPS {
            // QUIC initial packets are encrypted; classify without SNI.
            flow.l7 = classified(L7Protocol::Quic);
            flow.concluded = true;
        } else if ports.1 == PORT_NTP || ports.0 == PORT_NTP {
            flow.l7 = classified(L7Protocol::Ntp);
            flow.concluded = true;
        }
    }

    fn sniff_tcp(&self, flow: &mut SniffFlow, pkt: &PacketView<'_>) {
        if tls::is_tls_handshake(pkt.l7) {
            flow.l7 = classified(L7Protocol::Tls);
            if let Some(sni) = tls::extract_sni(pkt.l7) {
                flow.meta.host_name = Some(sni);
            }
            // Nothing after the ClientHello is readable.
            flow.concluded = true;
        } else if http::looks_like_http(pkt.l7) {
            if let Some(info) = http::parse_request(pkt.l7) {
                flow.l7 = classified(L7Protocol::Http);
                flow.meta.url = info.url();
                flow.meta.host_name = info.host;
                flow.concluded = true;
            }
        }
    }
}

const fn classified(proto: L7Protocol) -> L7Classification {
    L7Classification {
        app: proto,
        master: proto,
    }
}

fn guess_by_port(proto: L4Proto, src_port: u16, dst_port: u16) -> L7Protocol {
    let by_port = |port: u16| match (proto, port) {
        (_, PORT_DNS) => L7Protocol::Dns,
        (L4Proto::Tcp, PORT_HTTP | PORT_HTTP_ALT) => L7Protocol::Http,
        (L4Proto::Tcp, PORT_HTTPS) => L7Protocol::Tls,
        (L4Proto::Udp, PORT_HTTPS) => L7Protocol::Quic,
        (L4Proto::Tcp, PORT_SSH) => L7Protocol::Ssh,
        (L4Proto::Udp, PORT_NTP) => L7Protocol::Ntp,
        (L4Proto::Tcp, PORT_FTP) => L7Protocol::Ftp,
        (L4Proto::Tcp, PORT_SMTP | PORT_SMTP_SUBMISSION) => L7Protocol::Smtp,
        (_, PORT_SIP) => L7Protocol::Sip,
        _ => L7Protocol::Unknown,
    };

    let guess = by_port(dst_port);
    if guess.is_known() {
        guess
    } else {
        by_port(src_port)
    }
}

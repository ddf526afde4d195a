//! Per-run capture state and the NAT event surface
//!
//! [`CaptureCore`] owns every piece of per-run state: the connection side
//! table, report batches, DNS policy, host cache, DPI driver, pcap sinks,
//! and the counters behind the stats emission. It implements
//! [`NatEvents`], so the NAT library drives admission, accounting and
//! close handling straight into it.

use std::io;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use super::{
    CaptureControl, CAPTURE_STATS_UPDATE_MS, CONNECTION_DUMP_UPDATE_MS, MAX_HOST_PCAP_DELAY_MS,
    PERIODIC_PURGE_TIMEOUT_MS,
};
use crate::config::CaptureConfig;
use crate::conn::{ConnCollector, ConnRecord, ConnTable, UID_UNKNOWN};
use crate::dns::{DnsGate, DnsVerdict, HostLru, DNS_PORT};
use crate::dpi::{Direction, DpiConclusion, DpiDriver, DpiEngine};
use crate::error::CaptureError;
use crate::events::{ConnectionEvent, ServiceStatus, StatsEvent};
use crate::host::{app_name_for_uid, HostBridge};
use crate::nat::{Admission, ConnEvent, ConnId, NatEvents, NatStats, PacketNat, Verdict};
use crate::packet::{parse_packet, FiveTuple, L4Proto, PacketView};
use crate::pcap::{HostPcapBuffer, PcapCollector};

/// Aggregate traffic totals across reportable connections.
#[derive(Debug, Default)]
struct TrafficTotals {
    sent_pkts: u64,
    rcvd_pkts: u64,
    sent_bytes: u64,
    rcvd_bytes: u64,
    /// Something changed since the last stats emission
    new_stats: bool,
    last_update_ms: u64,
}

/// All per-run capture state.
pub struct CaptureCore<E: DpiEngine, H: HostBridge> {
    config: CaptureConfig,
    host: H,
    control: Arc<CaptureControl>,
    tun_fd: RawFd,

    conns: ConnTable,
    collector: ConnCollector,
    gate: DnsGate,
    hosts: HostLru,
    dpi: DpiDriver<E>,

    totals: TrafficTotals,
    dropped_connections: u32,
    dns_requests: u32,
    next_incr_id: u32,

    host_pcap: Option<HostPcapBuffer>,
    pcap_collector: Option<PcapCollector>,

    /// Loop time cache, refreshed once per iteration
    now_ms: u64,
    now_usec: u64,
    last_conn_dump_ms: u64,
    next_purge_ms: u64,

    /// Set by the admission gate when the last lookup was refused
    last_conn_blocked: bool,
}

impl<E: DpiEngine, H: HostBridge> CaptureCore<E, H> {
    /// Assemble the per-run state. The clock and housekeeping timers
    /// start now; the first connection dump is due one dump interval in.
    pub fn new(
        config: CaptureConfig,
        engine: E,
        host: H,
        control: Arc<CaptureControl>,
        tun_fd: RawFd,
    ) -> Self {
        let gate = DnsGate::new(config.vpn_dns, config.ipv6_dns_server);
        let mut core = Self {
            config,
            host,
            control,
            tun_fd,
            conns: ConnTable::new(),
            collector: ConnCollector::new(),
            gate,
            hosts: HostLru::default(),
            dpi: DpiDriver::new(engine),
            totals: TrafficTotals::default(),
            dropped_connections: 0,
            dns_requests: 0,
            next_incr_id: 0,
            host_pcap: None,
            pcap_collector: None,
            now_ms: 0,
            now_usec: 0,
            last_conn_dump_ms: 0,
            next_purge_ms: 0,
            last_conn_blocked: false,
        };
        core.refresh_clock();
        core.last_conn_dump_ms = core.now_ms;
        core.next_purge_ms = core.now_ms + PERIODIC_PURGE_TIMEOUT_MS;
        core
    }

    /// Cache the wall clock for this loop iteration.
    pub fn refresh_clock(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.now_usec = now.as_micros() as u64;
        self.now_ms = now.as_millis() as u64;
    }

    #[must_use]
    pub fn control(&self) -> &CaptureControl {
        &self.control
    }

    #[must_use]
    pub fn dns_requests(&self) -> u32 {
        self.dns_requests
    }

    #[must_use]
    pub fn dropped_connections(&self) -> u32 {
        self.dropped_connections
    }

    /// Records currently held in the side table.
    #[must_use]
    pub fn active_records(&self) -> usize {
        self.conns.len()
    }

    /// Announce the service to the host.
    pub fn announce_started(&mut self) {
        self.host.send_service_status(ServiceStatus::Started);
    }

    /// Open the configured pcap sinks.
    ///
    /// # Errors
    ///
    /// A TCP collector that cannot be reached is fatal for the run.
    pub fn open_pcap_sinks(&mut self) -> Result<(), CaptureError> {
        if self.config.pcap.dump_to_host {
            self.host_pcap = Some(HostPcapBuffer::new(self.config.mtu));
        }
        if let Some(collector) = self.config.pcap.collector {
            let host = &self.host;
            self.pcap_collector = Some(PcapCollector::connect(
                collector.socket_addr(),
                collector.transport,
                self.config.mtu,
                |fd| host.protect_socket(fd),
            )?);
        }
        Ok(())
    }

    /// Process one packet read from the tun device.
    pub fn handle_tun_packet<N: PacketNat>(&mut self, nat: &mut N, data: &[u8]) {
        let pkt = match parse_packet(data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("packet parse failed: {e}");
                return;
            }
        };

        if pkt.tuple.ip_version() == 6 && !self.config.ipv6_enabled {
            debug!("ignoring IPv6 packet: {}", pkt.tuple);
            return;
        }

        // Mid-stream TCP arrivals must not create connections.
        let established = pkt.is_tcp_established();
        self.last_conn_blocked = false;

        let Some(conn) = nat.lookup(&pkt, !established, self) else {
            if self.last_conn_blocked {
                // The gate refused it; that is the designed outcome.
            } else if established {
                debug!("skipping established TCP: {}", pkt.tuple);
            } else {
                self.dropped_connections += 1;
                error!("connection lookup failed: {}", pkt.tuple);
            }
            return;
        };

        if self.config.socks5.is_some() {
            self.check_socks5_redirection(nat, &pkt, conn);
        }

        if let Err(e) = nat.forward(&pkt, conn, self) {
            error!("forward failed for {}: {e}", pkt.tuple);
            self.dropped_connections += 1;
            nat.destroy_conn(conn, self);
        }
    }

    /// Run at most one overdue housekeeping task, priority-ordered so a
    /// hot packet stream cannot starve any of them.
    pub fn housekeeping<N: PacketNat>(&mut self, nat: &mut N) {
        let now = self.now_ms;

        if (self.totals.new_stats
            && now.saturating_sub(self.totals.last_update_ms) >= CAPTURE_STATS_UPDATE_MS)
            || self.control.stats_dump_forced()
        {
            self.control.clear_stats_dump();
            let stats = nat.stats();
            self.emit_stats(&stats);
        } else if now.saturating_sub(self.last_conn_dump_ms) >= CONNECTION_DUMP_UPDATE_MS {
            self.flush_connections();
            self.last_conn_dump_ms = now;
        } else if self
            .host_pcap
            .as_ref()
            .is_some_and(|buf| !buf.is_empty() && now.saturating_sub(buf.last_flush_ms) >= MAX_HOST_PCAP_DELAY_MS)
        {
            self.flush_host_pcap();
        } else if now >= self.next_purge_ms || self.control.purge_forced() {
            self.control.clear_purge();
            nat.purge_expired(now / 1000, self);
            self.next_purge_ms = now + PERIODIC_PURGE_TIMEOUT_MS;
        }
    }

    /// Emit the aggregate stats event.
    pub fn emit_stats(&mut self, nat_stats: &NatStats) {
        let event = StatsEvent {
            sent_bytes: self.totals.sent_bytes,
            rcvd_bytes: self.totals.rcvd_bytes,
            sent_pkts: self.totals.sent_pkts,
            rcvd_pkts: self.totals.rcvd_pkts,
            dropped_connections: self.dropped_connections,
            open_sockets: nat_stats.open_sockets,
            max_fd: nat_stats.max_fd,
            active_connections: nat_stats.active_connections(),
            total_connections: nat_stats.opened_connections(),
            dns_requests: self.dns_requests,
        };
        self.host.send_stats_dump(&event);
        self.totals.new_stats = false;
        self.totals.last_update_ms = self.now_ms;
    }

    /// Drain both report batches into one host dump, then free records
    /// whose final update was just delivered.
    pub fn flush_connections(&mut self) {
        if self.collector.is_empty() {
            return;
        }
        debug!(
            "connections dump: new={}, updated={}",
            self.collector.new_count(),
            self.collector.updated_count()
        );

        let (new_ids, updated_ids) = self.collector.take();
        let new_events = self.snapshot_batch(&new_ids);
        let updated_events = self.snapshot_batch(&updated_ids);

        self.host.send_connections_dump(&new_events, &updated_events);

        for id in new_ids.into_iter().chain(updated_ids) {
            if self.conns.get(id).is_some_and(|rec| rec.status.is_closed()) {
                self.conns.remove(id);
            }
        }
    }

    fn snapshot_batch(&mut self, ids: &[ConnId]) -> Vec<ConnectionEvent> {
        let mut events = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(record) = self.conns.get_mut(id) {
                record.pending_notification = false;
                let label = proto_label(self.dpi.engine(), record);
                events.push(ConnectionEvent::from_record(record, &label));
            } else {
                error!("batched connection {id} has no record");
            }
        }
        events
    }

    /// Deliver the host pcap buffer, if it holds anything.
    pub fn flush_host_pcap(&mut self) {
        let now_ms = self.now_ms;
        if let Some(buf) = self.host_pcap.as_mut() {
            if !buf.is_empty() {
                debug!("exporting {} B pcap buffer", buf.len());
                let data = buf.take(now_ms);
                self.host.dump_pcap_data(&data);
            }
        }
    }

    /// Release every per-run resource and announce the stop.
    pub fn teardown(&mut self) {
        self.flush_host_pcap();
        self.collector.clear();
        self.conns.clear();
        self.dpi.clear();
        self.pcap_collector = None;
        debug!("host cache size at teardown: {}", self.hosts.len());
        self.host.send_service_status(ServiceStatus::Stopped);
    }

    /// Connections towards the tun-side resolver on other ports are the
    /// host platform probing its own DNS health; they are NATed but never
    /// reported.
    fn should_ignore(&self, tuple: &FiveTuple) -> bool {
        tuple.dst_ip == IpAddr::V4(self.config.vpn_dns) && tuple.dst_port != DNS_PORT
    }

    fn check_socks5_redirection<N: PacketNat>(
        &mut self,
        nat: &mut N,
        pkt: &PacketView<'_>,
        conn: ConnId,
    ) {
        if self.should_ignore(&pkt.tuple) {
            return;
        }
        let fresh = self
            .conns
            .get(conn)
            .is_some_and(|record| record.total_packets() == 0);
        if pkt.tuple.proto == L4Proto::Tcp && fresh {
            nat.mark_proxied(conn);
        }
    }

    fn apply_conclusion(&mut self, conn: ConnId, conclusion: DpiConclusion) {
        if let Some((addr, host)) = conclusion.host_mapping {
            self.hosts.add(addr, host);
        }
        if let Some(record) = self.conns.get_mut(conn) {
            record.l7 = conclusion.l7;
            if conclusion.info.is_some() {
                // Later DPI completion wins over an admission-time cache hit.
                record.info = conclusion.info;
            }
            if conclusion.url.is_some() {
                record.url = conclusion.url;
            }
        }
    }

    fn dump_packet_to_sinks(&mut self, pkt: &[u8]) {
        let ts = self.now_usec;

        if self
            .host_pcap
            .as_ref()
            .is_some_and(|buf| !buf.fits(pkt.len()))
        {
            self.flush_host_pcap();
        }
        if let Some(buf) = self.host_pcap.as_mut() {
            if !buf.append(ts, pkt) {
                error!("pcap record larger than the host buffer ({} B)", pkt.len());
            }
        }

        if let Some(collector) = self.pcap_collector.as_mut() {
            if let Err(e) = collector.dump_record(ts, pkt) {
                warn!("pcap collector send failed: {e}");
            }
        }
    }
}

impl<E: DpiEngine, H: HostBridge> NatEvents for CaptureCore<E, H> {
    fn send_client(&mut self, pkt: &[u8], conn: &ConnEvent<'_>) -> io::Result<()> {
        if !self.control.is_running() {
            return Ok(());
        }

        let rv = unsafe { libc::write(self.tun_fd, pkt.as_ptr().cast(), pkt.len()) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOBUFS) => {
                    // The connection is abandoned, the loop survives.
                    error!("tun write ENOBUFS for {}", conn.tuple);
                }
                Some(libc::EIO) => {
                    info!("tun I/O error (terminating?)");
                    self.control.stop();
                }
                _ => {
                    error!("tun write ({} B) failed: {err}", pkt.len());
                    self.control.stop();
                }
            }
            return Err(err);
        }

        let written = rv as usize;
        if written != pkt.len() {
            error!("partial tun write ({written} / {})", pkt.len());
            self.control.stop();
            return Err(io::Error::new(io::ErrorKind::WriteZero, "partial tun write"));
        }
        Ok(())
    }

    fn account_packet(&mut self, pkt: &[u8], from_tun: bool, conn: &ConnEvent<'_>) {
        let now_secs = self.now_ms / 1000;

        let total_packets = match self.conns.get_mut(conn.id) {
            Some(record) => {
                record.account(pkt.len(), from_tun, now_secs, conn.status);
                record.total_packets()
            }
            None => {
                error!("missing record for connection {}", conn.tuple);
                return;
            }
        };

        if self.dpi.has_flow(conn.id) {
            if let Ok(view) = parse_packet(pkt) {
                let direction = if from_tun {
                    Direction::FromTun
                } else {
                    Direction::FromNet
                };
                if let Some(conclusion) =
                    self.dpi
                        .process(conn.id, &view, direction, self.now_ms, total_packets)
                {
                    self.apply_conclusion(conn.id, conclusion);
                }
            }
        }

        if self.should_ignore(conn.tuple) {
            return;
        }

        if from_tun {
            self.totals.sent_pkts += 1;
            self.totals.sent_bytes += pkt.len() as u64;
        } else {
            self.totals.rcvd_pkts += 1;
            self.totals.rcvd_bytes += pkt.len() as u64;
        }
        self.totals.new_stats = true;

        if let Some(record) = self.conns.get_mut(conn.id) {
            if !record.pending_notification {
                record.pending_notification = true;
                self.collector.push_update(conn.id);
            }
        }

        self.dump_packet_to_sinks(pkt);
    }

    fn on_socket_open(&mut self, fd: RawFd) {
        if !self.host.protect_socket(fd) {
            error!("socket protect failed for fd {fd}");
        }
    }

    fn on_connection_open(
        &mut self,
        admission: &mut Admission<'_>,
        pkt: &PacketView<'_>,
    ) -> Verdict {
        // A pending resolver swap is installed before the gate runs, so
        // this very connection already sees the new target.
        if let Some(server) = self.control.take_new_dns_server() {
            debug!("switching upstream DNS server to {server}");
            admission.install_dnat_target(IpAddr::V4(server), DNS_PORT);
        }

        match self.gate.evaluate(admission.tuple(), pkt.l7) {
            DnsVerdict::Block => {
                info!("blocking connection to DNS server: {}", admission.tuple());
                self.last_conn_blocked = true;
                return Verdict::Block;
            }
            DnsVerdict::Query { rewrite } => {
                self.dns_requests += 1;
                if rewrite {
                    admission.request_dnat();
                }
            }
            DnsVerdict::Pass => {}
        }

        let tuple = *admission.tuple();
        let uid = match self.host.uid_for(&tuple) {
            Some(uid) => {
                info!("{tuple} [{uid}/{}]", app_name_for_uid(&self.host, uid));
                uid
            }
            None => {
                warn!("{tuple} => UID not found");
                UID_UNKNOWN
            }
        };

        let mut record = ConnRecord::new(tuple, self.now_ms / 1000, uid);

        if let Some(host) = self.hosts.find(tuple.dst_ip) {
            debug!("host cache hit: {} -> {host}", tuple.dst_ip);
            record.info = Some(host);
        }

        // Only reportable connections take an incr_id: the host-side
        // register does not allow gaps in the sequence.
        let reportable = !self.should_ignore(&tuple);
        if reportable {
            record.incr_id = Some(self.next_incr_id);
            self.next_incr_id += 1;
            record.pending_notification = true;
        }

        let id = self.conns.insert(record);
        if reportable {
            self.collector.push_new(id);
        }
        self.dpi.open_flow(id);
        admission.set_id(id);

        Verdict::Accept
    }

    fn on_connection_close(&mut self, conn: &ConnEvent<'_>) {
        if let Some(conclusion) = self.dpi.finalize(conn.id) {
            self.apply_conclusion(conn.id, conclusion);
        }

        if self.should_ignore(conn.tuple) {
            // Never reported, so nothing waits on this record.
            self.conns.remove(conn.id);
            return;
        }

        match self.conns.get_mut(conn.id) {
            Some(record) => {
                record.status = conn.status;
                if !record.pending_notification {
                    record.pending_notification = true;
                    self.collector.push_update(conn.id);
                }
            }
            None => error!("missing record for connection {}", conn.tuple),
        }
    }
}

/// Report label: the master protocol when the engine considers it worth
/// reporting, the transport name otherwise.
fn proto_label<E: DpiEngine>(engine: &E, record: &ConnRecord) -> String {
    let master = record.l7.master;
    if master.is_known() && engine.is_master_protocol(master) {
        engine.protocol_name(master).to_string()
    } else {
        record.tuple.proto.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpi::{L7Classification, L7Protocol, SniffEngine};

    #[test]
    fn proto_label_falls_back_to_transport() {
        let engine = SniffEngine::new();
        let tuple = FiveTuple {
            proto: L4Proto::Tcp,
            src_ip: "10.215.0.2".parse().unwrap(),
            src_port: 45000,
            dst_ip: "93.184.216.34".parse().unwrap(),
            dst_port: 443,
        };
        let mut record = ConnRecord::new(tuple, 0, UID_UNKNOWN);
        assert_eq!(proto_label(&engine, &record), "TCP");

        record.l7 = L7Classification {
            app: L7Protocol::Tls,
            master: L7Protocol::Tls,
        };
        assert_eq!(proto_label(&engine, &record), "TLS");
    }
}

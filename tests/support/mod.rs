//! Shared test collaborators: a scripted NAT library and a recording
//! host bridge.

#![allow(dead_code)]

pub mod packets;

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use tuncap::{
    Admission, ConnEvent, ConnId, ConnStatus, ConnectionEvent, FiveTuple, HostBridge, L4Proto,
    NatError, NatEvents, NatStats, PacketNat, PacketView, ServiceStatus, StatsEvent, Verdict,
};

/// Everything the host bridge was told.
#[derive(Debug, Default)]
pub struct HostLog {
    pub statuses: Vec<ServiceStatus>,
    pub stats: Vec<StatsEvent>,
    pub dumps: Vec<(Vec<ConnectionEvent>, Vec<ConnectionEvent>)>,
    pub pcap: Vec<Vec<u8>>,
    pub protected_fds: Vec<RawFd>,
}

/// Host bridge recording every callback into a shared log.
pub struct TestHost {
    log: Arc<Mutex<HostLog>>,
}

impl TestHost {
    pub fn new(log: Arc<Mutex<HostLog>>) -> Self {
        Self { log }
    }
}

impl HostBridge for TestHost {
    fn uid_for(&self, _tuple: &FiveTuple) -> Option<i32> {
        Some(10123)
    }

    fn application_by_uid(&self, uid: i32) -> Option<String> {
        (uid == 10123).then(|| "org.example.app".to_string())
    }

    fn protect_socket(&self, fd: RawFd) -> bool {
        self.log.lock().unwrap().protected_fds.push(fd);
        true
    }

    fn dump_pcap_data(&mut self, data: &[u8]) {
        self.log.lock().unwrap().pcap.push(data.to_vec());
    }

    fn send_connections_dump(&mut self, new: &[ConnectionEvent], updated: &[ConnectionEvent]) {
        self.log
            .lock()
            .unwrap()
            .dumps
            .push((new.to_vec(), updated.to_vec()));
    }

    fn send_stats_dump(&mut self, stats: &StatsEvent) {
        self.log.lock().unwrap().stats.push(*stats);
    }

    fn send_service_status(&mut self, status: ServiceStatus) {
        self.log.lock().unwrap().statuses.push(status);
    }
}

/// One scripted NAT connection.
#[derive(Debug, Clone)]
pub struct TestConn {
    pub id: ConnId,
    pub tuple: FiveTuple,
    pub status: ConnStatus,
    pub dnat: bool,
    pub proxied: bool,
}

/// Scripted NAT library: admits through the event callbacks, accounts on
/// forward, and exposes its table for assertions.
#[derive(Debug, Default)]
pub struct TestNat {
    conns: HashMap<FiveTuple, TestConn>,
    dnat_target: Option<(IpAddr, u16)>,
    socks5: Option<(IpAddr, u16)>,
    forwarded: u32,
    opened_tcp: u32,
    opened_udp: u32,
    opened_icmp: u32,
}

impl TestNat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conn_by_dst(&self, dst_ip: IpAddr, dst_port: u16) -> Option<&TestConn> {
        self.conns
            .values()
            .find(|conn| conn.tuple.dst_ip == dst_ip && conn.tuple.dst_port == dst_port)
    }

    pub fn forwarded(&self) -> u32 {
        self.forwarded
    }

    pub fn dnat_target(&self) -> Option<(IpAddr, u16)> {
        self.dnat_target
    }

    /// Account a network-side packet against an existing connection, as
    /// the real library does when a socket turns readable.
    pub fn deliver_reply(&mut self, forward_tuple: &FiveTuple, pkt: &[u8], ev: &mut dyn NatEvents) {
        if let Some(conn) = self.conns.get(forward_tuple) {
            ev.account_packet(
                pkt,
                false,
                &ConnEvent {
                    tuple: forward_tuple,
                    status: conn.status,
                    id: conn.id,
                },
            );
        }
    }
}

impl PacketNat for TestNat {
    fn fds(&self, _read: &mut Vec<RawFd>, _write: &mut Vec<RawFd>) {}

    fn handle_ready(&mut self, _readable: &[RawFd], _writable: &[RawFd], _ev: &mut dyn NatEvents) {}

    fn lookup(
        &mut self,
        pkt: &PacketView<'_>,
        create: bool,
        events: &mut dyn NatEvents,
    ) -> Option<ConnId> {
        let tuple = pkt.tuple;
        if let Some(conn) = self.conns.get(&tuple) {
            return Some(conn.id);
        }
        if !create {
            return None;
        }

        let mut admission = Admission::new(&tuple);
        let verdict = events.on_connection_open(&mut admission, pkt);

        // A pending DNAT target swap applies whatever the verdict.
        if let Some((addr, port)) = admission.dnat_target_update() {
            self.dnat_target = Some((addr, port));
        }
        if verdict == Verdict::Block {
            return None;
        }

        let id = admission.id()?;
        let dnat = admission.dnat_requested();
        match tuple.proto {
            L4Proto::Tcp => self.opened_tcp += 1,
            L4Proto::Udp => self.opened_udp += 1,
            L4Proto::Icmp => self.opened_icmp += 1,
        }
        self.conns.insert(
            tuple,
            TestConn {
                id,
                tuple,
                status: ConnStatus::New,
                dnat,
                proxied: false,
            },
        );
        Some(id)
    }

    fn forward(
        &mut self,
        pkt: &PacketView<'_>,
        conn: ConnId,
        events: &mut dyn NatEvents,
    ) -> Result<(), NatError> {
        let record = self
            .conns
            .values_mut()
            .find(|c| c.id == conn)
            .ok_or_else(|| NatError::forward("unknown connection"))?;
        record.status = ConnStatus::Active;
        let event = ConnEvent {
            tuple: &record.tuple,
            status: record.status,
            id: record.id,
        };
        self.forwarded += 1;
        events.account_packet(pkt.data, true, &event);
        Ok(())
    }

    fn destroy_conn(&mut self, conn: ConnId, events: &mut dyn NatEvents) {
        if let Some(tuple) = self
            .conns
            .values()
            .find(|c| c.id == conn)
            .map(|c| c.tuple)
        {
            let removed = self.conns.remove(&tuple).expect("present");
            events.on_connection_close(&ConnEvent {
                tuple: &removed.tuple,
                status: ConnStatus::Error,
                id: removed.id,
            });
        }
    }

    fn mark_proxied(&mut self, conn: ConnId) {
        if let Some(record) = self.conns.values_mut().find(|c| c.id == conn) {
            record.proxied = true;
        }
    }

    fn set_dnat_target(&mut self, addr: IpAddr, port: u16) {
        self.dnat_target = Some((addr, port));
    }

    fn set_socks5_proxy(&mut self, addr: IpAddr, port: u16) {
        self.socks5 = Some((addr, port));
    }

    fn purge_expired(&mut self, _now_secs: u64, events: &mut dyn NatEvents) {
        for conn in std::mem::take(&mut self.conns).into_values() {
            events.on_connection_close(&ConnEvent {
                tuple: &conn.tuple,
                status: ConnStatus::Closed,
                id: conn.id,
            });
        }
    }

    fn stats(&self) -> NatStats {
        NatStats {
            open_sockets: u32::try_from(self.conns.len()).unwrap_or(u32::MAX),
            max_fd: 0,
            tcp_conns: u32::try_from(
                self.conns
                    .values()
                    .filter(|c| c.tuple.proto == L4Proto::Tcp)
                    .count(),
            )
            .unwrap_or(0),
            udp_conns: u32::try_from(
                self.conns
                    .values()
                    .filter(|c| c.tuple.proto == L4Proto::Udp)
                    .count(),
            )
            .unwrap_or(0),
            icmp_conns: 0,
            tcp_opened: self.opened_tcp,
            udp_opened: self.opened_udp,
            icmp_opened: self.opened_icmp,
        }
    }
}

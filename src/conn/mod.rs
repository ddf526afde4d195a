//! Per-connection state
//!
//! The NAT library owns connection demux; everything the capture pipeline
//! knows about a connection lives here, in a side table keyed by the
//! [`ConnId`] token handed to the NAT at admission. Records outlive the
//! NAT connection: a closed record stays in the table until its final
//! report batch has been dispatched.

pub mod collector;

use std::collections::HashMap;

use crate::dpi::L7Classification;
use crate::nat::{ConnId, ConnStatus};
use crate::packet::FiveTuple;

pub use collector::ConnCollector;

/// Sentinel when the host cannot attribute the connection to a process.
pub const UID_UNKNOWN: i32 = -1;

/// Everything tracked for one 5-tuple.
#[derive(Debug, Clone)]
pub struct ConnRecord {
    /// Canonical connection key
    pub tuple: FiveTuple,
    /// Lifecycle state, refreshed from the NAT on every packet
    pub status: ConnStatus,
    /// Wall-clock seconds of admission
    pub first_seen: u64,
    /// Wall-clock seconds of the last accounted packet
    pub last_seen: u64,
    /// Device-to-network packets
    pub sent_pkts: u64,
    /// Network-to-device packets
    pub rcvd_pkts: u64,
    /// Device-to-network bytes
    pub sent_bytes: u64,
    /// Network-to-device bytes
    pub rcvd_bytes: u64,
    /// Owning process, or [`UID_UNKNOWN`]
    pub uid: i32,
    /// Dense report identifier; assigned only to reportable connections
    pub incr_id: Option<u32>,
    /// DPI outcome once detection concluded
    pub l7: L7Classification,
    /// Hostname attached to the flow (DNS query name, HTTP Host, TLS SNI,
    /// or a host-cache hit at admission)
    pub info: Option<String>,
    /// Full HTTP URL, when extracted
    pub url: Option<String>,
    /// Set while the record sits in exactly one pending report batch
    pub pending_notification: bool,
}

impl ConnRecord {
    /// Fresh record for a connection admitted at `now` (seconds).
    #[must_use]
    pub fn new(tuple: FiveTuple, now_secs: u64, uid: i32) -> Self {
        Self {
            tuple,
            status: ConnStatus::New,
            first_seen: now_secs,
            last_seen: now_secs,
            sent_pkts: 0,
            rcvd_pkts: 0,
            sent_bytes: 0,
            rcvd_bytes: 0,
            uid,
            incr_id: None,
            l7: L7Classification::default(),
            info: None,
            url: None,
            pending_notification: false,
        }
    }

    /// Account one packet and refresh freshness and status.
    pub fn account(&mut self, size: usize, from_tun: bool, now_secs: u64, status: ConnStatus) {
        if from_tun {
            self.sent_pkts += 1;
            self.sent_bytes += size as u64;
        } else {
            self.rcvd_pkts += 1;
            self.rcvd_bytes += size as u64;
        }
        self.last_seen = now_secs;
        self.status = status;
    }

    /// Packets seen in both directions.
    #[must_use]
    pub const fn total_packets(&self) -> u64 {
        self.sent_pkts + self.rcvd_pkts
    }
}

/// Side table of connection records, keyed by the NAT token.
///
/// Tokens are never reused within a run, so a record for a closed
/// connection can coexist with a live connection on the same 5-tuple.
#[derive(Debug, Default)]
pub struct ConnTable {
    conns: HashMap<ConnId, ConnRecord>,
    next_id: ConnId,
}

impl ConnTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record and mint its token.
    pub fn insert(&mut self, record: ConnRecord) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        self.conns.insert(id, record);
        id
    }

    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<&ConnRecord> {
        self.conns.get(&id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ConnRecord> {
        self.conns.get_mut(&id)
    }

    /// Drop a record once its final batch was delivered.
    pub fn remove(&mut self, id: ConnId) -> Option<ConnRecord> {
        self.conns.remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Drop every record (run teardown).
    pub fn clear(&mut self) {
        self.conns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::L4Proto;

    fn tuple() -> FiveTuple {
        FiveTuple {
            proto: L4Proto::Tcp,
            src_ip: "10.215.0.2".parse().unwrap(),
            src_port: 45000,
            dst_ip: "93.184.216.34".parse().unwrap(),
            dst_port: 443,
        }
    }

    #[test]
    fn accounting_is_direction_separated() {
        let mut rec = ConnRecord::new(tuple(), 100, 1000);

        rec.account(60, true, 101, ConnStatus::Active);
        rec.account(1400, false, 102, ConnStatus::Active);
        rec.account(40, true, 103, ConnStatus::Active);

        assert_eq!(rec.sent_pkts, 2);
        assert_eq!(rec.sent_bytes, 100);
        assert_eq!(rec.rcvd_pkts, 1);
        assert_eq!(rec.rcvd_bytes, 1400);
        assert_eq!(rec.total_packets(), 3);
        assert_eq!(rec.first_seen, 100);
        assert_eq!(rec.last_seen, 103);
        assert_eq!(rec.status, ConnStatus::Active);
    }

    #[test]
    fn table_tokens_are_never_reused() {
        let mut table = ConnTable::new();
        let a = table.insert(ConnRecord::new(tuple(), 0, UID_UNKNOWN));
        table.remove(a);
        let b = table.insert(ConnRecord::new(tuple(), 0, UID_UNKNOWN));
        assert_ne!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn closed_record_survives_until_removed() {
        let mut table = ConnTable::new();
        let id = table.insert(ConnRecord::new(tuple(), 0, UID_UNKNOWN));
        table.get_mut(id).unwrap().status = ConnStatus::Closed;
        assert!(table.get(id).unwrap().status.is_closed());
        assert!(table.remove(id).is_some());
        assert!(table.is_empty());
    }
}

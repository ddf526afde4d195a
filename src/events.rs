//! Host-bound event payloads
//!
//! Plain-data snapshots handed to the host callbacks: per-connection
//! descriptors for the batched dumps, the aggregate statistics record,
//! and the service status marker. Everything here serializes, so hosts
//! can forward events verbatim.

use std::net::IpAddr;

use serde::Serialize;

use crate::conn::ConnRecord;
use crate::nat::ConnStatus;
use crate::packet::L4Proto;

/// Service lifecycle marker sent to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Started,
    Stopped,
}

impl ServiceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// One connection, as reported in a dump batch.
///
/// Ports are host byte order; `info`, `url` and `proto_name` are empty
/// strings when nothing was extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub info: String,
    pub url: String,
    pub proto_name: String,
    pub status: ConnStatus,
    pub ip_version: u8,
    pub l4_proto: L4Proto,
    pub src_port: u16,
    pub dst_port: u16,
    pub first_seen: u64,
    pub last_seen: u64,
    pub sent_bytes: u64,
    pub rcvd_bytes: u64,
    pub sent_pkts: u64,
    pub rcvd_pkts: u64,
    pub uid: i32,
    pub incr_id: u32,
}

impl ConnectionEvent {
    /// Snapshot a record for delivery. Only reportable records (which
    /// always carry an `incr_id`) reach this path.
    #[must_use]
    pub fn from_record(record: &ConnRecord, proto_name: &str) -> Self {
        Self {
            src_ip: record.tuple.src_ip,
            dst_ip: record.tuple.dst_ip,
            info: record.info.clone().unwrap_or_default(),
            url: record.url.clone().unwrap_or_default(),
            proto_name: proto_name.to_string(),
            status: record.status,
            ip_version: record.tuple.ip_version(),
            l4_proto: record.tuple.proto,
            src_port: record.tuple.src_port,
            dst_port: record.tuple.dst_port,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            sent_bytes: record.sent_bytes,
            rcvd_bytes: record.rcvd_bytes,
            sent_pkts: record.sent_pkts,
            rcvd_pkts: record.rcvd_pkts,
            uid: record.uid,
            incr_id: record.incr_id.unwrap_or_default(),
        }
    }
}

/// Aggregate capture statistics, one per stats emission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsEvent {
    /// Device-to-network bytes across reportable connections
    pub sent_bytes: u64,
    /// Network-to-device bytes across reportable connections
    pub rcvd_bytes: u64,
    pub sent_pkts: u64,
    pub rcvd_pkts: u64,
    /// Connections lost to lookup or forward failures
    pub dropped_connections: u32,
    /// NAT gauge: sockets open towards the network
    pub open_sockets: u32,
    /// NAT gauge: highest fd handed to the multiplexer
    pub max_fd: i32,
    /// NAT gauge: live connections, all transports
    pub active_connections: u32,
    /// NAT gauge: connections opened this run, all transports
    pub total_connections: u32,
    /// Plaintext DNS queries observed by the policy gate
    pub dns_requests: u32,
}

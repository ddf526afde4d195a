//! Host platform bridge
//!
//! The capture core runs embedded in a host VPN service. The host
//! supplies socket protection, traffic attribution, and receives every
//! outbound event through [`HostBridge`]. All callbacks are invoked
//! synchronously on the loop thread.

use std::os::unix::io::RawFd;

use crate::events::{ConnectionEvent, ServiceStatus, StatsEvent};
use crate::packet::FiveTuple;

/// Root user id, labeled without asking the host.
pub const UID_ROOT: i32 = 0;

/// The platform DNS daemon, labeled without asking the host.
pub const UID_NETD: i32 = 1051;

/// Callbacks into the embedding host service.
pub trait HostBridge {
    /// Resolve the process owner of a connection, or `None` when the
    /// platform cannot attribute it.
    fn uid_for(&self, tuple: &FiveTuple) -> Option<i32>;

    /// Human-readable application name for a uid.
    fn application_by_uid(&self, uid: i32) -> Option<String>;

    /// Exempt a socket from VPN routing. Returns `false` on failure.
    fn protect_socket(&self, fd: RawFd) -> bool;

    /// Deliver one flushed pcap buffer.
    fn dump_pcap_data(&mut self, data: &[u8]);

    /// Deliver one connections dump cycle.
    fn send_connections_dump(&mut self, new: &[ConnectionEvent], updated: &[ConnectionEvent]);

    /// Deliver aggregate statistics.
    fn send_stats_dump(&mut self, stats: &StatsEvent);

    /// Announce service lifecycle transitions.
    fn send_service_status(&mut self, status: ServiceStatus);
}

/// Application label for a uid, short-circuiting the well-known system
/// uids so the host is only consulted for real apps.
pub fn app_name_for_uid<H: HostBridge>(host: &H, uid: i32) -> String {
    match uid {
        UID_ROOT => "ROOT".to_string(),
        UID_NETD => "netd".to_string(),
        _ => host
            .application_by_uid(uid)
            .unwrap_or_else(|| "???".to_string()),
    }
}

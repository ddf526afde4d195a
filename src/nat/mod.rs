//! Userspace NAT library seam
//!
//! The capture core does not implement connection proxying itself: an
//! external userspace NAT library owns the socket table, the SOCKS5
//! transport, and DNAT rewriting. This module pins down the two sides of
//! that contract:
//!
//! - [`PacketNat`] is what the core requires of the NAT library.
//! - [`NatEvents`] is the callback surface the core implements and hands
//!   to the NAT on every call that can re-enter it (the same shape as
//!   passing a device/handler into a poll call).
//!
//! Connections are identified across the boundary by a [`ConnId`] token
//! the core assigns at admission and the NAT stores per connection. The
//! core keeps all per-connection state in its own side table; the NAT
//! only echoes the token back in events.

use std::net::IpAddr;
use std::os::unix::io::RawFd;

use serde::Serialize;

use crate::packet::{FiveTuple, PacketView};

/// Core-assigned connection token, stored opaquely by the NAT library.
pub type ConnId = u64;

/// Lifecycle state of a NAT connection.
///
/// Ordering matters: a record is freeable once its status reaches
/// [`ConnStatus::Closed`] or beyond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnStatus {
    /// Admitted, no traffic proxied yet
    New,
    /// Traffic flowing
    Active,
    /// Terminated normally
    Closed,
    /// Terminated by a proxying error
    Error,
}

impl ConnStatus {
    /// True once the connection has reached a terminal state
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Aggregate gauges the NAT library reports on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatStats {
    /// Sockets currently open towards the network
    pub open_sockets: u32,
    /// Highest file descriptor ever handed to `select`
    pub max_fd: i32,
    /// Live connections per transport
    pub tcp_conns: u32,
    pub udp_conns: u32,
    pub icmp_conns: u32,
    /// Connections opened since the run started, per transport
    pub tcp_opened: u32,
    pub udp_opened: u32,
    pub icmp_opened: u32,
}

impl NatStats {
    /// Currently live connections, all transports
    #[must_use]
    pub const fn active_connections(&self) -> u32 {
        self.tcp_conns + self.udp_conns + self.icmp_conns
    }

    /// Total connections opened this run, all transports
    #[must_use]
    pub const fn opened_connections(&self) -> u32 {
        self.tcp_opened + self.udp_opened + self.icmp_opened
    }
}

/// Read-only view of a NAT connection delivered with each event.
#[derive(Debug, Clone, Copy)]
pub struct ConnEvent<'a> {
    /// Canonical connection key
    pub tuple: &'a FiveTuple,
    /// Status as the NAT currently sees it
    pub status: ConnStatus,
    /// Core-assigned token
    pub id: ConnId,
}

/// Verdict of the connection-open callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Admit the connection into the NAT table
    Accept,
    /// Refuse it; the NAT must not create any state for the tuple
    Block,
}

/// Mutable admission context for a connection about to be created.
///
/// Built by the NAT library before invoking
/// [`NatEvents::on_connection_open`]. After the callback returns, the NAT
/// applies the requests recorded here: a replacement global DNAT target
/// (installed whatever the verdict, so a pending resolver swap is never
/// lost) and, on [`Verdict::Accept`] only, the per-connection DNAT flag.
#[derive(Debug)]
pub struct Admission<'a> {
    tuple: &'a FiveTuple,
    id: Option<ConnId>,
    dnat: bool,
    dnat_target: Option<(IpAddr, u16)>,
}

impl<'a> Admission<'a> {
    /// Start an admission for `tuple` (NAT side).
    #[must_use]
    pub fn new(tuple: &'a FiveTuple) -> Self {
        Self {
            tuple,
            id: None,
            dnat: false,
            dnat_target: None,
        }
    }

    /// The connection key under admission
    #[must_use]
    pub fn tuple(&self) -> &FiveTuple {
        self.tuple
    }

    /// Attach the core's token for this connection (core side).
    pub fn set_id(&mut self, id: ConnId) {
        self.id = Some(id);
    }

    /// Token attached by the core, if any
    #[must_use]
    pub fn id(&self) -> Option<ConnId> {
        self.id
    }

    /// Ask the NAT to rewrite this connection's destination to the
    /// current DNAT target (core side).
    pub fn request_dnat(&mut self) {
        self.dnat = true;
    }

    /// Whether per-connection DNAT was requested
    #[must_use]
    pub fn dnat_requested(&self) -> bool {
        self.dnat
    }

    /// Replace the NAT's global DNAT target before this connection is
    /// admitted (core side).
    pub fn install_dnat_target(&mut self, addr: IpAddr, port: u16) {
        self.dnat_target = Some((addr, port));
    }

    /// Pending global DNAT target replacement, if any
    #[must_use]
    pub fn dnat_target_update(&self) -> Option<(IpAddr, u16)> {
        self.dnat_target
    }
}

/// Callbacks the NAT library drives into the capture core.
///
/// All callbacks run on the loop thread, synchronously within the NAT
/// call that triggered them.
pub trait NatEvents {
    /// Deliver a proxied packet back to the tun device.
    ///
    /// # Errors
    ///
    /// An error tells the NAT to abandon the connection; the core decides
    /// separately whether the failure also terminates the loop.
    fn send_client(&mut self, pkt: &[u8], conn: &ConnEvent<'_>) -> std::io::Result<()>;

    /// Account one packet (either direction) against its connection.
    fn account_packet(&mut self, pkt: &[u8], from_tun: bool, conn: &ConnEvent<'_>);

    /// A socket towards the network was just opened.
    fn on_socket_open(&mut self, fd: RawFd);

    /// A new connection is being created for `pkt`.
    ///
    /// Returning [`Verdict::Block`] rejects the tuple before any NAT
    /// state exists.
    fn on_connection_open(&mut self, admission: &mut Admission<'_>, pkt: &PacketView<'_>)
        -> Verdict;

    /// The NAT is done with a connection. The core may finalize but must
    /// keep its record until the final report batch is dispatched.
    fn on_connection_close(&mut self, conn: &ConnEvent<'_>);
}

/// What the capture core requires of the userspace NAT library.
///
/// Every method that can proxy data or mutate the connection table takes
/// the event handler, since all of them may re-enter the core.
pub trait PacketNat {
    /// Collect the file descriptors to multiplex on, split by interest.
    fn fds(&self, read: &mut Vec<RawFd>, write: &mut Vec<RawFd>);

    /// Dispatch sockets that `select` reported ready.
    fn handle_ready(
        &mut self,
        readable: &[RawFd],
        writable: &[RawFd],
        events: &mut dyn NatEvents,
    );

    /// Find the connection for a packet, creating it when `create` is set
    /// and the open callback accepts it. Returns the core token, or
    /// `None` when the connection does not exist, was blocked, or could
    /// not be allocated.
    fn lookup(
        &mut self,
        pkt: &PacketView<'_>,
        create: bool,
        events: &mut dyn NatEvents,
    ) -> Option<ConnId>;

    /// Proxy one tun-side packet towards the network.
    ///
    /// # Errors
    ///
    /// A failed forward leaves the connection unusable; the core destroys
    /// it and counts a drop.
    fn forward(
        &mut self,
        pkt: &PacketView<'_>,
        conn: ConnId,
        events: &mut dyn NatEvents,
    ) -> Result<(), crate::error::NatError>;

    /// Tear down a single connection, emitting its close event.
    fn destroy_conn(&mut self, conn: ConnId, events: &mut dyn NatEvents);

    /// Route this TCP connection through the configured SOCKS5 proxy.
    fn mark_proxied(&mut self, conn: ConnId);

    /// Set the global DNAT target applied to connections flagged at
    /// admission.
    fn set_dnat_target(&mut self, addr: IpAddr, port: u16);

    /// Configure the SOCKS5 proxy endpoint.
    fn set_socks5_proxy(&mut self, addr: IpAddr, port: u16);

    /// Expire idle connections, emitting close events for each.
    fn purge_expired(&mut self, now_secs: u64, events: &mut dyn NatEvents);

    /// Current aggregate gauges.
    fn stats(&self) -> NatStats;
}

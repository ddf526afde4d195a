//! Capture runtime
//!
//! One [`run`](run::run) call drives a complete capture session: the
//! select loop over the tun device and the NAT library's sockets, the
//! per-connection pipeline, and the reporting cadence. All state lives in
//! a per-run [`CaptureCore`]; the host keeps only a [`CaptureControl`]
//! handle whose word-sized atomic flags are the sole cross-thread
//! surface. The handle is reset on every run entry, so nothing leaks
//! between runs even when the host reuses it.

pub mod core;
pub mod run;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub use self::core::CaptureCore;
pub use self::run::run;

/// Select wake interval; also bounds stop latency.
pub const SELECT_TIMEOUT_MS: u64 = 500;

/// Minimum spacing of aggregate stats emissions.
pub const CAPTURE_STATS_UPDATE_MS: u64 = 300;

/// Spacing of connection dump cycles.
pub const CONNECTION_DUMP_UPDATE_MS: u64 = 1000;

/// Maximum sit time of the host pcap buffer before a flush.
pub const MAX_HOST_PCAP_DELAY_MS: u64 = 1000;

/// Spacing of idle-connection purges.
pub const PERIODIC_PURGE_TIMEOUT_MS: u64 = 5000;

/// Tun read buffer; one packet per read.
pub const TUN_READ_BUFFER_SIZE: usize = 32767;

/// Control handle shared between the host and the loop thread.
///
/// Every field is a single word written by the host and read (and
/// cleared) by the loop at defined points; a write becomes visible within
/// one select tick.
#[derive(Debug)]
pub struct CaptureControl {
    running: AtomicBool,
    /// Forces the purge housekeeping branch
    dump_vpn_stats_now: AtomicBool,
    /// Forces the aggregate stats emission branch
    dump_capture_stats_now: AtomicBool,
    /// Replacement upstream resolver, `0` when none is pending
    new_dns_server: AtomicU32,
}

impl CaptureControl {
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            dump_vpn_stats_now: AtomicBool::new(false),
            dump_capture_stats_now: AtomicBool::new(false),
            new_dns_server: AtomicU32::new(0),
        }
    }

    /// Arm the handle for a fresh run, clearing anything a previous run
    /// left behind.
    pub fn reset(&self) {
        self.running.store(true, Ordering::Relaxed);
        self.dump_vpn_stats_now.store(false, Ordering::Relaxed);
        self.dump_capture_stats_now.store(false, Ordering::Relaxed);
        self.new_dns_server.store(0, Ordering::Relaxed);
    }

    /// Ask the loop to exit; takes effect at the next select wake.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Ask for an immediate stats emission and purge cycle.
    pub fn request_stats_dump(&self) {
        if self.is_running() {
            self.dump_vpn_stats_now.store(true, Ordering::Relaxed);
            self.dump_capture_stats_now.store(true, Ordering::Relaxed);
        }
    }

    /// Install `server` as the upstream resolver at the next new
    /// connection.
    pub fn set_dns_server(&self, server: Ipv4Addr) {
        self.new_dns_server.store(u32::from(server), Ordering::Relaxed);
    }

    /// Consume a pending resolver replacement.
    pub(crate) fn take_new_dns_server(&self) -> Option<Ipv4Addr> {
        let bits = self.new_dns_server.swap(0, Ordering::Relaxed);
        (bits != 0).then(|| Ipv4Addr::from(bits))
    }

    pub(crate) fn stats_dump_forced(&self) -> bool {
        self.dump_capture_stats_now.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_stats_dump(&self) {
        self.dump_capture_stats_now.store(false, Ordering::Relaxed);
    }

    pub(crate) fn purge_forced(&self) -> bool {
        self.dump_vpn_stats_now.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_purge(&self) {
        self.dump_vpn_stats_now.store(false, Ordering::Relaxed);
    }
}

impl Default for CaptureControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_arms_and_clears_previous_state() {
        let control = CaptureControl::new();
        assert!(!control.is_running());

        control.reset();
        control.request_stats_dump();
        control.set_dns_server("9.9.9.9".parse().unwrap());
        control.stop();

        // A new run must not observe anything from the last one.
        control.reset();
        assert!(control.is_running());
        assert!(!control.stats_dump_forced());
        assert!(!control.purge_forced());
        assert_eq!(control.take_new_dns_server(), None);
    }

    #[test]
    fn dns_server_is_consumed_once() {
        let control = CaptureControl::new();
        control.reset();
        control.set_dns_server("8.8.4.4".parse().unwrap());
        assert_eq!(
            control.take_new_dns_server(),
            Some("8.8.4.4".parse().unwrap())
        );
        assert_eq!(control.take_new_dns_server(), None);
    }

    #[test]
    fn stats_dump_is_ignored_while_stopped() {
        let control = CaptureControl::new();
        control.request_stats_dump();
        assert!(!control.stats_dump_forced());

        control.reset();
        control.request_stats_dump();
        assert!(control.stats_dump_forced());
        assert!(control.purge_forced());
    }
}

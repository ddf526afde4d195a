//! The packet loop
//!
//! Single-threaded and cooperative: one `select(2)` over the tun device
//! and the NAT library's sockets, a 500 ms wake for timing, then either
//! one packet read or one socket dispatch, followed by at most one
//! housekeeping task. The only suspension point is `select`; everything
//! else runs synchronously within the iteration.

use std::io;
use std::mem;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;

use tracing::{error, info};

use super::core::CaptureCore;
use super::{CaptureControl, SELECT_TIMEOUT_MS, TUN_READ_BUFFER_SIZE};
use crate::config::CaptureConfig;
use crate::dns::DNS_PORT;
use crate::dpi::DpiEngine;
use crate::error::CaptureError;
use crate::host::HostBridge;
use crate::nat::PacketNat;

/// File descriptors `select` reported ready.
struct Ready {
    tun_readable: bool,
    readable: Vec<RawFd>,
    writable: Vec<RawFd>,
}

/// Run one capture session until [`CaptureControl::stop`] or a fatal
/// error.
///
/// The tun descriptor is switched to blocking mode (with readiness
/// guaranteed by `select`, a single `read` then delivers one packet).
/// All resources are torn down and `stopped` announced on every exit
/// path past startup.
///
/// # Errors
///
/// Returns the fatal condition that ended the run: invalid
/// configuration, tun setup failure, an unreachable TCP pcap collector,
/// or a `select` failure.
pub fn run<N, E, H>(
    config: CaptureConfig,
    tun_fd: RawFd,
    nat: &mut N,
    engine: E,
    host: H,
    control: Arc<CaptureControl>,
) -> Result<(), CaptureError>
where
    N: PacketNat,
    E: DpiEngine,
    H: HostBridge,
{
    config.validate()?;

    // Fresh flags every entry: the host may reuse both the handle and
    // the service across runs.
    control.reset();

    set_blocking(tun_fd)
        .map_err(|e| CaptureError::tun(format!("failed to set tun fd blocking: {e}")))?;

    let mut core = CaptureCore::new(config.clone(), engine, host, Arc::clone(&control), tun_fd);
    core.announce_started();

    let result = setup_and_loop(&config, tun_fd, nat, &mut core);
    core.teardown();

    info!("packet loop stopped");
    result
}

fn setup_and_loop<N, E, H>(
    config: &CaptureConfig,
    tun_fd: RawFd,
    nat: &mut N,
    core: &mut CaptureCore<E, H>,
) -> Result<(), CaptureError>
where
    N: PacketNat,
    E: DpiEngine,
    H: HostBridge,
{
    if let Err(e) = core.open_pcap_sinks() {
        error!("pcap sink setup failed: {e}");
        return Err(e);
    }

    nat.set_dnat_target(IpAddr::V4(config.dns_server), DNS_PORT);
    if let Some(socks5) = &config.socks5 {
        nat.set_socks5_proxy(IpAddr::V4(socks5.address), socks5.port);
    }

    info!("starting packet loop [tunfd={tun_fd}]");

    let mut buf = vec![0u8; TUN_READ_BUFFER_SIZE];
    let mut nat_read: Vec<RawFd> = Vec::new();
    let mut nat_write: Vec<RawFd> = Vec::new();

    while core.control().is_running() {
        nat_read.clear();
        nat_write.clear();
        nat.fds(&mut nat_read, &mut nat_write);

        let ready = match wait_ready(tun_fd, &nat_read, &nat_write) {
            Ok(ready) => ready,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("select failed: {e}");
                return Err(CaptureError::Io(e));
            }
        };

        if !core.control().is_running() {
            break;
        }
        core.refresh_clock();

        if ready.tun_readable {
            let n = unsafe { libc::read(tun_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                core.handle_tun_packet(nat, &buf[..n as usize]);
            } else if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    error!("tun read failed: {err}");
                }
            }
        } else {
            nat.handle_ready(&ready.readable, &ready.writable, core);
        }

        core.housekeeping(nat);
    }

    Ok(())
}

/// Block in `select` for up to [`SELECT_TIMEOUT_MS`].
fn wait_ready(tun_fd: RawFd, nat_read: &[RawFd], nat_write: &[RawFd]) -> io::Result<Ready> {
    let mut rset: libc::fd_set = unsafe { mem::zeroed() };
    let mut wset: libc::fd_set = unsafe { mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut rset);
        libc::FD_ZERO(&mut wset);
        libc::FD_SET(tun_fd, &mut rset);
    }

    let mut max_fd = tun_fd;
    for &fd in nat_read {
        unsafe { libc::FD_SET(fd, &mut rset) };
        max_fd = max_fd.max(fd);
    }
    for &fd in nat_write {
        unsafe { libc::FD_SET(fd, &mut wset) };
        max_fd = max_fd.max(fd);
    }

    let mut timeout = libc::timeval {
        tv_sec: 0,
        tv_usec: (SELECT_TIMEOUT_MS * 1000) as libc::suseconds_t,
    };

    let rv = unsafe {
        libc::select(
            max_fd + 1,
            &mut rset,
            &mut wset,
            ptr::null_mut(),
            &mut timeout,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(Ready {
        tun_readable: unsafe { libc::FD_ISSET(tun_fd, &rset) },
        readable: nat_read
            .iter()
            .copied()
            .filter(|&fd| unsafe { libc::FD_ISSET(fd, &rset) })
            .collect(),
        writable: nat_write
            .iter()
            .copied()
            .filter(|&fd| unsafe { libc::FD_ISSET(fd, &wset) })
            .collect(),
    })
}

/// Clear `O_NONBLOCK` on the tun descriptor.
fn set_blocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_blocking_on_a_pipe() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        // Make it non-blocking first, then verify the flag comes off.
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        unsafe { libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) };

        set_blocking(fds[0]).unwrap();
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn select_reports_readable_pipe() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let payload = [0x45u8];
        unsafe { libc::write(fds[1], payload.as_ptr().cast(), 1) };

        let ready = wait_ready(fds[0], &[], &[]).unwrap();
        assert!(ready.tun_readable);
        assert!(ready.readable.is_empty());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn select_times_out_on_silent_pipe() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ready = wait_ready(fds[0], &[], &[]).unwrap();
        assert!(!ready.tun_readable);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}

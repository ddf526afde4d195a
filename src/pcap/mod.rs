//! libpcap framing and export sinks
//!
//! Packets are framed in the classic little-endian libpcap layout
//! (magic `0xa1b2c3d4`, version 2.4, link-type RAW IP) and exported
//! through two independently enabled sinks:
//!
//! - [`HostPcapBuffer`]: accumulates records in a fixed 512 KiB buffer
//!   delivered to the host as one opaque byte array, flushed when the
//!   next record would not fit or on the periodic timer.
//! - [`PcapCollector`]: streams records to a remote collector over UDP
//!   (one `sendto` per record) or TCP (connected once at startup).
//!
//! On every sink the global file header is emitted exactly once per
//! session and always precedes the first record.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::error::PcapError;

/// Classic libpcap magic, microsecond timestamps
pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
/// File format version 2.4
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
/// `LINKTYPE_RAW`: packets start at the IP header
pub const LINKTYPE_RAW_IP: u32 = 101;

/// Global file header size
pub const FILE_HEADER_LEN: usize = 24;
/// Per-record header size
pub const RECORD_HEADER_LEN: usize = 16;

/// Capacity of the host-delivery buffer
pub const HOST_BUFFER_CAPACITY: usize = 512 * 1024;

/// Transport used towards the remote collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcapTransport {
    #[default]
    Udp,
    Tcp,
}

/// Global libpcap file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapFileHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    /// GMT offset; always zero
    pub thiszone: i32,
    /// Timestamp accuracy; always zero
    pub sigfigs: u32,
    /// Capture length ceiling (the tun MTU)
    pub snaplen: u32,
    pub linktype: u32,
}

impl PcapFileHeader {
    #[must_use]
    pub fn new(snaplen: u32) -> Self {
        Self {
            magic: PCAP_MAGIC,
            version_major: PCAP_VERSION_MAJOR,
            version_minor: PCAP_VERSION_MINOR,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            linktype: LINKTYPE_RAW_IP,
        }
    }

    /// Append the 24-byte little-endian layout.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.magic);
        buf.put_u16_le(self.version_major);
        buf.put_u16_le(self.version_minor);
        buf.put_i32_le(self.thiszone);
        buf.put_u32_le(self.sigfigs);
        buf.put_u32_le(self.snaplen);
        buf.put_u32_le(self.linktype);
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FILE_HEADER_LEN);
        self.encode_into(&mut buf);
        buf
    }

    /// Read a header back from the start of a capture.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FILE_HEADER_LEN {
            return None;
        }
        let mut buf = data;
        Some(Self {
            magic: buf.get_u32_le(),
            version_major: buf.get_u16_le(),
            version_minor: buf.get_u16_le(),
            thiszone: buf.get_i32_le(),
            sigfigs: buf.get_u32_le(),
            snaplen: buf.get_u32_le(),
            linktype: buf.get_u32_le(),
        })
    }
}

/// Per-record libpcap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcapRecordHeader {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub incl_len: u32,
    pub orig_len: u32,
}

impl PcapRecordHeader {
    /// Header for a fully captured packet at the given epoch
    /// microseconds.
    #[must_use]
    pub fn for_packet(ts_usec_epoch: u64, payload_len: usize) -> Self {
        let len = u32::try_from(payload_len).unwrap_or(u32::MAX);
        Self {
            ts_sec: (ts_usec_epoch / 1_000_000) as u32,
            ts_usec: (ts_usec_epoch % 1_000_000) as u32,
            incl_len: len,
            orig_len: len,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.ts_sec);
        buf.put_u32_le(self.ts_usec);
        buf.put_u32_le(self.incl_len);
        buf.put_u32_le(self.orig_len);
    }

    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RECORD_HEADER_LEN {
            return None;
        }
        let mut buf = data;
        Some(Self {
            ts_sec: buf.get_u32_le(),
            ts_usec: buf.get_u32_le(),
            incl_len: buf.get_u32_le(),
            orig_len: buf.get_u32_le(),
        })
    }
}

/// Size one framed record occupies.
#[must_use]
pub const fn record_len(payload_len: usize) -> usize {
    RECORD_HEADER_LEN + payload_len
}

/// Append one framed record.
pub fn encode_record(buf: &mut Vec<u8>, ts_usec_epoch: u64, payload: &[u8]) {
    PcapRecordHeader::for_packet(ts_usec_epoch, payload.len()).encode_into(buf);
    buf.extend_from_slice(payload);
}

/// Fixed-capacity record buffer delivered to the host in bulk.
#[derive(Debug)]
pub struct HostPcapBuffer {
    buf: Vec<u8>,
    snaplen: u32,
    header_emitted: bool,
    /// Loop time of the last delivery, for the periodic flush
    pub last_flush_ms: u64,
}

impl HostPcapBuffer {
    #[must_use]
    pub fn new(snaplen: u32) -> Self {
        Self {
            buf: Vec::with_capacity(HOST_BUFFER_CAPACITY),
            snaplen,
            header_emitted: false,
            last_flush_ms: 0,
        }
    }

    /// Whether a record for `payload_len` bytes still fits.
    #[must_use]
    pub fn fits(&self, payload_len: usize) -> bool {
        let mut needed = record_len(payload_len);
        if !self.header_emitted {
            needed += FILE_HEADER_LEN;
        }
        HOST_BUFFER_CAPACITY - self.buf.len() > needed
    }

    /// Append one record; the global header is written once, before the
    /// first record of the session. Returns `false` when the record does
    /// not fit (the caller must flush first).
    pub fn append(&mut self, ts_usec_epoch: u64, payload: &[u8]) -> bool {
        if !self.fits(payload.len()) {
            return false;
        }
        if !self.header_emitted {
            PcapFileHeader::new(self.snaplen).encode_into(&mut self.buf);
            self.header_emitted = true;
        }
        encode_record(&mut self.buf, ts_usec_epoch, payload);
        true
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Hand the accumulated bytes over and reset the write index. The
    /// header stays emitted: it belongs to the sink session, not to a
    /// single flush.
    pub fn take(&mut self, now_ms: u64) -> Vec<u8> {
        self.last_flush_ms = now_ms;
        std::mem::take(&mut self.buf)
    }
}

/// Remote pcap collector sink.
#[derive(Debug)]
pub struct PcapCollector {
    socket: Socket,
    dest: SockAddr,
    transport: PcapTransport,
    snaplen: u32,
    header_sent: bool,
}

impl PcapCollector {
    /// Open the collector socket.
    ///
    /// The socket is handed to `protect` before any traffic is sent, so
    /// the host can exempt it from VPN routing. With TCP, the connection
    /// is established here and the file header sent immediately; with
    /// UDP, the header goes out with the first record.
    ///
    /// # Errors
    ///
    /// Socket creation failure is fatal; so is a refused TCP connection
    /// when the TCP transport was configured.
    pub fn connect<F>(
        addr: SocketAddr,
        transport: PcapTransport,
        snaplen: u32,
        protect: F,
    ) -> Result<Self, PcapError>
    where
        F: FnOnce(RawFd) -> bool,
    {
        let sock_type = match transport {
            PcapTransport::Udp => Type::DGRAM,
            PcapTransport::Tcp => Type::STREAM,
        };
        let socket = Socket::new(Domain::for_address(addr), sock_type, None)
            .map_err(PcapError::Socket)?;

        if !protect(socket.as_raw_fd()) {
            warn!("socket protect failed for pcap collector");
        }

        let dest = SockAddr::from(addr);
        let mut collector = Self {
            socket,
            dest,
            transport,
            snaplen,
            header_sent: false,
        };

        if transport == PcapTransport::Tcp {
            collector
                .socket
                .connect(&collector.dest)
                .map_err(|source| PcapError::Connect { addr, source })?;
            let header = PcapFileHeader::new(snaplen).encode();
            collector.send_bytes(&header).map_err(PcapError::Io)?;
            collector.header_sent = true;
        }

        debug!("pcap collector ready: {addr} ({transport:?})");
        Ok(collector)
    }

    /// Frame and send one record.
    ///
    /// # Errors
    ///
    /// Send failures are reported to the caller, which logs and keeps
    /// going; a dead collector must not take the capture down.
    pub fn dump_record(&mut self, ts_usec_epoch: u64, payload: &[u8]) -> Result<(), PcapError> {
        if !self.header_sent {
            let header = PcapFileHeader::new(self.snaplen).encode();
            self.send_bytes(&header).map_err(PcapError::Io)?;
            self.header_sent = true;
        }

        let mut record = Vec::with_capacity(record_len(payload.len()));
        encode_record(&mut record, ts_usec_epoch, payload);
        self.send_bytes(&record).map_err(PcapError::Io)?;
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match self.transport {
            PcapTransport::Udp => self.socket.send_to(data, &self.dest),
            // MSG_NOSIGNAL: a collector that hangs up must surface as an
            // error, not as SIGPIPE.
            PcapTransport::Tcp => self.socket.send_with_flags(data, libc::MSG_NOSIGNAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, UdpSocket};

    #[test]
    fn file_header_round_trips_byte_identical() {
        let header = PcapFileHeader::new(32767);
        let encoded = header.encode();
        assert_eq!(encoded.len(), FILE_HEADER_LEN);
        assert_eq!(&encoded[..4], &[0xd4, 0xc3, 0xb2, 0xa1]);

        let parsed = PcapFileHeader::parse(&encoded).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.encode(), encoded);
    }

    #[test]
    fn record_header_round_trips() {
        let header = PcapRecordHeader::for_packet(1_700_000_123_456_789, 1500);
        assert_eq!(header.ts_sec, 1_700_000_123);
        assert_eq!(header.ts_usec, 456_789);
        assert_eq!(header.incl_len, 1500);

        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        let parsed = PcapRecordHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn host_buffer_emits_header_once_per_session() {
        let mut buf = HostPcapBuffer::new(32767);
        assert!(buf.append(1_000_000, &[1, 2, 3]));
        assert_eq!(buf.len(), FILE_HEADER_LEN + RECORD_HEADER_LEN + 3);

        let first = buf.take(1);
        assert_eq!(PcapFileHeader::parse(&first).unwrap().magic, PCAP_MAGIC);

        // Second flush of the same session carries records only.
        assert!(buf.append(2_000_000, &[4, 5]));
        assert_eq!(buf.len(), RECORD_HEADER_LEN + 2);
        let second = buf.take(2);
        let rec = PcapRecordHeader::parse(&second).unwrap();
        assert_eq!(rec.incl_len, 2);
        assert_eq!(rec.ts_sec, 2);
    }

    #[test]
    fn host_buffer_never_exceeds_capacity() {
        let mut buf = HostPcapBuffer::new(32767);
        let payload = vec![0u8; 1400];
        let mut appended = 0usize;
        while buf.append(0, &payload) {
            appended += 1;
            assert!(buf.len() <= HOST_BUFFER_CAPACITY);
        }
        assert!(!buf.fits(payload.len()));
        assert!(appended > 300, "buffer should hold hundreds of MTU records");
    }

    #[test]
    fn udp_collector_sends_header_then_record() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut protected = None;
        let mut collector =
            PcapCollector::connect(addr, PcapTransport::Udp, 32767, |fd| {
                protected = Some(fd);
                true
            })
            .unwrap();
        assert!(protected.is_some());

        collector.dump_record(5_000_001, &[0x45, 0x00]).unwrap();

        let mut datagram = [0u8; 2048];
        let n = receiver.recv(&mut datagram).unwrap();
        assert_eq!(n, FILE_HEADER_LEN);
        assert_eq!(
            PcapFileHeader::parse(&datagram[..n]).unwrap().linktype,
            LINKTYPE_RAW_IP
        );

        let n = receiver.recv(&mut datagram).unwrap();
        assert_eq!(n, RECORD_HEADER_LEN + 2);
        let rec = PcapRecordHeader::parse(&datagram[..n]).unwrap();
        assert_eq!(rec.ts_sec, 5);
        assert_eq!(rec.ts_usec, 1);
        assert_eq!(&datagram[RECORD_HEADER_LEN..n], &[0x45, 0x00]);
    }

    #[test]
    fn tcp_collector_sends_header_at_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut collector =
            PcapCollector::connect(addr, PcapTransport::Tcp, 1500, |_| true).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let mut header = [0u8; FILE_HEADER_LEN];
        stream.read_exact(&mut header).unwrap();
        assert_eq!(PcapFileHeader::parse(&header).unwrap().snaplen, 1500);

        collector.dump_record(0, &[9]).unwrap();
        let mut record = [0u8; RECORD_HEADER_LEN + 1];
        stream.read_exact(&mut record).unwrap();
        assert_eq!(record[RECORD_HEADER_LEN], 9);
    }

    #[test]
    fn tcp_connect_refused_is_fatal() {
        // Bind then drop to get a (very likely) unused port.
        let port = {
            let sock = TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let result = PcapCollector::connect(addr, PcapTransport::Tcp, 1500, |_| true);
        assert!(matches!(result, Err(PcapError::Connect { .. })));
    }
}

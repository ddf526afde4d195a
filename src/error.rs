//! Error types for the capture core
//!
//! Errors are categorized by subsystem and aggregated into
//! [`CaptureError`]. Only fatal conditions surface as `Err` from the run
//! loop; per-connection and per-packet failures are logged and absorbed
//! where they happen.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error for a capture run.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Configuration rejected at startup
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// NAT library failure
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    /// DPI engine failure
    #[error("DPI error: {0}")]
    Dpi(#[from] DpiError),

    /// pcap sink failure
    #[error("pcap error: {0}")]
    Pcap(#[from] PcapError),

    /// tun device setup or write failure that terminates the run
    #[error("tun device error: {0}")]
    Tun(String),

    /// I/O failure not covered by a subsystem
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Create a tun device error.
    pub fn tun(msg: impl Into<String>) -> Self {
        Self::Tun(msg.into())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cross-field validation failed
    #[error("validation failed: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// NAT library errors.
#[derive(Debug, Error)]
pub enum NatError {
    /// The library could not be initialized; the run cannot start
    #[error("initialization failed: {0}")]
    Init(String),

    /// A single connection could not be forwarded
    #[error("forward failed: {0}")]
    Forward(String),

    /// Socket-level failure inside the library
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NatError {
    /// Create a forward error.
    pub fn forward(msg: impl Into<String>) -> Self {
        Self::Forward(msg.into())
    }
}

/// DPI engine errors.
#[derive(Debug, Error)]
pub enum DpiError {
    /// The engine could not be initialized; the run cannot start
    #[error("initialization failed: {0}")]
    Init(String),

    /// Per-flow state could not be allocated; the connection proceeds
    /// without DPI
    #[error("flow allocation failed: {0}")]
    FlowAllocation(String),
}

/// pcap sink errors.
#[derive(Debug, Error)]
pub enum PcapError {
    /// Collector socket could not be created
    #[error("collector socket creation failed: {0}")]
    Socket(#[source] io::Error),

    /// TCP collector refused the connection
    #[error("collector connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A record could not be sent
    #[error("collector send failed: {0}")]
    Io(#[source] io::Error),
}

impl PcapError {
    /// Whether this failure must terminate the run. Send failures are
    /// tolerated; a collector that cannot be reached at startup is not.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Socket(_) | Self::Connect { .. } => true,
            Self::Io(_) => false,
        }
    }
}

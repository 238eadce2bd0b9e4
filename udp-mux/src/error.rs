//! Error types shared across the crate.
//!
//! Only startup failures surface as errors.  Once the reactor is running,
//! per-connection faults are logged and folded into the half-close state
//! instead of propagating.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::packet::PacketError;

/// Failure to bring up the reactor's sockets.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot bind UDP socket on {addr}: {source}")]
    UdpBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot listen for TCP connections on {addr}: {source}")]
    TcpListen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from [`crate::socket::Socket::recv_from`].
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("datagram decode error: {0}")]
    Packet(#[from] PacketError),
}

/// Invalid configuration, reported before any socket is opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("coder window must hold at least one segment")]
    ZeroWindow,

    #[error("max segment size must be between 1 and {max} bytes, got {got}")]
    SegmentSize { got: usize, max: usize },

    #[error("min RTO {min:?} exceeds max RTO {max:?}")]
    RtoBounds { min: Duration, max: Duration },

    #[error("remote proxy address {0} is unspecified")]
    UnspecifiedRemote(SocketAddr),

    #[error("fallback destination {0} is not IPv4")]
    NonIpv4Destination(SocketAddr),
}

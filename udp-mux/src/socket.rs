//! UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`Datagram`] instead of raw bytes.  All protocol logic lives elsewhere;
//! this module owns only byte I/O.
//!
//! The reactor uses the non-blocking `try_*` methods after waiting on
//! [`Socket::readable`].  The async methods are for simple peers and tests.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::error::{SocketError, TransportError};
use crate::packet::{Datagram, PacketError, HEADER_LEN, MAX_PAYLOAD};

/// Largest datagram the codec can produce.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_PAYLOAD;

/// A datagram-oriented UDP socket.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after the OS assigns an
    /// ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let inner = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::UdpBind { addr, source })?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Wait until a datagram can be read.
    pub async fn readable(&self) -> io::Result<()> {
        self.inner.readable().await
    }

    /// Encode `datagram` and send it to `dest` without waiting.
    ///
    /// A full send buffer surfaces as [`io::ErrorKind::WouldBlock`]; the
    /// caller treats that like a lost datagram.
    pub fn try_send_to(&self, datagram: &Datagram, dest: SocketAddr) -> io::Result<()> {
        let bytes = datagram
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.inner.try_send_to(&bytes, dest)?;
        Ok(())
    }

    /// Read one datagram without waiting.
    ///
    /// The outer `Err` is an I/O error (including `WouldBlock` when nothing
    /// is queued).  The inner result is the decode outcome, so malformed
    /// datagrams can be dropped while the sender address is still logged.
    pub fn try_recv_from(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(Result<Datagram, PacketError>, SocketAddr)> {
        let (n, from) = self.inner.try_recv_from(buf)?;
        Ok((Datagram::decode(&buf[..n]), from))
    }

    /// Encode `datagram` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, datagram: &Datagram, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = datagram.encode()?;
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it.
    ///
    /// Datagrams that fail to decode are returned as `Err`; the caller
    /// decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Datagram, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let datagram = Datagram::decode(&buf[..n])?;
        Ok((datagram, addr))
    }
}

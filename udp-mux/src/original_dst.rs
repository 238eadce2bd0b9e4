//! Recovering where an accepted connection was originally headed.
//!
//! The client is meant to sit behind an iptables `REDIRECT` rule, so the
//! application believes it is talking to the real server.  The kernel keeps
//! the pre-NAT destination, which `SO_ORIGINAL_DST` exposes.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use tokio::net::TcpStream;

/// Linux netfilter constant: `SO_ORIGINAL_DST` (`SOL_IP` level).
#[cfg(target_os = "linux")]
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Ask the kernel for the pre-NAT destination of `stream`.
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddrV4> {
    use std::mem;
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    // SAFETY: `addr` and `len` outlive the call and `len` matches the buffer.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    Ok(SocketAddrV4::new(ip, port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> io::Result<SocketAddrV4> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only available on Linux",
    ))
}

/// Pick the destination to tunnel `stream` to.
///
/// A lookup that merely reports the listener's own address means the
/// connection was not redirected; `fallback` is used then, and whenever the
/// lookup fails.  Returns `None` when no IPv4 destination is known.
pub fn resolve_destination(
    stream: &TcpStream,
    fallback: Option<SocketAddr>,
) -> Option<SocketAddrV4> {
    let local = stream.local_addr().ok();
    match original_destination(stream) {
        Ok(dest) if local != Some(SocketAddr::V4(dest)) => return Some(dest),
        Ok(_) => log::debug!("[client] connection was not redirected"),
        Err(e) => log::debug!("[client] SO_ORIGINAL_DST unavailable: {e}"),
    }
    match fallback {
        Some(SocketAddr::V4(dest)) => Some(dest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn unredirected_connection_uses_fallback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let _client = TcpStream::connect(addr).await.expect("connect");
        let (accepted, _) = listener.accept().await.expect("accept");

        let fallback: SocketAddr = "10.1.2.3:80".parse().expect("addr");
        assert_eq!(
            resolve_destination(&accepted, Some(fallback)),
            Some("10.1.2.3:80".parse().expect("addr"))
        );
    }

    #[tokio::test]
    async fn no_fallback_and_no_redirect_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let _client = TcpStream::connect(addr).await.expect("connect");
        let (accepted, _) = listener.accept().await.expect("accept");

        assert_eq!(resolve_destination(&accepted, None), None);
        let v6: SocketAddr = "[::1]:80".parse().expect("addr");
        assert_eq!(resolve_destination(&accepted, Some(v6)), None);
    }
}

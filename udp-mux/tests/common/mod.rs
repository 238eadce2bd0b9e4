//! Shared helpers for the integration tests.
//!
//! Reactors are driven by hand with [`Reactor::turn`], interleaved with a
//! fake peer: a plain loopback [`Socket`] speaking the wire codec.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use udp_mux::packet::{Datagram, MessageType};
use udp_mux::socket::Socket;
use udp_mux::{Config, Reactor};

pub const INTERVAL: Duration = Duration::from_millis(100);
pub const LIMIT: Duration = Duration::from_secs(5);

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("loopback address")
}

/// Short timers so tests observe retries quickly.
pub fn fast(mut config: Config) -> Config {
    config.timers.retransmit_interval = INTERVAL;
    config.timers.wait_ceiling = Duration::from_millis(500);
    config.timers.connect_timeout = Duration::from_secs(2);
    config
}

/// Client reactor tunnelling to `remote`, with `destination` as the fallback
/// for unredirected connections.
pub async fn start_client(remote: SocketAddr, destination: SocketAddr) -> Reactor {
    let config = fast(Config::client(remote, loopback()))
        .with_udp_bind(loopback())
        .with_destination(destination);
    config.validate().expect("valid client config");
    Reactor::bind(&config).await.expect("bind client reactor")
}

pub async fn start_proxy() -> Reactor {
    let config = fast(Config::proxy(loopback()));
    Reactor::bind(&config).await.expect("bind proxy reactor")
}

pub async fn fake_peer() -> Socket {
    Socket::bind(loopback()).await.expect("bind fake peer")
}

/// Turn `reactor` until `done` holds.
pub async fn drive_until(reactor: &mut Reactor, mut done: impl FnMut(&Reactor) -> bool) {
    timeout(LIMIT, async {
        while !done(reactor) {
            reactor.turn().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Turn `reactor` for `period`, regardless of what happens.
pub async fn drive_for(reactor: &mut Reactor, period: Duration) {
    let _ = timeout(period, reactor.run()).await;
}

/// Turn `reactor` while listening on `peer`; return the first datagram that
/// satisfies `want`.
pub async fn drive_until_recv(
    reactor: &mut Reactor,
    peer: &Socket,
    mut want: impl FnMut(&Datagram) -> bool,
) -> Datagram {
    timeout(LIMIT, async {
        loop {
            tokio::select! {
                received = peer.recv_from() => {
                    if let Ok((datagram, _)) = received {
                        if want(&datagram) {
                            return datagram;
                        }
                    }
                }
                () = reactor.turn() => {}
            }
        }
    })
    .await
    .expect("datagram not received in time")
}

/// Everything `peer` receives until it has been quiet for `quiet`.
pub async fn collect(peer: &Socket, quiet: Duration) -> Vec<Datagram> {
    let mut out = Vec::new();
    while let Ok(Ok((datagram, _))) = timeout(quiet, peer.recv_from()).await {
        out.push(datagram);
    }
    out
}

pub fn kinds(datagrams: &[Datagram]) -> Vec<MessageType> {
    datagrams.iter().map(|d| d.kind).collect()
}

/// A Go-Back-N DATA payload: big-endian sequence number then bytes.
pub fn data_frame(seq: u32, bytes: &[u8]) -> Vec<u8> {
    let mut out = seq.to_be_bytes().to_vec();
    out.extend_from_slice(bytes);
    out
}

/// Spawn a TCP echo server that serves connections until the test ends.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind(loopback()).await.expect("bind echo server");
    let addr = listener.local_addr().expect("echo server address");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind(loopback()).await.expect("bind");
    listener.local_addr().expect("address")
}

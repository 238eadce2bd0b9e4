//! Proxy reactor against a fake client.
//!
//! The proxy learns about a connection from its first DATA or EMPTY and
//! dials the destination carried in the identity.

mod common;

use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

use udp_mux::packet::{Datagram, Identity, MessageType};
use udp_mux::state::{HalfState, Lifecycle};

use common::*;

fn identity_for(dest: SocketAddr, random_id: u16) -> Identity {
    match dest {
        SocketAddr::V4(v4) => Identity::new(40_000, v4, random_id),
        SocketAddr::V6(_) => panic!("tests use IPv4 loopback"),
    }
}

/// First DATA starts a connect; once connected the payload is delivered,
/// acknowledged, and the destination's reply comes back as DATA.
#[tokio::test]
async fn first_packet_bootstrap_success() {
    let echo = spawn_echo_server().await;
    let mut proxy = start_proxy().await;
    let client = fake_peer().await;
    let identity = identity_for(echo, 1);

    let data = Datagram::new(identity, MessageType::Data, data_frame(0, b"hello"));
    client
        .send_to(&data, proxy.local_addr())
        .await
        .expect("send DATA");

    drive_until(&mut proxy, |p| {
        p.registry()
            .find(&identity)
            .is_some_and(|m| m.lifecycle() == Lifecycle::OpenedDuplex)
    })
    .await;

    let mut acked = false;
    let echoed = drive_until_recv(&mut proxy, &client, |d| {
        if d.kind == MessageType::Ack && d.payload == 5u32.to_be_bytes() {
            acked = true;
        }
        d.kind == MessageType::Data
    })
    .await;
    assert_eq!(echoed.identity, identity);
    assert_eq!(echoed.payload, data_frame(0, b"hello"));

    if !acked {
        let ack = drive_until_recv(&mut proxy, &client, |d| d.kind == MessageType::Ack).await;
        assert_eq!(ack.payload, 5u32.to_be_bytes());
    }
}

/// DATA that arrives while the connect is still running is kept and
/// delivered in order afterwards.
#[tokio::test]
async fn data_during_connect_is_kept() {
    let echo = spawn_echo_server().await;
    let mut proxy = start_proxy().await;
    let client = fake_peer().await;
    let identity = identity_for(echo, 2);

    for (seq, chunk) in [(0u32, &b"ab"[..]), (2, &b"cd"[..])] {
        let data = Datagram::new(identity, MessageType::Data, data_frame(seq, chunk));
        client
            .send_to(&data, proxy.local_addr())
            .await
            .expect("send DATA");
    }

    let mut echoed = Vec::new();
    drive_until_recv(&mut proxy, &client, |d| {
        if d.kind == MessageType::Data {
            echoed.extend_from_slice(&d.payload[4..]);
        }
        echoed.len() >= 4
    })
    .await;
    assert_eq!(echoed, b"abcd");
}

/// A client that writes and closes at once sends DATA and WRITE_CLOSED
/// back to back.  The proxy answers while still connecting and delivers the
/// data once connected.
#[tokio::test]
async fn write_closed_during_connect_is_acknowledged() {
    let listener = TcpListener::bind(loopback()).await.expect("bind destination");
    let dest = listener.local_addr().expect("destination address");
    let mut proxy = start_proxy().await;
    let client = fake_peer().await;
    let identity = identity_for(dest, 6);

    for datagram in [
        Datagram::new(identity, MessageType::Data, data_frame(0, b"hi")),
        Datagram::control(identity, MessageType::WriteClosed),
    ] {
        client
            .send_to(&datagram, proxy.local_addr())
            .await
            .expect("send");
    }

    let reply = drive_until_recv(&mut proxy, &client, |d| {
        matches!(d.kind, MessageType::WriteClosedAck | MessageType::Close)
    })
    .await;
    assert_eq!(reply.kind, MessageType::WriteClosedAck);

    drive_until(&mut proxy, |p| {
        p.registry()
            .find(&identity)
            .is_some_and(|m| m.lifecycle() == Lifecycle::OpenedDuplex)
    })
    .await;
    let mux = proxy.registry().find(&identity).expect("mux kept");
    assert_eq!(mux.flags().remote_write, HalfState::ClosedAcked);

    let (mut server, _) = listener.accept().await.expect("accept");
    let received = timeout(LIMIT, async {
        tokio::select! {
            () = proxy.run() => unreachable!("proxy reactor stopped"),
            received = async {
                let mut buf = [0u8; 2];
                server.read_exact(&mut buf).await.expect("destination read");
                buf
            } => received,
        }
    })
    .await
    .expect("early data not delivered");
    assert_eq!(&received, b"hi");
}

/// NO_OUTSTANDING_DATA during the connect is acknowledged, and once
/// connected the destination sees end-of-stream.
#[tokio::test]
async fn end_of_data_during_connect_reaches_destination() {
    let listener = TcpListener::bind(loopback()).await.expect("bind destination");
    let dest = listener.local_addr().expect("destination address");
    let mut proxy = start_proxy().await;
    let client = fake_peer().await;
    let identity = identity_for(dest, 7);

    for kind in [MessageType::Empty, MessageType::NoOutstandingData] {
        client
            .send_to(&Datagram::control(identity, kind), proxy.local_addr())
            .await
            .expect("send");
    }

    let reply = drive_until_recv(&mut proxy, &client, |d| {
        matches!(d.kind, MessageType::NoOutstandingDataAck | MessageType::Close)
    })
    .await;
    assert_eq!(reply.kind, MessageType::NoOutstandingDataAck);

    let (mut server, _) = listener.accept().await.expect("accept");
    let n = timeout(LIMIT, async {
        tokio::select! {
            () = proxy.run() => unreachable!("proxy reactor stopped"),
            n = async {
                let mut buf = [0u8; 1];
                server.read(&mut buf).await.expect("destination read")
            } => n,
        }
    })
    .await
    .expect("end-of-stream not passed on");
    assert_eq!(n, 0);
    assert!(proxy.registry().find(&identity).is_some());
}

/// A destination that refuses the connection gets the client a CLOSE, and
/// the proxy forgets the connection.
#[tokio::test]
async fn first_packet_bootstrap_failure() {
    let refused = closed_port().await;
    let mut proxy = start_proxy().await;
    let client = fake_peer().await;
    let identity = identity_for(refused, 3);

    let data = Datagram::new(identity, MessageType::Data, data_frame(0, b"hello"));
    client
        .send_to(&data, proxy.local_addr())
        .await
        .expect("send DATA");

    let close = drive_until_recv(&mut proxy, &client, |d| d.kind == MessageType::Close).await;
    assert_eq!(close.identity, identity);
    assert!(proxy.registry().is_empty());
}

/// Anything but DATA or EMPTY for an unknown connection is a protocol
/// violation.
#[tokio::test]
async fn ack_before_open_is_refused() {
    let mut proxy = start_proxy().await;
    let client = fake_peer().await;
    let identity = identity_for("127.0.0.1:9".parse().expect("addr"), 4);

    let ack = Datagram::new(identity, MessageType::Ack, 0u32.to_be_bytes().to_vec());
    client
        .send_to(&ack, proxy.local_addr())
        .await
        .expect("send ACK");

    let close = drive_until_recv(&mut proxy, &client, |d| d.kind == MessageType::Close).await;
    assert_eq!(close.identity, identity);
    assert!(proxy.registry().is_empty());
}

/// CLOSE for a connection the proxy does not know is ignored silently.
#[tokio::test]
async fn stray_close_is_ignored() {
    let mut proxy = start_proxy().await;
    let client = fake_peer().await;
    let identity = identity_for("127.0.0.1:9".parse().expect("addr"), 5);

    client
        .send_to(&Datagram::control(identity, MessageType::Close), proxy.local_addr())
        .await
        .expect("send CLOSE");

    drive_for(&mut proxy, INTERVAL * 2).await;
    assert!(proxy.registry().is_empty());
    assert!(collect(&client, INTERVAL).await.is_empty());
}

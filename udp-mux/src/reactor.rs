//! The single-threaded event reactor.
//!
//! One [`Reactor`] owns the UDP socket, the client's TCP listener (if any)
//! and the [`Registry`].  Each [`Reactor::turn`] does:
//!
//! ```text
//!  1. wait   ── until the earliest of: UDP readable, listener readable,
//!              a watched local socket ready, a connect finished, or the
//!              nearest deadline (capped by the wait ceiling)
//!  2. timers ── fire every encoder timeout that has passed
//!  3. ingest ── drain the UDP socket, accept / finish connects, read
//!              every watched local socket
//!  4. egress ── walk the registry in order: flush decoded bytes to the
//!              local socket, send ACK / keep-alive / DATA / handshake
//!              retries, apply the closing rule
//! ```
//!
//! Nothing in the turn blocks.  Local sockets are read with `try_read`, so
//! a socket whose readiness turned out to be spurious costs nothing.  The
//! proxy's outbound connects run as separate tasks and report back through
//! a channel, keyed by [`MuxHandle`].

use std::future::{poll_fn, Future};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::task::Poll;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};

use crate::coder::GbnCoder;
use crate::config::{Config, Endpoint, Role};
use crate::error::TransportError;
use crate::mux::{Inbound, MuxHandle};
use crate::original_dst;
use crate::packet::{Datagram, Identity, MessageType};
use crate::registry::Registry;
use crate::socket::{Socket, MAX_DATAGRAM};
use crate::state::Lifecycle;
use crate::timer::TimerConfig;

/// Upper bound on datagrams processed per turn, so a flood cannot starve
/// local sockets and timers.
const MAX_DATAGRAMS_PER_TURN: usize = 256;

/// Bytes read from one local socket per turn.
const LOCAL_READ_CHUNK: usize = 16 * 1024;

/// Attempts at drawing a random identity component that is not in use.
const IDENTITY_ATTEMPTS: usize = 16;

/// Role-specific state.
#[derive(Debug)]
enum Mode {
    Client {
        listener: TcpListener,
        remote: SocketAddr,
        destination: Option<SocketAddr>,
    },
    Proxy,
}

/// Result of a proxy-side outbound connect.
#[derive(Debug)]
struct ConnectOutcome {
    handle: MuxHandle,
    destination: SocketAddrV4,
    result: io::Result<TcpStream>,
}

/// Why [`Reactor::wait`] returned.
enum Wake {
    Udp,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Local,
    Connected(ConnectOutcome),
    Deadline,
    Failed(io::Error),
}

pub struct Reactor {
    mode: Mode,
    socket: Socket,
    registry: Registry,
    timers: TimerConfig,
    /// DATA datagrams the proxy keeps per connection while connecting.
    early_data_limit: usize,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    recv_buf: Vec<u8>,
    outbox: Vec<Datagram>,
}

impl Reactor {
    /// Open the sockets described by `config`.
    pub async fn bind(config: &Config) -> Result<Self, TransportError> {
        let (mode, udp_bind) = match &config.endpoint {
            Endpoint::Client {
                remote,
                listen,
                udp_bind,
                destination,
            } => {
                let listener = TcpListener::bind(*listen)
                    .await
                    .map_err(|source| TransportError::TcpListen {
                        addr: *listen,
                        source,
                    })?;
                let mode = Mode::Client {
                    listener,
                    remote: *remote,
                    destination: *destination,
                };
                (mode, *udp_bind)
            }
            Endpoint::Proxy { udp_bind } => (Mode::Proxy, *udp_bind),
        };
        let socket = Socket::bind(udp_bind).await?;

        let coder = GbnCoder::new(config.coder.clone());
        let registry = Registry::new(Box::new(coder), config.timers.retransmit_interval);
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        let reactor = Self {
            mode,
            socket,
            registry,
            timers: config.timers.clone(),
            early_data_limit: config.coder.window,
            connect_tx,
            connect_rx,
            recv_buf: vec![0u8; MAX_DATAGRAM],
            outbox: Vec::new(),
        };
        match reactor.listener_addr() {
            Some(tcp) => log::info!(
                "[reactor] {} up: udp {} tcp {tcp}",
                reactor.role(),
                reactor.local_addr()
            ),
            None => log::info!("[reactor] {} up: udp {}", reactor.role(), reactor.local_addr()),
        }
        Ok(reactor)
    }

    pub fn role(&self) -> Role {
        match self.mode {
            Mode::Client { .. } => Role::Client,
            Mode::Proxy => Role::Proxy,
        }
    }

    /// Bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Bound TCP listener address (client only).
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            Mode::Client { listener, .. } => listener.local_addr().ok(),
            Mode::Proxy => None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run turns forever.
    pub async fn run(&mut self) {
        loop {
            self.turn().await;
        }
    }

    /// Wait for one event and process everything that is ready.
    pub async fn turn(&mut self) {
        let deadline = self.next_deadline();
        let wake = self.wait(deadline).await;
        let now = Instant::now();

        self.fire_timeouts(now);
        self.drain_udp(now);
        match wake {
            Wake::Accepted(Ok((stream, peer))) => self.on_accept(stream, peer),
            Wake::Accepted(Err(e)) => log::warn!("[reactor] accept failed: {e}"),
            Wake::Connected(outcome) => self.on_connected(outcome),
            Wake::Failed(e) => log::error!("[reactor] wait failed: {e}"),
            Wake::Udp | Wake::Local | Wake::Deadline => {}
        }
        self.read_locals(now);
        self.egress(now);
    }

    /// Earliest mux deadline, never further away than the wait ceiling.
    fn next_deadline(&self) -> Instant {
        let ceiling = Instant::now() + self.timers.wait_ceiling;
        match self.registry.next_deadline() {
            Some(at) => at.min(ceiling),
            None => ceiling,
        }
    }

    async fn wait(&mut self, deadline: Instant) -> Wake {
        let listener = match &self.mode {
            Mode::Client { listener, .. } => Some(listener),
            Mode::Proxy => None,
        };
        let registry = &self.registry;

        tokio::select! {
            biased;

            Some(outcome) = self.connect_rx.recv() => Wake::Connected(outcome),
            ready = self.socket.readable() => match ready {
                Ok(()) => Wake::Udp,
                Err(e) => Wake::Failed(e),
            },
            accepted = accept(listener) => Wake::Accepted(accepted),
            () = local_ready(registry) => Wake::Local,
            () = sleep_until(deadline) => Wake::Deadline,
        }
    }

    fn fire_timeouts(&mut self, now: Instant) {
        for mux in self.registry.iter_mut() {
            if mux.fire_timeout(now) {
                log::debug!("[reactor] {} data timeout", mux.identity());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    fn drain_udp(&mut self, now: Instant) {
        for _ in 0..MAX_DATAGRAMS_PER_TURN {
            match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok((Ok(datagram), from)) => self.on_datagram(datagram, from, now),
                Ok((Err(e), from)) => log::debug!("[reactor] ← malformed datagram from {from}: {e}"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("[reactor] UDP receive failed: {e}");
                    return;
                }
            }
        }
    }

    fn on_datagram(&mut self, datagram: Datagram, from: SocketAddr, now: Instant) {
        let Datagram {
            identity,
            kind,
            payload,
        } = datagram;
        log::debug!("[reactor] ← {kind} {identity} ({} bytes) from {from}", payload.len());

        if kind == MessageType::Close && !self.registry.contains(&identity) {
            return;
        }

        let role = self.role();
        let udp_remote = match &self.mode {
            Mode::Client { remote, .. } => *remote,
            Mode::Proxy => from,
        };
        let (index, created) = self.registry.find_or_create(identity, None, udp_remote);
        let Some(mux) = self.registry.get_mut(index) else {
            return;
        };
        if role == Role::Proxy {
            mux.set_udp_remote(from);
        }

        // The proxy learns about a connection from its first DATA or EMPTY.
        // Until the connect finishes the mux itself keeps what arrives.
        if role == Role::Proxy
            && mux.lifecycle() == Lifecycle::Init
            && !mux.is_connecting()
            && matches!(kind, MessageType::Data | MessageType::Empty)
        {
            mux.begin_connect(self.early_data_limit);
            if created {
                log::info!("[reactor] {identity} new connection from {from}");
            }
            let handle = mux.handle();
            self.spawn_connect(handle, identity.destination());
        }
        let Some(mux) = self.registry.get_mut(index) else {
            return;
        };

        match mux.handle_datagram(kind, &payload, now) {
            Inbound::Handled => {}
            Inbound::Reply(reply) => {
                let remote = mux.udp_remote();
                self.send(&Datagram::control(identity, reply), remote);
            }
            Inbound::Remove => {
                log::info!("[reactor] {identity} closed by peer");
                self.registry.remove(index);
            }
            Inbound::Violation => {
                log::warn!("[reactor] {identity} unexpected {kind} in {}; closing", mux.lifecycle());
                let remote = mux.udp_remote();
                self.send(&Datagram::control(identity, MessageType::Close), remote);
                self.registry.remove(index);
            }
        }
    }

    fn spawn_connect(&self, handle: MuxHandle, destination: SocketAddrV4) {
        let tx = self.connect_tx.clone();
        let limit = self.timers.connect_timeout;
        log::debug!("[reactor] {handle} connecting to {destination}");
        tokio::spawn(async move {
            let result = match timeout(limit, TcpStream::connect(destination)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            // The receiver only goes away with the reactor itself.
            let _ = tx.send(ConnectOutcome {
                handle,
                destination,
                result,
            });
        });
    }

    fn on_connected(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome {
            handle,
            destination,
            result,
        } = outcome;
        let Some(index) = self.registry.position_of(handle) else {
            log::debug!("[reactor] {handle} gone before connect to {destination} finished");
            return;
        };
        let Some(mux) = self.registry.get_mut(index) else {
            return;
        };

        match result {
            Ok(stream) => {
                log::info!("[reactor] {} connected to {destination}", mux.identity());
                mux.complete_connect(stream);
            }
            Err(e) => {
                log::warn!("[reactor] {} connect to {destination} failed: {e}", mux.identity());
                let identity = mux.identity();
                let remote = mux.udp_remote();
                self.send(&Datagram::control(identity, MessageType::Close), remote);
                self.registry.remove(index);
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Mode::Client {
            remote,
            destination,
            ..
        } = &self.mode
        else {
            return;
        };
        let remote = *remote;

        let Some(dest) = original_dst::resolve_destination(&stream, *destination) else {
            log::warn!("[reactor] no IPv4 destination for connection from {peer}; dropping it");
            return;
        };

        let mut rng = rand::rng();
        let identity = (0..IDENTITY_ATTEMPTS)
            .map(|_| Identity::new(peer.port(), dest, rng.random()))
            .find(|id| !self.registry.contains(id));
        let Some(identity) = identity else {
            log::warn!("[reactor] no free identity for {peer} → {dest}; dropping it");
            return;
        };

        let (index, _) = self.registry.find_or_create(identity, Some(stream), remote);
        if let Some(mux) = self.registry.get_mut(index) {
            mux.open_simplex();
        }
        log::info!("[reactor] {identity} accepted {peer} → {dest}");
    }

    fn read_locals(&mut self, now: Instant) {
        let mut buf = vec![0u8; LOCAL_READ_CHUNK];
        for mux in self.registry.iter_mut() {
            if mux.wants_read() {
                mux.read_local(&mut buf, now);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Egress
    // -----------------------------------------------------------------------

    fn egress(&mut self, now: Instant) {
        let mut index = 0;
        while let Some(mux) = self.registry.get_mut(index) {
            mux.flush_local();
            let reach = mux.egress(now, &mut self.outbox);
            let remote = mux.udp_remote();
            let identity = mux.identity();

            for datagram in self.outbox.drain(..) {
                transmit(&self.socket, &datagram, remote);
            }

            if reach.is_reachable() {
                index += 1;
            } else {
                log::info!("[reactor] {identity} closed");
                self.registry.remove(index);
            }
        }
    }

    fn send(&self, datagram: &Datagram, dest: SocketAddr) {
        transmit(&self.socket, datagram, dest);
    }
}

fn transmit(socket: &Socket, datagram: &Datagram, dest: SocketAddr) {
    log::debug!(
        "[reactor] → {} {} ({} bytes) to {dest}",
        datagram.kind,
        datagram.identity,
        datagram.payload.len()
    );
    // Either way the datagram counts as lost; retransmission covers it.
    match socket.try_send_to(datagram, dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            log::debug!("[reactor] send buffer full; dropped {} to {dest}", datagram.kind);
        }
        Err(e) => log::warn!("[reactor] send {} to {dest} failed: {e}", datagram.kind),
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Resolves once any watched local socket is ready.
fn local_ready(registry: &Registry) -> impl Future<Output = ()> + '_ {
    poll_fn(move |cx| {
        for mux in registry.iter() {
            let Some(stream) = mux.local() else {
                continue;
            };
            if mux.wants_read() && stream.poll_read_ready(cx).is_ready() {
                return Poll::Ready(());
            }
            if mux.wants_write() && stream.poll_write_ready(cx).is_ready() {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    })
}

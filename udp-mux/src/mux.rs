//! One multiplexed TCP connection.
//!
//! A [`Mux`] pairs a local TCP socket with a stream of datagrams to the
//! peer, all sharing one [`Identity`].  It owns the encoder/decoder pair,
//! the lifecycle, the four half-close flags and the retry timers for the
//! control handshakes.
//!
//! ```text
//!             read                 submit_clear_bytes          DATA
//!  local TCP ──────▶ Mux ─────────────────────────▶ Encoder ──────────▶ peer
//!            ◀────── Mux ◀──── take_clear_bytes ─── Decoder ◀────────── peer
//!             write                                            DATA
//! ```
//!
//! The mux never touches the UDP socket.  Inbound datagrams are handed to
//! [`Mux::handle_datagram`], and [`Mux::egress`] appends whatever should go
//! out to a caller-owned buffer, which the reactor then sends.  Local TCP
//! I/O is non-blocking (`try_read` / `try_write`) and happens only after the
//! reactor has seen readiness.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::coder::{Decoder, Encoder};
use crate::packet::{Datagram, Identity, MessageType};
use crate::state::{HalfCloseFlags, HalfState, Lifecycle, Reachability};
use crate::timer::RetryTimer;

/// Stable name for a mux that survives registry reshuffles.
///
/// Registry positions shift when an earlier entry is removed; handles do
/// not.  Asynchronous work (the proxy's outbound connect) refers to its mux
/// by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MuxHandle(pub u64);

impl fmt::Display for MuxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the caller must do after [`Mux::handle_datagram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Nothing further.
    Handled,
    /// Send this control message back to the peer.
    Reply(MessageType),
    /// The peer closed the connection: remove the mux, send nothing.
    Remove,
    /// The message makes no sense in the current state: send CLOSE and
    /// remove the mux.
    Violation,
}

pub struct Mux {
    handle: MuxHandle,
    identity: Identity,
    udp_remote: SocketAddr,
    local: Option<TcpStream>,

    lifecycle: Lifecycle,
    /// Whether the local socket may still be read.
    local_read: HalfState,
    flags: HalfCloseFlags,

    encoder: Box<dyn Encoder>,
    decoder: Box<dyn Decoder>,

    write_closed_retry: RetryTimer,
    outstanding_retry: RetryTimer,
    keepalive: RetryTimer,

    /// Decoded bytes the local socket has not accepted yet.
    undelivered: Vec<u8>,
    /// The write half of the local socket has been shut down.
    local_shut: bool,

    /// Proxy side: outbound connect in progress.
    connecting: bool,
    /// Proxy side: DATA payloads that arrived before the connect finished.
    early_data: Vec<Vec<u8>>,
    early_data_limit: usize,
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("handle", &self.handle)
            .field("identity", &self.identity)
            .field("udp_remote", &self.udp_remote)
            .field("lifecycle", &self.lifecycle)
            .field("local_read", &self.local_read)
            .field("flags", &self.flags)
            .field("connecting", &self.connecting)
            .finish_non_exhaustive()
    }
}

impl Mux {
    pub fn new(
        handle: MuxHandle,
        identity: Identity,
        udp_remote: SocketAddr,
        encoder: Box<dyn Encoder>,
        decoder: Box<dyn Decoder>,
        retransmit_interval: Duration,
    ) -> Self {
        Self {
            handle,
            identity,
            udp_remote,
            local: None,
            lifecycle: Lifecycle::Init,
            local_read: HalfState::Opened,
            flags: HalfCloseFlags::default(),
            encoder,
            decoder,
            write_closed_retry: RetryTimer::new(retransmit_interval),
            outstanding_retry: RetryTimer::new(retransmit_interval),
            keepalive: RetryTimer::new(retransmit_interval),
            undelivered: Vec::new(),
            local_shut: false,
            connecting: false,
            early_data: Vec::new(),
            early_data_limit: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn handle(&self) -> MuxHandle {
        self.handle
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn udp_remote(&self) -> SocketAddr {
        self.udp_remote
    }

    pub fn set_udp_remote(&mut self, addr: SocketAddr) {
        self.udp_remote = addr;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn local_read(&self) -> HalfState {
        self.local_read
    }

    pub fn flags(&self) -> HalfCloseFlags {
        self.flags
    }

    /// Direct access to the half-close flags, for callers driving the
    /// handshake by hand.
    pub fn flags_mut(&mut self) -> &mut HalfCloseFlags {
        &mut self.flags
    }

    pub fn local(&self) -> Option<&TcpStream> {
        self.local.as_ref()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// `true` when the reactor should watch the local socket for reads.
    pub fn wants_read(&self) -> bool {
        self.local.is_some()
            && self.lifecycle.is_opened()
            && self.local_read.is_opened()
            && self.encoder.may_submit_more()
    }

    /// `true` when decoded bytes are waiting for the local socket to drain.
    pub fn wants_write(&self) -> bool {
        self.local.is_some() && self.flags.local_write.is_opened() && !self.undelivered.is_empty()
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    pub fn attach_local(&mut self, stream: TcpStream) {
        self.local = Some(stream);
    }

    /// Client side: the local application connected.
    pub fn open_simplex(&mut self) {
        if self.lifecycle == Lifecycle::Init {
            self.lifecycle = Lifecycle::OpenedSimplex;
        }
    }

    /// Proxy side: an outbound connect has been started for this mux.
    ///
    /// Until it finishes, at most `early_data_limit` DATA payloads are kept;
    /// the peer retransmits anything dropped beyond that.
    pub fn begin_connect(&mut self, early_data_limit: usize) {
        self.connecting = true;
        self.early_data_limit = early_data_limit;
    }

    fn stash_early_data(&mut self, payload: &[u8]) {
        if self.early_data.len() >= self.early_data_limit {
            log::debug!(
                "[mux] {} {} DATA already held while connecting; dropping",
                self.identity,
                self.early_data.len()
            );
            return;
        }
        self.early_data.push(payload.to_vec());
    }

    /// Proxy side: the destination accepted the connection.
    ///
    /// Attaches the socket, opens the mux in both directions and feeds any
    /// DATA that arrived while connecting through the decoder.
    pub fn complete_connect(&mut self, stream: TcpStream) {
        self.local = Some(stream);
        self.connecting = false;
        self.lifecycle = Lifecycle::OpenedDuplex;
        for payload in std::mem::take(&mut self.early_data) {
            self.decoder.submit_coded_bytes(&payload);
        }
    }

    // -----------------------------------------------------------------------
    // Inbound datagrams
    // -----------------------------------------------------------------------

    /// Apply one inbound datagram for this mux.
    ///
    /// A proxy mux whose outbound connect is still in progress already
    /// stands for a live client connection: it holds DATA for later and
    /// answers the peer's half-close notices.
    pub fn handle_datagram(&mut self, kind: MessageType, payload: &[u8], now: Instant) -> Inbound {
        use MessageType::*;

        let opened = self.lifecycle.is_opened();
        let live = opened || self.connecting;
        match kind {
            Data if self.connecting => {
                self.stash_early_data(payload);
                Inbound::Handled
            }
            Data if opened => {
                self.promote();
                if self.flags.local_write.is_opened() {
                    self.decoder.submit_coded_bytes(payload);
                } else {
                    log::debug!("[mux] {} local write closed; dropping DATA", self.identity);
                }
                Inbound::Handled
            }
            Ack if opened => {
                self.promote();
                self.encoder.on_ack_received(payload, now);
                Inbound::Handled
            }
            Close => Inbound::Remove,
            Empty if live => Inbound::Handled,
            WriteClosed if live => {
                self.flags.remote_write = HalfState::ClosedAcked;
                Inbound::Reply(WriteClosedAck)
            }
            WriteClosedAck if opened => {
                self.flags.local_write = HalfState::ClosedAcked;
                Inbound::Handled
            }
            NoOutstandingData if live => {
                self.flags.remote_outstanding = HalfState::ClosedAcked;
                Inbound::Reply(NoOutstandingDataAck)
            }
            NoOutstandingDataAck if opened => {
                self.flags.local_outstanding = HalfState::ClosedAcked;
                Inbound::Handled
            }
            _ => Inbound::Violation,
        }
    }

    fn promote(&mut self) {
        if self.lifecycle == Lifecycle::OpenedSimplex {
            log::debug!("[mux] {} simplex → duplex", self.identity);
            self.lifecycle = Lifecycle::OpenedDuplex;
        }
    }

    // -----------------------------------------------------------------------
    // Local socket
    // -----------------------------------------------------------------------

    /// Read once from the local socket into `buf` and hand the bytes to the
    /// encoder.
    pub fn read_local(&mut self, buf: &mut [u8], now: Instant) {
        let result = match self.local.as_ref() {
            Some(stream) => stream.try_read(buf),
            None => return,
        };
        match result {
            Ok(0) => {
                log::info!("[mux] {} local end-of-stream", self.identity);
                self.on_local_eof();
            }
            Ok(n) => {
                log::debug!("[mux] {} read {n} bytes from local socket", self.identity);
                self.encoder.submit_clear_bytes(&buf[..n], now);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::warn!("[mux] {} local read failed: {e}", self.identity);
                self.on_local_eof();
            }
        }
    }

    /// The local socket will produce no more bytes.
    ///
    /// Only reading stops: a half-closed application still gets the peer's
    /// reply.  The peer hears about it through NO_OUTSTANDING_DATA once
    /// everything read so far is acknowledged.
    fn on_local_eof(&mut self) {
        self.local_read = HalfState::ClosedAcked;
    }

    /// Move decoded bytes to the local socket, keeping whatever it will not
    /// take yet.
    pub fn flush_local(&mut self) {
        let decoded = self.decoder.take_clear_bytes();
        if !self.flags.local_write.is_opened() {
            if !decoded.is_empty() || !self.undelivered.is_empty() {
                log::debug!(
                    "[mux] {} local write closed; discarding {} bytes",
                    self.identity,
                    decoded.len() + self.undelivered.len()
                );
            }
            self.undelivered.clear();
            return;
        }
        self.undelivered.extend_from_slice(&decoded);
        self.deliver();

        if self.flags.local_write.is_opened()
            && self.undelivered.is_empty()
            && self.flags.remote_outstanding == HalfState::ClosedAcked
        {
            self.shutdown_local_write();
        }
    }

    fn deliver(&mut self) {
        while !self.undelivered.is_empty() {
            let result = match self.local.as_ref() {
                Some(stream) => stream.try_write(&self.undelivered),
                None => return,
            };
            match result {
                Ok(0) => {
                    log::warn!("[mux] {} local socket accepts no more bytes", self.identity);
                    self.on_local_write_failed();
                    return;
                }
                Ok(n) => {
                    self.undelivered.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("[mux] {} local write failed: {e}", self.identity);
                    self.on_local_write_failed();
                    return;
                }
            }
        }
    }

    /// Pass the peer's end-of-data on to the local application.
    fn shutdown_local_write(&mut self) {
        if self.local_shut {
            return;
        }
        let Some(stream) = self.local.as_mut() else {
            return;
        };
        self.local_shut = true;
        // Shutting down a tokio TCP stream completes without waiting.
        let mut cx = Context::from_waker(Waker::noop());
        match Pin::new(stream).poll_shutdown(&mut cx) {
            Poll::Ready(Ok(())) => {
                log::debug!("[mux] {} peer done sending; local write shut down", self.identity)
            }
            Poll::Ready(Err(e)) => {
                log::debug!("[mux] {} local shutdown failed: {e}", self.identity)
            }
            Poll::Pending => {}
        }
    }

    fn on_local_write_failed(&mut self) {
        self.undelivered.clear();
        if self.flags.local_write.is_opened() {
            self.flags.local_write = HalfState::ClosedUnacked;
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Earliest instant at which this mux needs attention.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.encoder.next_timeout();
        let mut consider = |candidate: Option<Instant>| {
            deadline = match (deadline, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };
        if self.lifecycle == Lifecycle::OpenedSimplex {
            consider(self.keepalive.deadline());
        }
        if self.flags.local_write == HalfState::ClosedUnacked {
            consider(self.write_closed_retry.deadline());
        }
        if self.flags.local_outstanding == HalfState::ClosedUnacked {
            consider(self.outstanding_retry.deadline());
        }
        deadline
    }

    /// Let the encoder retransmit if its timeout has passed.
    ///
    /// Returns `true` when the encoder timed out.
    pub fn fire_timeout(&mut self, now: Instant) -> bool {
        match self.encoder.next_timeout() {
            Some(at) if at <= now => {
                self.encoder.on_timeout(now);
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Egress
    // -----------------------------------------------------------------------

    /// Append every datagram this mux should send at `now` to `out`, then
    /// apply the closing rule.
    ///
    /// When the result is [`Reachability::Unreachable`], a final CLOSE has
    /// been appended and the caller must remove the mux.
    pub fn egress(&mut self, now: Instant, out: &mut Vec<Datagram>) -> Reachability {
        let id = self.identity;

        for ack in self.decoder.take_acks() {
            out.push(Datagram::new(id, MessageType::Ack, ack));
        }

        if self.lifecycle == Lifecycle::OpenedSimplex
            && self.encoder.queued() == 0
            && self.keepalive.is_due(now)
        {
            out.push(Datagram::control(id, MessageType::Empty));
            self.keepalive.mark_sent(now);
        }

        if self.lifecycle.is_opened() {
            let packets = self.encoder.take_packets();
            if self.flags.remote_write.is_opened() {
                out.extend(
                    packets
                        .into_iter()
                        .map(|p| Datagram::new(id, MessageType::Data, p)),
                );
            } else if !packets.is_empty() {
                log::debug!(
                    "[mux] {id} peer stopped writing; dropping {} DATA packet(s)",
                    packets.len()
                );
            }
        }

        if self.flags.local_write == HalfState::ClosedUnacked && self.write_closed_retry.is_due(now) {
            log::debug!("[mux] {id} → WRITE_CLOSED");
            out.push(Datagram::control(id, MessageType::WriteClosed));
            self.write_closed_retry.mark_sent(now);
        }

        if self.local_read == HalfState::ClosedAcked
            && !self.encoder.has_outstanding_data()
            && self.flags.local_outstanding != HalfState::ClosedAcked
            && self.outstanding_retry.is_due(now)
        {
            log::debug!("[mux] {id} → NO_OUTSTANDING_DATA");
            self.flags.local_outstanding = HalfState::ClosedUnacked;
            out.push(Datagram::control(id, MessageType::NoOutstandingData));
            self.outstanding_retry.mark_sent(now);
        }

        let reach = self.flags.reachability();
        if !reach.is_reachable() {
            log::debug!("[mux] {id} unreachable ({}); → CLOSE", self.flags);
            out.push(Datagram::control(id, MessageType::Close));
        }
        reach
    }
}

//! The coder boundary and its default Go-Back-N implementation.
//!
//! A mux never looks inside DATA or ACK payloads.  It hands clear bytes read
//! from the local TCP socket to an [`Encoder`], ships whatever packets the
//! encoder produces as DATA datagrams, and feeds ACK payloads back to it.  On
//! the receiving side a [`Decoder`] turns DATA payloads into clear bytes and
//! ACK payloads.
//!
//! ```text
//!   local TCP ──▶ Encoder ──DATA──▶ ~~~ UDP ~~~ ──DATA──▶ Decoder ──▶ local TCP
//!                    ▲                                        │
//!                    └────────────ACK───── ~~~ UDP ~~~ ◀──ACK─┘
//! ```
//!
//! [`GbnCoder`] frames every chunk as `seq(4) ‖ bytes` and acknowledges with
//! a cumulative `ack(4)`, both big-endian.  It reuses the window logic in
//! [`crate::gbn_sender`] and [`crate::gbn_receiver`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::gbn_receiver::GbnReceiver;
use crate::gbn_sender::GbnSender;
use crate::packet::{HEADER_LEN, MAX_IPV4_DATAGRAM};
use crate::timer::{RetransmitTimer, TimerConfig};

/// Size of the sequence / acknowledgement prefix.
const SEQ_LEN: usize = 4;

/// Largest chunk whose DATA datagram, header and prefix included, still
/// fits one IPv4 UDP datagram.
pub const MAX_SEGMENT_LIMIT: usize = MAX_IPV4_DATAGRAM - HEADER_LEN - SEQ_LEN;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Send half of a coded stream.
pub trait Encoder: Send + Sync {
    /// Accept clear bytes read from the local application.
    fn submit_clear_bytes(&mut self, buf: &[u8], now: Instant);

    /// Process the payload of an ACK datagram.
    fn on_ack_received(&mut self, payload: &[u8], now: Instant);

    /// Called once [`next_timeout`](Self::next_timeout) has passed.
    fn on_timeout(&mut self, now: Instant);

    /// `false` asks the caller to stop reading the local socket for now.
    fn may_submit_more(&self) -> bool;

    /// `true` while any submitted byte is not yet acknowledged.
    fn has_outstanding_data(&self) -> bool;

    fn next_timeout(&self) -> Option<Instant>;

    /// Number of packets waiting in [`take_packets`](Self::take_packets).
    fn queued(&self) -> usize;

    /// Drain the packets to send as DATA payloads.
    fn take_packets(&mut self) -> Vec<Vec<u8>>;
}

/// Receive half of a coded stream.
pub trait Decoder: Send + Sync {
    /// Process the payload of a DATA datagram.
    fn submit_coded_bytes(&mut self, buf: &[u8]);

    /// Drain decoded bytes ready for the local application.
    fn take_clear_bytes(&mut self) -> Vec<u8>;

    /// Drain the payloads to send as ACK datagrams.
    fn take_acks(&mut self) -> Vec<Vec<u8>>;
}

/// Factory producing one encoder/decoder pair per mux.
pub trait Coder: Send + Sync {
    fn encoder(&self) -> Box<dyn Encoder>;
    fn decoder(&self) -> Box<dyn Decoder>;
}

// ---------------------------------------------------------------------------
// Go-Back-N
// ---------------------------------------------------------------------------

/// Tuning for [`GbnCoder`].
#[derive(Debug, Clone)]
pub struct CoderConfig {
    /// Segments in flight before the encoder stops sending new ones.
    pub window: usize,
    /// Largest chunk of clear bytes carried by one DATA datagram.
    pub max_segment: usize,
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
}

impl Default for CoderConfig {
    fn default() -> Self {
        let timers = TimerConfig::default();
        Self {
            window: 32,
            max_segment: 1200,
            initial_rto: timers.initial_rto,
            min_rto: timers.min_rto,
            max_rto: timers.max_rto,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GbnCoder {
    config: CoderConfig,
}

impl GbnCoder {
    pub fn new(config: CoderConfig) -> Self {
        Self { config }
    }
}

impl Coder for GbnCoder {
    fn encoder(&self) -> Box<dyn Encoder> {
        Box::new(GbnEncoder::new(&self.config))
    }

    fn decoder(&self) -> Box<dyn Decoder> {
        Box::new(GbnDecoder::new())
    }
}

fn frame(seq: u32, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEQ_LEN + chunk.len());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(chunk);
    out
}

fn read_u32(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; SEQ_LEN] = buf.get(..SEQ_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Go-Back-N encoder.
///
/// Bytes beyond the window wait in a backlog of chunks.  Once the backlog is
/// a full window deep the encoder refuses more input, which pauses reads on
/// the local socket.
#[derive(Debug)]
pub struct GbnEncoder {
    sender: GbnSender,
    rto: RetransmitTimer,
    max_segment: usize,
    backlog: VecDeque<Vec<u8>>,
    outgoing: Vec<Vec<u8>>,
    deadline: Option<Instant>,
}

impl GbnEncoder {
    pub fn new(config: &CoderConfig) -> Self {
        Self {
            sender: GbnSender::new(0, config.window.max(1)),
            rto: RetransmitTimer::new(config.initial_rto, config.min_rto, config.max_rto),
            max_segment: config.max_segment.clamp(1, MAX_SEGMENT_LIMIT),
            backlog: VecDeque::new(),
            outgoing: Vec::new(),
            deadline: None,
        }
    }

    pub fn current_rto(&self) -> Duration {
        self.rto.current_rto
    }

    /// Move backlog chunks into free window slots.
    fn fill_window(&mut self, now: Instant) {
        while self.sender.can_send() {
            let Some(chunk) = self.backlog.pop_front() else {
                break;
            };
            let seq = self.sender.next_seq;
            log::debug!("[gbn] → DATA seq={seq} len={}", chunk.len());
            self.outgoing.push(frame(seq, &chunk));
            self.sender.record_sent(chunk, now);
            if self.deadline.is_none() {
                self.deadline = Some(now + self.rto.current_rto);
            }
        }
    }
}

impl Encoder for GbnEncoder {
    fn submit_clear_bytes(&mut self, buf: &[u8], now: Instant) {
        self.backlog
            .extend(buf.chunks(self.max_segment).map(<[u8]>::to_vec));
        self.fill_window(now);
    }

    fn on_ack_received(&mut self, payload: &[u8], now: Instant) {
        let Some(ack_num) = read_u32(payload) else {
            log::debug!("[gbn] ← ACK too short ({} bytes); ignoring", payload.len());
            return;
        };
        let outcome = self.sender.on_ack(ack_num, now);
        if outcome.acked == 0 {
            log::debug!("[gbn] ← ACK ack={ack_num} (duplicate)");
            return;
        }
        log::debug!(
            "[gbn] ← ACK ack={ack_num} slid {} segment(s), in flight {}",
            outcome.acked,
            self.sender.in_flight()
        );

        // Karn: only samples from segments sent exactly once update the RTO.
        if let Some(rtt) = outcome.rtt_sample {
            self.rto.record_rtt_sample(rtt);
        }

        self.fill_window(now);
        self.deadline = self
            .sender
            .has_unacked()
            .then(|| now + self.rto.current_rto);
    }

    fn on_timeout(&mut self, now: Instant) {
        if !self.sender.has_unacked() {
            self.deadline = None;
            return;
        }

        // Anything still queued is a stale copy of the same window.
        self.outgoing.clear();
        for seg in self.sender.window_entries() {
            self.outgoing.push(frame(seg.seq, &seg.payload));
        }
        self.sender.on_retransmit(now);
        self.rto.back_off();
        self.deadline = Some(now + self.rto.current_rto);

        log::debug!(
            "[gbn] timeout: retransmitting {} segment(s) from seq={}, rto={:?}",
            self.outgoing.len(),
            self.sender.send_base,
            self.rto.current_rto
        );
    }

    fn may_submit_more(&self) -> bool {
        self.backlog.len() < self.sender.window_size()
    }

    fn has_outstanding_data(&self) -> bool {
        self.sender.has_unacked() || !self.backlog.is_empty()
    }

    fn next_timeout(&self) -> Option<Instant> {
        self.deadline
    }

    fn queued(&self) -> usize {
        self.outgoing.len()
    }

    fn take_packets(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outgoing)
    }
}

/// Go-Back-N decoder: accepts in-order segments and answers every DATA with
/// a cumulative ACK.
#[derive(Debug, Default)]
pub struct GbnDecoder {
    receiver: GbnReceiver,
    acks: Vec<Vec<u8>>,
}

impl GbnDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for GbnDecoder {
    fn submit_coded_bytes(&mut self, buf: &[u8]) {
        let Some(seq) = read_u32(buf) else {
            log::debug!("[gbn] ← DATA too short ({} bytes); ignoring", buf.len());
            return;
        };
        let accepted = self.receiver.on_segment(seq, &buf[SEQ_LEN..]);
        log::debug!(
            "[gbn] ← DATA seq={seq} len={} {}",
            buf.len() - SEQ_LEN,
            if accepted { "accepted" } else { "discarded" }
        );
        self.acks
            .push(self.receiver.ack_number().to_be_bytes().to_vec());
    }

    fn take_clear_bytes(&mut self) -> Vec<u8> {
        self.receiver.take_ready()
    }

    fn take_acks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.acks)
    }
}

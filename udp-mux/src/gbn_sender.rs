//! Go-Back-N send-side window.
//!
//! [`GbnSender`] tracks up to `N` in-flight chunks of one coded stream.
//!
//! # Protocol contract
//!
//! - At most `window_size` chunks may be in flight at once.
//! - ACKs are **cumulative**: `ack_num = K` means the receiver has accepted
//!   all bytes up to (but not including) sequence number `K`.
//! - On timeout, the caller retransmits **all** unacked chunks from
//!   `send_base` onwards (go back to N).
//! - Sequence numbers are u32 byte offsets and wrap around using modular
//!   arithmetic; two numbers are comparable while they are less than
//!   `u32::MAX / 2` apart.
//!
//! This module only manages state; framing and socket I/O live in
//! [`crate::coder`] and [`crate::reactor`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
#[inline]
fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// A single in-flight chunk occupying one slot in the retransmit window.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Sequence number of the first byte of `payload`.
    pub seq: u32,
    pub payload: Vec<u8>,
    /// Total number of times this chunk has been transmitted.
    pub tx_count: u32,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
}

impl Segment {
    /// First sequence number after this chunk.
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.payload.len() as u32)
    }
}

/// Result of applying one cumulative ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    /// Number of chunks that left the window.
    pub acked: usize,
    /// Round-trip time measured on the newest acked chunk, when it was only
    /// ever sent once (Karn's rule).
    pub rtt_sample: Option<Duration>,
}

/// Go-Back-N send-side state for one coded stream.
///
/// ```text
///  send_base          next_seq
///      │                  │
///  ────┼──────────────────┼──────────────────▶ seq space
///      │ <── in flight ──▶│ <── sendable ───▶
/// ```
#[derive(Debug)]
pub struct GbnSender {
    /// Sequence number of the **oldest** unacked byte (left window edge).
    pub send_base: u32,

    /// Sequence number for the **next** new chunk.
    pub next_seq: u32,

    /// Maximum number of chunks in flight simultaneously (N).
    window_size: usize,

    /// In-flight chunks ordered by sequence number (front = oldest).
    window: VecDeque<Segment>,
}

impl GbnSender {
    /// Create a new [`GbnSender`] whose first chunk carries `seq_start`.
    pub fn new(seq_start: u32, window_size: usize) -> Self {
        assert!(window_size >= 1, "window_size must be at least 1");
        Self {
            send_base: seq_start,
            next_seq: seq_start,
            window_size,
            window: VecDeque::with_capacity(window_size),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// `true` when there is room for at least one more in-flight chunk.
    pub fn can_send(&self) -> bool {
        self.window.len() < self.window_size
    }

    /// Number of chunks currently awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn has_unacked(&self) -> bool {
        !self.window.is_empty()
    }

    /// Place a just-transmitted chunk into the window and advance `next_seq`.
    ///
    /// Returns the sequence number assigned to the chunk.  Check
    /// [`can_send`](Self::can_send) before calling.
    pub fn record_sent(&mut self, payload: Vec<u8>, now: Instant) -> u32 {
        debug_assert!(
            self.can_send(),
            "record_sent called on a full GBN window ({} / {})",
            self.window.len(),
            self.window_size
        );
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(payload.len() as u32);
        self.window.push_back(Segment {
            seq,
            payload,
            tx_count: 1,
            sent_at: now,
        });
        seq
    }

    /// Process a cumulative ACK received at `now`.
    ///
    /// Removes every chunk that ends at or before `ack_num` and advances
    /// `send_base`.  Duplicate or out-of-range ACKs leave the window alone
    /// and report zero acked chunks.
    pub fn on_ack(&mut self, ack_num: u32, now: Instant) -> AckOutcome {
        if !seq_le(self.send_base, ack_num) || !seq_le(ack_num, self.next_seq) {
            return AckOutcome::default();
        }
        if ack_num == self.send_base {
            return AckOutcome::default();
        }

        let mut outcome = AckOutcome::default();
        while let Some(front) = self.window.front() {
            if !seq_le(front.end(), ack_num) {
                break;
            }
            self.send_base = front.end();
            outcome.rtt_sample = (front.tx_count == 1)
                .then(|| now.saturating_duration_since(front.sent_at));
            outcome.acked += 1;
            self.window.pop_front();
        }
        outcome
    }

    /// Iterate over all in-flight chunks from oldest to newest.
    pub fn window_entries(&self) -> impl Iterator<Item = &Segment> {
        self.window.iter()
    }

    /// Bump the transmission count and refresh `sent_at` for every in-flight
    /// chunk.  Call right after requeueing the whole window.
    pub fn on_retransmit(&mut self, now: Instant) {
        for entry in self.window.iter_mut() {
            entry.tx_count += 1;
            entry.sent_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let s = GbnSender::new(100, 4);
        assert_eq!(s.send_base, 100);
        assert_eq!(s.next_seq, 100);
        assert!(s.can_send());
        assert!(!s.has_unacked());
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn record_sent_advances_next_seq() {
        let mut s = GbnSender::new(0, 4);
        let seq = s.record_sent(vec![1, 2, 3], Instant::now());

        assert_eq!(seq, 0);
        assert_eq!(s.next_seq, 3);
        assert_eq!(s.send_base, 0);
        assert_eq!(s.in_flight(), 1);
    }

    #[test]
    fn window_full_blocks_send() {
        let mut s = GbnSender::new(0, 2);
        let now = Instant::now();
        s.record_sent(vec![0u8; 5], now);
        s.record_sent(vec![0u8; 5], now);
        assert!(!s.can_send());
    }

    #[test]
    fn cumulative_ack_slides_multiple() {
        let mut s = GbnSender::new(0, 4);
        let t0 = Instant::now();
        for _ in 0..3 {
            s.record_sent(vec![0u8; 5], t0);
        }

        let outcome = s.on_ack(15, t0 + Duration::from_millis(40));
        assert_eq!(outcome.acked, 3);
        assert_eq!(outcome.rtt_sample, Some(Duration::from_millis(40)));
        assert_eq!(s.send_base, 15);
        assert!(!s.has_unacked());
    }

    #[test]
    fn partial_cumulative_ack() {
        let mut s = GbnSender::new(0, 4);
        let now = Instant::now();
        for _ in 0..3 {
            s.record_sent(vec![0u8; 5], now);
        }
        // An ACK in the middle of the third chunk only covers two.
        assert_eq!(s.on_ack(12, now).acked, 2);
        assert_eq!(s.send_base, 10);
        assert_eq!(s.in_flight(), 1);
    }

    #[test]
    fn duplicate_and_spurious_acks_ignored() {
        let mut s = GbnSender::new(0, 4);
        let now = Instant::now();
        s.record_sent(vec![0u8; 5], now);

        assert_eq!(s.on_ack(5, now).acked, 1);
        assert_eq!(s.on_ack(5, now).acked, 0);
        assert_eq!(s.on_ack(1000, now).acked, 0);
        assert_eq!(s.send_base, 5);
    }

    #[test]
    fn retransmitted_chunk_gives_no_rtt_sample() {
        let mut s = GbnSender::new(0, 4);
        let t0 = Instant::now();
        s.record_sent(vec![0u8; 5], t0);
        s.on_retransmit(t0 + Duration::from_secs(1));
        assert_eq!(s.window_entries().next().map(|e| e.tx_count), Some(2));

        let outcome = s.on_ack(5, t0 + Duration::from_millis(1100));
        assert_eq!(outcome.acked, 1);
        assert_eq!(outcome.rtt_sample, None);
    }

    #[test]
    fn seq_wrap_around() {
        let start = u32::MAX - 5;
        let mut s = GbnSender::new(start, 4);
        let now = Instant::now();
        s.record_sent(vec![0u8; 10], now);

        let expected_ack = start.wrapping_add(10);
        assert_eq!(s.on_ack(expected_ack, now).acked, 1);
        assert_eq!(s.send_base, expected_ack);
    }
}

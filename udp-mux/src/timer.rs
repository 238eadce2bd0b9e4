//! Retransmission timers.
//!
//! Two kinds of timer drive retransmission:
//! - [`RetryTimer`] — a fixed-interval periodic retry, used for the
//!   close-handshake control messages (`WRITE_CLOSED`,
//!   `NO_OUTSTANDING_DATA`) and for keep-alive `EMPTY` datagrams.  There is
//!   no back-off: a message is resent once per interval until
//!   the peer acknowledges it.
//! - [`RetransmitTimer`] — an adaptive RTO for coded data, computed with
//!   Jacobson's algorithm (RFC 6298): `RTO = SRTT + 4 × RTTVAR`, kept above a
//!   floor and doubling on each consecutive timeout up to a maximum.
//!
//! All timestamps are [`tokio::time::Instant`]s and every method takes `now`
//! explicitly, so state transitions are deterministic under test.

use std::time::Duration;

use tokio::time::Instant;

/// Adjustable timeout parameters.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Fixed interval between retransmissions of a control message.
    pub retransmit_interval: Duration,
    /// Longest the reactor sleeps when no deadline is armed.
    pub wait_ceiling: Duration,
    /// Upper bound on the proxy's outbound TCP connect.
    pub connect_timeout: Duration,
    /// Initial data RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Floor for the data RTO, however small the measured RTT.
    pub min_rto: Duration,
    /// Maximum data RTO after repeated back-off.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            retransmit_interval: Duration::from_millis(500),
            wait_ceiling: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryTimer
// ---------------------------------------------------------------------------

/// Periodic retry bookkeeping for one control message.
///
/// Records when the message was last sent; it is due again once
/// `interval` has elapsed.  A timer that never fired is due immediately.
#[derive(Debug, Clone)]
pub struct RetryTimer {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl RetryTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// `true` when the message may be (re)sent at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        }
    }

    /// Record a transmission at `now`; the next one is due one interval later.
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// When the message next becomes due, or `None` if it was never sent.
    pub fn deadline(&self) -> Option<Instant> {
        self.last_sent.map(|at| at + self.interval)
    }
}

// ---------------------------------------------------------------------------
// RetransmitTimer
// ---------------------------------------------------------------------------

/// Adaptive retransmission timeout for one coded stream.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    initial_rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    /// Current RTO, updated after each RTT sample.
    pub current_rto: Duration,
    /// Smoothed RTT estimate (SRTT).
    pub srtt: Option<Duration>,
    /// RTT variance estimate (RTTVAR).
    pub rttvar: Option<Duration>,
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        let config = TimerConfig::default();
        Self::new(config.initial_rto, config.min_rto, config.max_rto)
    }
}

impl RetransmitTimer {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            initial_rto,
            min_rto: min_rto.min(max_rto),
            max_rto,
            current_rto: initial_rto,
            srtt: None,
            rttvar: None,
        }
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2,  RTO = SRTT + 4·RTTVAR.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.reset();
    }

    /// Double the RTO on retransmit timeout (RFC 6298 §5.5), capped at
    /// `max_rto`.
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.max_rto);
    }

    /// Restore `current_rto` from the current SRTT / RTTVAR estimates.
    ///
    /// Falls back to `initial_rto` before the first RTT sample is available.
    pub fn reset(&mut self) {
        self.current_rto = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                (srtt + rttvar * 4).clamp(self.min_rto, self.max_rto)
            }
            _ => self.initial_rto,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_timer_due_immediately_then_after_interval() {
        let t0 = Instant::now();
        let mut t = RetryTimer::new(Duration::from_millis(100));
        assert!(t.is_due(t0));
        assert_eq!(t.deadline(), None);

        t.mark_sent(t0);
        assert!(!t.is_due(t0));
        assert!(!t.is_due(t0 + Duration::from_millis(99)));
        assert!(t.is_due(t0 + Duration::from_millis(100)));
        assert_eq!(t.deadline(), Some(t0 + Duration::from_millis(100)));
    }

    #[test]
    fn retry_timer_resets_on_every_send() {
        let t0 = Instant::now();
        let mut t = RetryTimer::new(Duration::from_millis(100));
        t.mark_sent(t0);
        t.mark_sent(t0 + Duration::from_millis(150));
        assert!(!t.is_due(t0 + Duration::from_millis(200)));
        assert!(t.is_due(t0 + Duration::from_millis(250)));
    }

    #[test]
    fn first_rtt_sample_sets_rto() {
        let mut t = RetransmitTimer::new(
            Duration::from_secs(1),
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        t.record_rtt_sample(Duration::from_millis(100));
        assert_eq!(t.srtt, Some(Duration::from_millis(100)));
        assert_eq!(t.rttvar, Some(Duration::from_millis(50)));
        assert_eq!(t.current_rto, Duration::from_millis(300));
    }

    #[test]
    fn back_off_doubles_and_caps() {
        let mut t = RetransmitTimer::new(
            Duration::from_secs(1),
            Duration::from_millis(10),
            Duration::from_secs(3),
        );
        t.back_off();
        assert_eq!(t.current_rto, Duration::from_secs(2));
        t.back_off();
        assert_eq!(t.current_rto, Duration::from_secs(3));
        t.reset();
        assert_eq!(t.current_rto, Duration::from_secs(1));
    }

    #[test]
    fn tiny_rtt_is_floored() {
        let mut t = RetransmitTimer::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(60),
        );
        t.record_rtt_sample(Duration::from_micros(80));
        assert_eq!(t.current_rto, Duration::from_millis(200));
    }
}

//! Go-Back-N receive side.
//!
//! - Only **in-order** chunks are accepted (seq == `rcv_nxt`).
//! - Out-of-order or duplicate chunks are discarded.
//! - After every chunk, accepted or not, the caller acknowledges with
//!   [`GbnReceiver::ack_number`], the highest contiguous sequence number
//!   received so far.

/// Go-Back-N receive-side state for one coded stream.
#[derive(Debug, Default)]
pub struct GbnReceiver {
    /// Next expected sequence number (`RCV.NXT`).
    pub rcv_nxt: u32,

    /// In-order bytes waiting to be handed to the local application.
    ready: Vec<u8>,
}

impl GbnReceiver {
    pub fn new(rcv_nxt: u32) -> Self {
        Self {
            rcv_nxt,
            ready: Vec::new(),
        }
    }

    /// Process an inbound chunk.
    ///
    /// Returns `true` if the chunk was accepted and its bytes were appended
    /// to the ready buffer.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> bool {
        if seq != self.rcv_nxt {
            return false;
        }
        self.ready.extend_from_slice(payload);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
        true
    }

    /// Cumulative ACK number: "everything before this has arrived".
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Take every buffered in-order byte.
    pub fn take_ready(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.ready)
    }
}

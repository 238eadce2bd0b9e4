//! Connection state types.
//!
//! A mux carries two independent pieces of state:
//! - its [`Lifecycle`], which only ever moves forward, and
//! - four directional [`HalfState`] flags ([`HalfCloseFlags`]) that model the
//!   two notify/acknowledge handshakes ("write closed" and "no outstanding
//!   data") for each side.
//!
//! There is no terminal "closed" lifecycle state.  When the flags no longer
//! allow communication in any direction ([`Reachability::Unreachable`]) the
//! mux is dropped from the registry instead.
//!
//! ```text
//!  Init ──(client) accept──▶ OpenedSimplex ──DATA or ACK──▶ OpenedDuplex
//!    │                                                              ▲
//!    └───────────────── (proxy) connect ok ─────────────────────────┘
//! ```
//!
//! Transitions are driven by [`crate::mux::Mux`]; this module only holds the
//! types and the pure closing rule.

use std::fmt;

/// Where a mux is in its opening sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    /// Record exists; the local TCP side may not be usable yet.
    #[default]
    Init,
    /// Local TCP side usable; the peer has not yet proven it is talking back.
    OpenedSimplex,
    /// Both directions confirmed by a DATA or ACK exchange.
    OpenedDuplex,
}

impl Lifecycle {
    /// `true` once the local TCP side is usable.
    pub fn is_opened(self) -> bool {
        matches!(self, Lifecycle::OpenedSimplex | Lifecycle::OpenedDuplex)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One direction of the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HalfState {
    #[default]
    Opened,
    /// Closed locally; the peer has not confirmed it yet.
    ClosedUnacked,
    /// Closed and confirmed (or closed with nothing left to confirm).
    ClosedAcked,
}

impl HalfState {
    pub fn is_opened(self) -> bool {
        self == HalfState::Opened
    }

    /// All three values, for exhaustive tests.
    pub const ALL: [HalfState; 3] = [
        HalfState::Opened,
        HalfState::ClosedUnacked,
        HalfState::ClosedAcked,
    ];
}

/// The four directional flags of one mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HalfCloseFlags {
    /// Whether decoded bytes may still be written to the local application.
    pub local_write: HalfState,
    /// Whether the peer still writes to its local application, as last
    /// reported by the peer.
    pub remote_write: HalfState,
    /// Whether this side still has data the peer has not acknowledged.
    pub local_outstanding: HalfState,
    /// The peer's equivalent of `local_outstanding`, as last reported.
    pub remote_outstanding: HalfState,
}

impl HalfCloseFlags {
    pub fn reachability(&self) -> Reachability {
        Reachability::classify(self)
    }
}

impl fmt::Display for HalfCloseFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lw={:?} lo={:?} rw={:?} ro={:?}",
            self.local_write, self.local_outstanding, self.remote_write, self.remote_outstanding
        )
    }
}

/// Which directions of communication a mux can still carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// Both directions are still open.
    Duplex,
    /// Only peer → local application remains possible.
    InboundOnly,
    /// Only local application → peer remains possible.
    OutboundOnly,
    /// Nothing left to carry; the mux must be closed and removed.
    Unreachable,
}

impl Reachability {
    /// Apply the closing rule.
    ///
    /// The three "still possible" predicates are checked in order; the first
    /// one that holds wins.
    pub fn classify(flags: &HalfCloseFlags) -> Self {
        use HalfState::Opened;

        match (
            flags.local_write,
            flags.local_outstanding,
            flags.remote_write,
            flags.remote_outstanding,
        ) {
            (Opened, Opened, Opened, Opened) => Reachability::Duplex,
            (Opened, _, _, Opened) => Reachability::InboundOnly,
            (_, Opened, Opened, _) => Reachability::OutboundOnly,
            _ => Reachability::Unreachable,
        }
    }

    pub fn is_reachable(self) -> bool {
        self != Reachability::Unreachable
    }
}

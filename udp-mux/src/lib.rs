//! `udp-mux` — many TCP connections multiplexed over one UDP flow.
//!
//! # Architecture
//!
//! ```text
//!   app ──TCP──▶ ┌────────────┐                    ┌────────────┐ ──TCP──▶ server
//!   app ──TCP──▶ │   client   │ ══ one UDP flow ══ │   proxy    │ ──TCP──▶ server
//!   app ──TCP──▶ │  Reactor   │                    │  Reactor   │ ──TCP──▶ server
//!                └─────┬──────┘                    └────────────┘
//!                      │ owns
//!          ┌───────────▼────────────┐
//!          │ Registry: Vec<Mux>     │  one Mux per Identity
//!          └───────────┬────────────┘
//!                      │
//!          ┌───────────▼────────────┐
//!          │ Mux                    │  lifecycle + half-close flags,
//!          │  ├─ Encoder (GBN)      │  local TCP socket, retry timers
//!          │  └─ Decoder (GBN)      │
//!          └────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]        — wire format (serialise / deserialise, checksum)
//! - [`state`]         — lifecycle, half-close flags and the closing rule
//! - [`timer`]         — fixed-interval retries and the adaptive data RTO
//! - [`coder`]         — Encoder / Decoder / Coder traits + Go-Back-N coder
//! - [`gbn_sender`]    — GBN outbound window state machine
//! - [`gbn_receiver`]  — GBN inbound cumulative-ACK state machine
//! - [`mux`]           — one multiplexed connection
//! - [`registry`]      — the set of live muxes
//! - [`reactor`]       — single-threaded event loop for either role
//! - [`original_dst`]  — recovering a redirected connection's destination
//! - [`socket`]        — UDP socket abstraction
//! - [`config`]        — runtime configuration and validation
//! - [`error`]         — error types

pub mod coder;
pub mod config;
pub mod error;
pub mod gbn_receiver;
pub mod gbn_sender;
pub mod mux;
pub mod original_dst;
pub mod packet;
pub mod reactor;
pub mod registry;
pub mod socket;
pub mod state;
pub mod timer;

pub use config::{Config, Role};
pub use reactor::Reactor;

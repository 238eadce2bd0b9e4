//! The set of live muxes, keyed by [`Identity`].
//!
//! Muxes live in a `Vec` in creation order.  Lookups are linear: the
//! expected number of concurrent connections is small, and the reactor
//! walks every entry on each turn anyway.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::coder::Coder;
use crate::mux::{Mux, MuxHandle};
use crate::packet::Identity;

pub struct Registry {
    muxes: Vec<Mux>,
    coder: Box<dyn Coder>,
    retransmit_interval: Duration,
    next_handle: u64,
}

impl Registry {
    pub fn new(coder: Box<dyn Coder>, retransmit_interval: Duration) -> Self {
        Self {
            muxes: Vec::new(),
            coder,
            retransmit_interval,
            next_handle: 0,
        }
    }

    /// Return the position of the mux for `identity`, creating it first if
    /// needed.  The flag is `true` when the mux is new.
    ///
    /// A new mux starts in `Init` with a fresh encoder/decoder pair.  When
    /// `local` is given it becomes the mux's local socket, replacing any
    /// previous one.
    pub fn find_or_create(
        &mut self,
        identity: Identity,
        local: Option<TcpStream>,
        udp_remote: SocketAddr,
    ) -> (usize, bool) {
        if let Some(index) = self.position(&identity) {
            if let Some(stream) = local {
                self.muxes[index].attach_local(stream);
            }
            return (index, false);
        }

        let handle = MuxHandle(self.next_handle);
        self.next_handle += 1;
        let mut mux = Mux::new(
            handle,
            identity,
            udp_remote,
            self.coder.encoder(),
            self.coder.decoder(),
            self.retransmit_interval,
        );
        if let Some(stream) = local {
            mux.attach_local(stream);
        }
        log::debug!("[registry] new mux {handle} for {identity}");
        self.muxes.push(mux);
        (self.muxes.len() - 1, true)
    }

    pub fn position(&self, identity: &Identity) -> Option<usize> {
        self.muxes.iter().position(|m| m.identity() == *identity)
    }

    pub fn position_of(&self, handle: MuxHandle) -> Option<usize> {
        self.muxes.iter().position(|m| m.handle() == handle)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.position(identity).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&Mux> {
        self.muxes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Mux> {
        self.muxes.get_mut(index)
    }

    pub fn find(&self, identity: &Identity) -> Option<&Mux> {
        self.muxes.iter().find(|m| m.identity() == *identity)
    }

    /// Remove the mux at `index`.  Later entries shift down by one, so a
    /// caller iterating by position must not advance past the gap.
    pub fn remove(&mut self, index: usize) -> Mux {
        let mux = self.muxes.remove(index);
        log::debug!("[registry] dropped mux {} for {}", mux.handle(), mux.identity());
        mux
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mux> {
        self.muxes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Mux> {
        self.muxes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.muxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.muxes.is_empty()
    }

    /// Earliest deadline over every mux.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.muxes.iter().filter_map(Mux::next_deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coder::GbnCoder;
    use crate::state::Lifecycle;
    use rand::Rng;
    use std::collections::HashSet;
    use std::net::SocketAddrV4;

    fn make_registry() -> Registry {
        Registry::new(Box::new(GbnCoder::default()), Duration::from_millis(100))
    }

    fn make_identity(source_port: u16, random_id: u16) -> Identity {
        Identity::new(source_port, SocketAddrV4::new([192, 0, 2, 1].into(), 443), random_id)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().expect("addr")
    }

    #[test]
    fn find_or_create_returns_existing() {
        let mut reg = make_registry();
        let id = make_identity(1000, 1);

        let (first, created) = reg.find_or_create(id, None, peer());
        assert!(created);
        assert_eq!(reg.get(first).map(Mux::lifecycle), Some(Lifecycle::Init));

        let (again, created) = reg.find_or_create(id, None, peer());
        assert!(!created);
        assert_eq!(first, again);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn random_component_separates_identities() {
        let mut reg = make_registry();
        reg.find_or_create(make_identity(1000, 1), None, peer());
        reg.find_or_create(make_identity(1000, 2), None, peer());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn removal_shifts_positions_but_not_handles() {
        let mut reg = make_registry();
        let a = make_identity(1, 0);
        let b = make_identity(2, 0);
        reg.find_or_create(a, None, peer());
        let (ib, _) = reg.find_or_create(b, None, peer());
        let handle_b = reg.get(ib).map(Mux::handle).expect("mux b");

        reg.remove(0);
        assert_eq!(reg.position(&b), Some(0));
        assert_eq!(reg.position_of(handle_b), Some(0));
        assert!(!reg.contains(&a));
    }

    #[test]
    fn identities_stay_unique_under_churn() {
        let mut reg = make_registry();
        let mut rng = rand::rng();

        for _ in 0..2000 {
            if !reg.is_empty() && rng.random_bool(0.3) {
                let index = rng.random_range(0..reg.len());
                reg.remove(index);
            } else {
                // Small value space so collisions are frequent.
                let id = make_identity(rng.random_range(0..8), rng.random_range(0..4));
                reg.find_or_create(id, None, peer());
            }

            let ids: HashSet<Identity> = reg.iter().map(Mux::identity).collect();
            assert_eq!(ids.len(), reg.len());
        }
    }

    #[test]
    fn next_deadline_is_earliest() {
        let mut reg = make_registry();
        assert_eq!(reg.next_deadline(), None);

        let t0 = Instant::now();
        for (i, offset) in [(1u16, 0u64), (2, 30)] {
            let (index, _) = reg.find_or_create(make_identity(i, 0), None, peer());
            let mux = reg.get_mut(index).expect("mux");
            mux.open_simplex();
            mux.egress(t0 + Duration::from_millis(offset), &mut Vec::new());
        }
        assert_eq!(reg.next_deadline(), Some(t0 + Duration::from_millis(100)));
    }
}

//! Deterministic [`RingPolicy`] driven by explicit tables.
//!
//! `StaticPolicy` is the policy the test-suite runs the engine against, and
//! the one the binary uses when no ring implementation is plugged in: every
//! answer comes from a table filled in at construction time.
//!
//! - responsibility: a peer is responsible for exactly the keys assigned to it
//! - admission: everything is admitted unless the peer or address is rejected
//! - next hop: the peer itself unless a route is configured
//! - quota: [`split_evenly`](crate::protocols::split_evenly)

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::identity::RingHandle;
use crate::protocols::{RingPolicy, DEFAULT_MAX_PEERS};

#[derive(Debug)]
pub struct StaticPolicy {
    responsible: BTreeMap<RingHandle, BTreeSet<String>>,
    rejected_peers: BTreeSet<RingHandle>,
    rejected_addrs: BTreeSet<SocketAddr>,
    routes: BTreeMap<RingHandle, RingHandle>,
    max_peers: usize,
    reputation: Mutex<BTreeMap<RingHandle, u32>>,
    inserted: Mutex<Vec<(RingHandle, SocketAddr)>>,
}

impl Default for StaticPolicy {
    fn default() -> Self {
        Self {
            responsible: BTreeMap::new(),
            rejected_peers: BTreeSet::new(),
            rejected_addrs: BTreeSet::new(),
            routes: BTreeMap::new(),
            max_peers: DEFAULT_MAX_PEERS,
            reputation: Mutex::new(BTreeMap::new()),
            inserted: Mutex::new(Vec::new()),
        }
    }
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responsible_for(mut self, peer: impl Into<RingHandle>, key: &str) -> Self {
        self.responsible
            .entry(peer.into())
            .or_default()
            .insert(key.to_string());
        self
    }

    pub fn reject_peer(mut self, peer: impl Into<RingHandle>) -> Self {
        self.rejected_peers.insert(peer.into());
        self
    }

    pub fn reject_addr(mut self, addr: SocketAddr) -> Self {
        self.rejected_addrs.insert(addr);
        self
    }

    pub fn route(mut self, peer: impl Into<RingHandle>, hop: impl Into<RingHandle>) -> Self {
        self.routes.insert(peer.into(), hop.into());
        self
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Number of FOUND reports recorded for `peer`.
    pub fn reputation(&self, peer: &RingHandle) -> u32 {
        self.reputation
            .lock()
            .map(|rep| rep.get(peer).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Peers reported through [`RingPolicy::insert_peer`], in order.
    pub fn inserted(&self) -> Vec<(RingHandle, SocketAddr)> {
        self.inserted
            .lock()
            .map(|inserted| inserted.clone())
            .unwrap_or_default()
    }
}

impl RingPolicy for StaticPolicy {
    fn is_responsible(&self, peer: &RingHandle, key: &str) -> bool {
        self.responsible
            .get(peer)
            .is_some_and(|keys| keys.contains(key))
    }

    fn is_admissible(&self, peer: &RingHandle, addr: SocketAddr) -> bool {
        !self.rejected_peers.contains(peer) && !self.rejected_addrs.contains(&addr)
    }

    fn next_hop(&self, peer: &RingHandle, _key: &str) -> RingHandle {
        self.routes.get(peer).cloned().unwrap_or_else(|| peer.clone())
    }

    fn update_reputation(&self, peer: &RingHandle, _source: SocketAddr) {
        if let Ok(mut rep) = self.reputation.lock() {
            *rep.entry(peer.clone()).or_insert(0) += 1;
        }
    }

    fn insert_peer(&self, peer: &RingHandle, source: SocketAddr) {
        if let Ok(mut inserted) = self.inserted.lock() {
            inserted.push((peer.clone(), source));
        }
    }

    fn max_peers(&self) -> usize {
        self.max_peers
    }
}

//! Collaborator traits the protocol engine is written against.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`RingPolicy`] | Responsibility, admission, next hop, quota split |
//! | [`TableStore`] | Key/value storage behind READ_TABLE / WRITE_TABLE |
//!
//! The engine holds no ring algorithm of its own. Whatever concrete ring
//! implementation is plugged in answers these questions; the deterministic
//! [`StaticPolicy`](crate::policy::StaticPolicy) answers them in tests.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::identity::RingHandle;

/// Default peer-table capacity. Flood fan-out is bounded by this.
pub const DEFAULT_MAX_PEERS: usize = 64;

/// Ring-specific decisions consulted by the protocol engine.
///
/// Implementations must be deterministic for identical inputs; the engine's
/// replay and dedup guarantees assume it.
pub trait RingPolicy: Send + Sync + 'static {
    /// Whether `peer` is responsible for `key`.
    fn is_responsible(&self, peer: &RingHandle, key: &str) -> bool;

    /// Whether `peer` is a good deal for traffic involving `addr`.
    /// Used both for forwarding FIND and for JOIN/INVITE admission.
    fn is_admissible(&self, peer: &RingHandle, addr: SocketAddr) -> bool;

    /// Next hop on `peer`'s segment for `key`.
    fn next_hop(&self, peer: &RingHandle, key: &str) -> RingHandle;

    /// Split a replication quota across `peers`.
    fn split_quota(&self, mrr: i32, peers: &[RingHandle]) -> BTreeMap<RingHandle, i32> {
        split_evenly(mrr, peers)
    }

    /// Record that `source` reported a match on `peer`.
    fn update_reputation(&self, _peer: &RingHandle, _source: SocketAddr) {}

    /// Called after `peer` has been inserted into the peer table.
    fn insert_peer(&self, _peer: &RingHandle, _source: SocketAddr) {}

    /// Peer-table capacity.
    fn max_peers(&self) -> usize {
        DEFAULT_MAX_PEERS
    }
}

/// Storage collaborator for READ_TABLE / WRITE_TABLE.
pub trait TableStore: Send + 'static {
    fn read(&mut self, key: &str) -> Option<Vec<u8>>;

    /// Returns false if the value was refused.
    fn write(&mut self, key: &str, value: Vec<u8>) -> bool;
}

/// Every peer receives `floor(mrr / n)`; the remainder is dropped so the total
/// handed out never exceeds `mrr`. A negative quota yields zero shares.
pub fn split_evenly(mrr: i32, peers: &[RingHandle]) -> BTreeMap<RingHandle, i32> {
    if peers.is_empty() {
        return BTreeMap::new();
    }
    let share = mrr.max(0) / peers.len() as i32;
    peers.iter().map(|peer| (peer.clone(), share)).collect()
}

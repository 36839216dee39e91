//! # Lookup Ledger
//!
//! All mutable protocol state in one owned structure:
//!
//! | Part | Bound |
//! |------|-------|
//! | processed tags | LRU capacity + age (`tag_retention`) |
//! | peer table | caller-supplied capacity (see `RingPolicy::max_peers`) |
//! | lookup states | LRU capacity + per-state deadline |
//! | tag aliases | removed with the state they point at |
//!
//! The ledger itself is not synchronized. The bridge actor owns it, and every
//! mutation happens on that one task.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, trace};

use crate::identity::{LookupTag, RingHandle};
use crate::messages::OpCode;

/// Default number of processed tags remembered.
pub const DEFAULT_MAX_PROCESSED_TAGS: usize = 100_000;

/// Default number of in-flight lookup states.
pub const DEFAULT_MAX_LOOKUP_STATES: usize = 10_000;

/// Default age after which a processed tag is forgotten.
/// Must outlive any flood; a tag forgotten too early can be reprocessed.
pub const DEFAULT_TAG_RETENTION: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub last_contact: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same peer, same address: only `last_contact` moved.
    Refreshed,
    /// The peer is already known at another address; the entry was kept.
    Conflict,
    Full,
}

/// Progress of one ring branch of a locally originated lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Branch {
    Flooding,
    Exhausted,
    /// Received the remaining budget of an exhausted branch.
    Forwarded,
}

/// First match reported for a lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub net: RingHandle,
    pub source: SocketAddr,
}

#[derive(Clone, Debug)]
pub struct LookupState {
    pub code: OpCode,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub ttl: u32,
    pub mrr: i32,
    /// Reply-to address of the lookup.
    pub origin: SocketAddr,
    pub deadline: Instant,
    /// Non-empty only for lookups this node originated.
    pub branches: BTreeMap<RingHandle, Branch>,
    pub resolved: Option<Resolution>,
    /// Extra tags minted for this lookup (cross-ring forwards).
    pub aliases: Vec<LookupTag>,
}

impl LookupState {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn flooding_branch_except(&self, exhausted: &RingHandle) -> Option<RingHandle> {
        self.branches
            .iter()
            .find(|(net, branch)| *net != exhausted && **branch == Branch::Flooding)
            .map(|(net, _)| net.clone())
    }

    pub fn all_exhausted(&self) -> bool {
        !self.branches.is_empty() && self.branches.values().all(|b| *b == Branch::Exhausted)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub processed_tags: usize,
    pub peers: usize,
    pub lookup_states: usize,
}

pub struct Ledger {
    processed: LruCache<LookupTag, Instant>,
    peers: BTreeMap<RingHandle, PeerEntry>,
    states: LruCache<LookupTag, LookupState>,
    /// alias → primary tag
    aliases: HashMap<LookupTag, LookupTag>,
    tag_retention: Duration,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_PROCESSED_TAGS,
            DEFAULT_MAX_LOOKUP_STATES,
            DEFAULT_TAG_RETENTION,
        )
    }
}

impl Ledger {
    pub fn new(max_processed_tags: usize, max_lookup_states: usize, tag_retention: Duration) -> Self {
        let tags_cap = NonZeroUsize::new(max_processed_tags).unwrap_or(NonZeroUsize::MIN);
        let states_cap = NonZeroUsize::new(max_lookup_states).unwrap_or(NonZeroUsize::MIN);
        Self {
            processed: LruCache::new(tags_cap),
            peers: BTreeMap::new(),
            states: LruCache::new(states_cap),
            aliases: HashMap::new(),
            tag_retention,
        }
    }

    // ------------------------------------------------------------------
    // Processed tags
    // ------------------------------------------------------------------

    /// Returns false if the tag was already recorded.
    pub fn record_tag(&mut self, tag: LookupTag, now: Instant) -> bool {
        if self.processed.contains(&tag) {
            return false;
        }
        self.processed.put(tag, now);
        true
    }

    pub fn is_processed(&self, tag: &LookupTag) -> bool {
        self.processed.contains(tag)
    }

    // ------------------------------------------------------------------
    // Peer table
    // ------------------------------------------------------------------

    /// Admission-path insert. Never replaces an entry that points elsewhere.
    pub fn insert_peer(
        &mut self,
        net: RingHandle,
        addr: SocketAddr,
        now: Instant,
        capacity: usize,
    ) -> InsertOutcome {
        if let Some(entry) = self.peers.get_mut(&net) {
            if entry.addr == addr {
                entry.last_contact = now;
                return InsertOutcome::Refreshed;
            }
            return InsertOutcome::Conflict;
        }
        if self.peers.len() >= capacity {
            return InsertOutcome::Full;
        }
        self.peers.insert(net, PeerEntry { addr, last_contact: now });
        InsertOutcome::Inserted
    }

    /// Explicit configuration. Replaces any previous address for `net`.
    pub fn configure_peer(&mut self, net: RingHandle, addr: SocketAddr, now: Instant) {
        self.peers.insert(net, PeerEntry { addr, last_contact: now });
    }

    /// Sorted snapshot of known peers.
    pub fn peers(&self) -> Vec<RingHandle> {
        self.peers.keys().cloned().collect()
    }

    pub fn peer_entries(&self) -> Vec<(RingHandle, PeerEntry)> {
        self.peers.iter().map(|(net, entry)| (net.clone(), *entry)).collect()
    }

    pub fn address_of(&self, net: &RingHandle) -> Option<SocketAddr> {
        self.peers.get(net).map(|entry| entry.addr)
    }

    /// First peer (in table order) reachable at `addr`.
    pub fn peer_at(&self, addr: SocketAddr) -> Option<RingHandle> {
        self.peers
            .iter()
            .find(|(_, entry)| entry.addr == addr)
            .map(|(net, _)| net.clone())
    }

    /// Refresh `last_contact` of every peer reachable at `addr`.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) {
        for entry in self.peers.values_mut().filter(|entry| entry.addr == addr) {
            entry.last_contact = now;
        }
    }

    // ------------------------------------------------------------------
    // Lookup state
    // ------------------------------------------------------------------

    /// Returns the state pushed out when the table is at capacity.
    pub fn insert_state(
        &mut self,
        tag: LookupTag,
        state: LookupState,
    ) -> Option<(LookupTag, LookupState)> {
        match self.states.push(tag, state) {
            Some((evicted, state)) if evicted != tag => {
                debug!(tag = %evicted, "lookup state evicted at capacity");
                self.forget_aliases(&state);
                Some((evicted, state))
            }
            _ => None,
        }
    }

    pub fn state(&self, tag: &LookupTag) -> Option<&LookupState> {
        self.states.peek(tag)
    }

    pub fn state_mut(&mut self, tag: &LookupTag) -> Option<&mut LookupState> {
        self.states.peek_mut(tag)
    }

    pub fn remove_state(&mut self, tag: &LookupTag) -> Option<LookupState> {
        let state = self.states.pop(tag)?;
        self.forget_aliases(&state);
        Some(state)
    }

    /// Let `alias` stand for the lookup stored under `primary`.
    /// Returns false if there is no such lookup.
    pub fn add_alias(&mut self, alias: LookupTag, primary: LookupTag) -> bool {
        let Some(state) = self.states.peek_mut(&primary) else {
            return false;
        };
        state.aliases.push(alias);
        self.aliases.insert(alias, primary);
        true
    }

    /// Primary tag of the lookup `tag` belongs to; `tag` itself if it is not an alias.
    pub fn primary_tag(&self, tag: &LookupTag) -> LookupTag {
        self.aliases.get(tag).copied().unwrap_or(*tag)
    }

    fn forget_aliases(&mut self, state: &LookupState) {
        for alias in &state.aliases {
            self.aliases.remove(alias);
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Forget old tags and return lookup states whose deadline has passed.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<(LookupTag, LookupState)> {
        let retention = self.tag_retention;
        let stale_tags: Vec<LookupTag> = self
            .processed
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= retention)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in &stale_tags {
            self.processed.pop(tag);
        }

        let expired_tags: Vec<LookupTag> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_expired(now))
            .map(|(tag, _)| *tag)
            .collect();
        let expired: Vec<(LookupTag, LookupState)> = expired_tags
            .into_iter()
            .filter_map(|tag| self.remove_state(&tag).map(|state| (tag, state)))
            .collect();

        if !stale_tags.is_empty() || !expired.is_empty() {
            trace!(
                tags = stale_tags.len(),
                states = expired.len(),
                "ledger sweep"
            );
        }
        expired
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            processed_tags: self.processed.len(),
            peers: self.peers.len(),
            lookup_states: self.states.len(),
        }
    }
}

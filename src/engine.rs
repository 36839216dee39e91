//! # Protocol Engine
//!
//! Flood search, replication and admission for one node. The engine is
//! synchronous and performs no I/O: handlers read and update the
//! [`Ledger`], consult the [`RingPolicy`], and queue outbound messages in an
//! [`Outbox`] that the caller drains onto the transport.
//!
//! ## FIND handling
//!
//! 1. `ttl == 0` or an already processed tag: dropped, nothing recorded
//! 2. the tag is recorded and the quota is split over the peer table
//! 3. for each peer in order: responsible → FOUND to `reply_to`; otherwise,
//!    if admissible and `ttl > 1` → FIND with `ttl - 1` and the peer's share
//!    to its next hop
//! 4. a node that neither answered nor forwarded reports NOT_FOUND, carrying
//!    the hop budget it could not use (0 once `ttl` reached 1)
//!
//! The processed-tag check makes handling idempotent under duplication and
//! reordering, which is the only loop prevention a flood topology has.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::identity::{LookupTag, NodeIdentity, RingHandle};
use crate::ledger::{
    Branch, InsertOutcome, Ledger, LookupState, DEFAULT_MAX_LOOKUP_STATES,
    DEFAULT_MAX_PROCESSED_TAGS, DEFAULT_TAG_RETENTION,
};
use crate::messages::{Find, Found, Message, NotFound, OpCode, ReadTable, TableValue, WriteTable};
use crate::protocols::{RingPolicy, TableStore};

/// Default lifetime of a lookup state before the sweep reclaims it.
pub const DEFAULT_STATE_LIFETIME: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Send NOT_FOUND to `reply_to` when a FIND reaches a node that can neither
    /// answer nor forward it.
    pub notify_dead_ends: bool,
    pub state_lifetime: Duration,
    pub tag_retention: Duration,
    pub max_processed_tags: usize,
    pub max_lookup_states: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notify_dead_ends: true,
            state_lifetime: DEFAULT_STATE_LIFETIME,
            tag_retention: DEFAULT_TAG_RETENTION,
            max_processed_tags: DEFAULT_MAX_PROCESSED_TAGS,
            max_lookup_states: DEFAULT_MAX_LOOKUP_STATES,
        }
    }
}

/// Outbound messages produced by one or more handler calls.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<(SocketAddr, Message)>,
}

impl Outbox {
    pub fn send(&mut self, to: SocketAddr, message: Message) {
        trace!(to = %to, kind = message.kind(), "queue");
        self.queue.push_back((to, message));
    }

    pub fn pop(&mut self) -> Option<(SocketAddr, Message)> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SocketAddr, Message)> {
        self.queue.iter()
    }
}

/// Peers a flood step answered for or forwarded to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FloodReport {
    pub found: Vec<RingHandle>,
    pub forwarded: Vec<RingHandle>,
}

impl FloodReport {
    pub fn is_dead_end(&self) -> bool {
        self.found.is_empty() && self.forwarded.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindDisposition {
    /// Arrived with no hops left.
    Expired,
    /// Tag already processed here.
    Replayed,
    Flooded(FloodReport),
}

pub struct Engine<P: RingPolicy, S: TableStore> {
    identity: NodeIdentity,
    policy: Arc<P>,
    store: S,
    ledger: Ledger,
    config: EngineConfig,
    evicted: Vec<(LookupTag, LookupState)>,
}

impl<P: RingPolicy, S: TableStore> Engine<P, S> {
    pub fn new(identity: NodeIdentity, policy: Arc<P>, store: S, config: EngineConfig) -> Self {
        let ledger = Ledger::new(
            config.max_processed_tags,
            config.max_lookup_states,
            config.tag_retention,
        );
        Self {
            identity,
            policy,
            store,
            ledger,
            config,
            evicted: Vec::new(),
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    /// Locally originated lookup states pushed out of the ledger at capacity
    /// since the last call. Callers that originate lookups drain this after
    /// every handler call.
    pub fn take_evicted(&mut self) -> Vec<(LookupTag, LookupState)> {
        std::mem::take(&mut self.evicted)
    }

    pub fn handle_find(&mut self, find: Find, outbox: &mut Outbox, now: Instant) -> FindDisposition {
        if find.ttl == 0 {
            debug!(tag = %find.tag, key = %find.key, "FIND dropped: ttl exhausted");
            return FindDisposition::Expired;
        }
        if !self.ledger.record_tag(find.tag, now) {
            debug!(tag = %find.tag, "FIND dropped: tag already processed");
            return FindDisposition::Replayed;
        }

        self.track(&find, now);
        let report = self.flood(&find, outbox);

        if report.is_dead_end() && self.config.notify_dead_ends {
            let remaining = if find.ttl > 1 { find.ttl } else { 0 };
            debug!(tag = %find.tag, ttl = remaining, "dead end, reporting NOT_FOUND");
            outbox.send(
                find.reply_to,
                Message::NotFound(NotFound {
                    code: find.code,
                    ttl: remaining,
                    mrr: find.mrr,
                    tag: find.tag,
                    key: find.key.clone(),
                    value: find.value.clone(),
                }),
            );
            self.ledger.remove_state(&find.tag);
        }
        FindDisposition::Flooded(report)
    }

    /// Start a lookup from this node. Every peer a FIND was sent to becomes a
    /// branch of the resulting lookup state.
    pub fn originate(
        &mut self,
        find: Find,
        deadline: Instant,
        outbox: &mut Outbox,
        now: Instant,
    ) -> FloodReport {
        self.ledger.record_tag(find.tag, now);
        let report = self.flood(&find, outbox);

        let mut state = self.state_for(&find, now);
        state.deadline = deadline;
        state.branches = report
            .forwarded
            .iter()
            .map(|net| (net.clone(), Branch::Flooding))
            .collect();
        if let Some(evicted) = self.ledger.insert_state(find.tag, state) {
            self.note_evicted(evicted);
        }
        report
    }

    pub fn handle_found(&mut self, found: &Found, outbox: &mut Outbox) {
        self.policy.update_reputation(&found.net, found.source);

        match found.code {
            OpCode::Get => {
                outbox.send(
                    found.source,
                    Message::ReadTable(ReadTable {
                        net: found.net.clone(),
                        key: found.key.clone(),
                        tag: found.tag,
                        source: self.identity.addr(),
                    }),
                );
            }
            OpCode::Put if found.mrr < 0 => {
                info!(tag = %found.tag, net = %found.net, mrr = found.mrr, "stopping replication: quota exhausted");
            }
            OpCode::Put => {
                outbox.send(
                    found.source,
                    Message::WriteTable(WriteTable {
                        net: found.net.clone(),
                        key: found.key.clone(),
                        value: found.value.clone(),
                        tag: found.tag,
                        source: self.identity.addr(),
                    }),
                );
            }
        }
    }

    /// Returns true if a JOIN was sent back.
    pub fn handle_invite(&mut self, net: RingHandle, source: SocketAddr, outbox: &mut Outbox) -> bool {
        if !self.policy.is_admissible(&net, source) {
            debug!(net = %net, source = %source, "INVITE declined");
            return false;
        }
        outbox.send(
            source,
            Message::Join {
                net,
                source: self.identity.addr(),
            },
        );
        true
    }

    /// `None` when the policy refused admission.
    pub fn handle_join(&mut self, net: RingHandle, source: SocketAddr, now: Instant) -> Option<InsertOutcome> {
        if !self.policy.is_admissible(&net, source) {
            debug!(net = %net, source = %source, "JOIN refused");
            return None;
        }
        let outcome = self
            .ledger
            .insert_peer(net.clone(), source, now, self.policy.max_peers());
        match outcome {
            InsertOutcome::Inserted => {
                info!(net = %net, addr = %source, "peer joined");
                self.policy.insert_peer(&net, source);
            }
            InsertOutcome::Refreshed => trace!(net = %net, "peer refreshed"),
            InsertOutcome::Conflict => {
                debug!(net = %net, addr = %source, "JOIN ignored: peer known at another address")
            }
            InsertOutcome::Full => debug!(net = %net, "JOIN ignored: peer table full"),
        }
        Some(outcome)
    }

    pub fn handle_read_table(&mut self, request: ReadTable, outbox: &mut Outbox) {
        let value = self.store.read(&request.key);
        trace!(key = %request.key, hit = value.is_some(), "READ_TABLE");
        outbox.send(
            request.source,
            Message::TableValue(TableValue {
                net: request.net,
                key: request.key,
                value,
                tag: request.tag,
            }),
        );
    }

    pub fn handle_write_table(&mut self, request: WriteTable) -> bool {
        let Some(value) = request.value else {
            debug!(key = %request.key, "WRITE_TABLE without value ignored");
            return false;
        };
        let len = value.len();
        let written = self.store.write(&request.key, value);
        debug!(key = %request.key, len, written, "WRITE_TABLE");
        written
    }

    /// Hand the budget left by an exhausted branch to `into`.
    ///
    /// The ring behind `into` has already processed the lookup's own tag
    /// during the seed flood, so the FIND goes out under `tag`, a fresh tag
    /// the caller correlates back to the lookup.
    pub fn forward_into(
        &mut self,
        not_found: &NotFound,
        into: &RingHandle,
        tag: LookupTag,
        outbox: &mut Outbox,
        now: Instant,
    ) -> bool {
        if not_found.ttl == 0 || not_found.mrr < 0 {
            return false;
        }
        let hop = self.policy.next_hop(into, &not_found.key);
        let Some(addr) = self.ledger.address_of(&hop) else {
            debug!(net = %into, hop = %hop, "cannot forward: next hop has no address");
            return false;
        };
        self.ledger.record_tag(tag, now);
        debug!(
            tag = %not_found.tag,
            forward_tag = %tag,
            into = %into,
            ttl = not_found.ttl - 1,
            "forwarding remaining budget"
        );
        outbox.send(
            addr,
            Message::Find(Find {
                code: not_found.code,
                ttl: not_found.ttl - 1,
                mrr: not_found.mrr,
                tag,
                key: not_found.key.clone(),
                value: not_found.value.clone(),
                reply_to: self.identity.addr(),
            }),
        );
        true
    }

    fn flood(&mut self, find: &Find, outbox: &mut Outbox) -> FloodReport {
        let peers = self.ledger.peers();
        let shares = self.policy.split_quota(find.mrr, &peers);
        let mut report = FloodReport::default();

        for peer in &peers {
            let share = shares.get(peer).copied().unwrap_or(0).max(0);

            if self.policy.is_responsible(peer, &find.key) {
                outbox.send(
                    find.reply_to,
                    Message::Found(Found {
                        code: find.code,
                        net: peer.clone(),
                        mrr: share,
                        key: find.key.clone(),
                        value: find.value.clone(),
                        tag: find.tag,
                        source: self.identity.addr(),
                    }),
                );
                report.found.push(peer.clone());
            } else if find.ttl <= 1 {
                trace!(peer = %peer, "hop budget spent, not forwarding");
            } else if self.policy.is_admissible(peer, find.reply_to) {
                let hop = self.policy.next_hop(peer, &find.key);
                let Some(addr) = self.ledger.address_of(&hop) else {
                    debug!(peer = %peer, hop = %hop, "branch dropped: next hop has no address");
                    continue;
                };
                outbox.send(
                    addr,
                    Message::Find(Find {
                        ttl: find.ttl - 1,
                        mrr: share,
                        ..find.clone()
                    }),
                );
                report.forwarded.push(peer.clone());
            } else {
                trace!(peer = %peer, "peer not admissible for this lookup");
            }
        }

        debug!(
            tag = %find.tag,
            ttl = find.ttl,
            found = report.found.len(),
            forwarded = report.forwarded.len(),
            "flood step"
        );
        report
    }

    fn track(&mut self, find: &Find, now: Instant) {
        if self.ledger.state(&find.tag).is_some() {
            return;
        }
        let state = self.state_for(find, now);
        if let Some(evicted) = self.ledger.insert_state(find.tag, state) {
            self.note_evicted(evicted);
        }
    }

    /// Only lookups this node started have someone waiting on them. The
    /// backlog is capped at the state capacity when nobody drains it.
    fn note_evicted(&mut self, evicted: (LookupTag, LookupState)) {
        if evicted.0.origin != self.identity.addr() {
            return;
        }
        if self.evicted.len() >= self.config.max_lookup_states.max(1) {
            self.evicted.remove(0);
        }
        self.evicted.push(evicted);
    }

    fn state_for(&self, find: &Find, now: Instant) -> LookupState {
        LookupState {
            code: find.code,
            key: find.key.clone(),
            value: find.value.clone(),
            ttl: find.ttl,
            mrr: find.mrr,
            origin: find.reply_to,
            deadline: now + self.config.state_lifetime,
            branches: Default::default(),
            resolved: None,
            aliases: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::StaticPolicy;
    use crate::store::MemoryStore;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    const SELF_PORT: u16 = 4000;
    const ORIGIN_PORT: u16 = 4100;
    const P1_PORT: u16 = 5001;
    const P2_PORT: u16 = 5002;

    fn engine(policy: StaticPolicy) -> Engine<StaticPolicy, MemoryStore> {
        let mut engine = Engine::new(
            NodeIdentity::new(addr(SELF_PORT)),
            Arc::new(policy),
            MemoryStore::new(),
            EngineConfig::default(),
        );
        let now = Instant::now();
        engine.ledger_mut().configure_peer("p1".into(), addr(P1_PORT), now);
        engine.ledger_mut().configure_peer("p2".into(), addr(P2_PORT), now);
        engine
    }

    fn tag(seq: u64) -> LookupTag {
        LookupTag {
            origin: addr(ORIGIN_PORT),
            timestamp_ms: 0,
            seq,
        }
    }

    fn find(code: OpCode, ttl: u32, mrr: i32, seq: u64) -> Find {
        Find {
            code,
            ttl,
            mrr,
            tag: tag(seq),
            key: "k1".to_string(),
            value: None,
            reply_to: addr(ORIGIN_PORT),
        }
    }

    fn drain(outbox: &mut Outbox) -> Vec<(SocketAddr, Message)> {
        std::iter::from_fn(|| outbox.pop()).collect()
    }

    #[test]
    fn responsible_peer_answers_found() {
        let mut engine = engine(StaticPolicy::new().responsible_for("p1", "k1"));
        let mut outbox = Outbox::default();

        engine.handle_find(find(OpCode::Get, 5, 4, 1), &mut outbox, Instant::now());
        let sent = drain(&mut outbox);

        let founds: Vec<_> = sent
            .iter()
            .filter_map(|(to, m)| match m {
                Message::Found(f) => Some((*to, f.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(founds.len(), 1);
        let (to, found) = &founds[0];
        assert_eq!(*to, addr(ORIGIN_PORT));
        assert_eq!(found.net, RingHandle::new("p1"));
        assert_eq!(found.mrr, 2);
        assert_eq!(found.key, "k1");
        assert_eq!(found.source, addr(SELF_PORT));

        // p2 gets exactly the one flood-step FIND.
        let finds: Vec<_> = sent
            .iter()
            .filter(|(_, m)| matches!(m, Message::Find(_)))
            .collect();
        assert_eq!(finds.len(), 1);
        assert_eq!(finds[0].0, addr(P2_PORT));
    }

    #[test]
    fn forwarded_find_decrements_ttl_and_carries_share() {
        let mut engine = engine(StaticPolicy::new());
        let mut outbox = Outbox::default();

        engine.handle_find(find(OpCode::Get, 5, 3, 1), &mut outbox, Instant::now());
        let sent = drain(&mut outbox);

        assert_eq!(sent.len(), 2);
        for (to, message) in &sent {
            let Message::Find(f) = message else {
                panic!("unexpected {message:?}");
            };
            assert!(*to == addr(P1_PORT) || *to == addr(P2_PORT));
            assert_eq!(f.ttl, 4);
            assert_eq!(f.mrr, 1);
            assert_eq!(f.tag, tag(1));
            assert_eq!(f.reply_to, addr(ORIGIN_PORT));
        }
    }

    #[test]
    fn ttl_zero_is_silent_and_unrecorded() {
        let mut engine = engine(StaticPolicy::new().responsible_for("p1", "k1"));
        let mut outbox = Outbox::default();

        let disposition = engine.handle_find(find(OpCode::Get, 0, 3, 1), &mut outbox, Instant::now());
        assert_eq!(disposition, FindDisposition::Expired);
        assert!(outbox.is_empty());
        assert!(!engine.ledger().is_processed(&tag(1)));
        assert!(engine.ledger().state(&tag(1)).is_none());
    }

    #[test]
    fn duplicate_tag_is_a_noop() {
        let mut engine = engine(StaticPolicy::new());
        let mut outbox = Outbox::default();
        let now = Instant::now();

        engine.handle_find(find(OpCode::Get, 5, 3, 1), &mut outbox, now);
        let first = drain(&mut outbox);
        assert!(!first.is_empty());
        let stats_before = engine.ledger().stats();

        let disposition = engine.handle_find(find(OpCode::Get, 5, 3, 1), &mut outbox, now);
        assert_eq!(disposition, FindDisposition::Replayed);
        assert!(outbox.is_empty());
        assert_eq!(engine.ledger().stats(), stats_before);
    }

    #[test]
    fn ttl_one_reports_not_found_instead_of_forwarding() {
        let mut engine = engine(StaticPolicy::new());
        let mut outbox = Outbox::default();

        engine.handle_find(find(OpCode::Get, 1, 2, 1), &mut outbox, Instant::now());
        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        let (to, Message::NotFound(nf)) = &sent[0] else {
            panic!("expected NOT_FOUND, got {sent:?}");
        };
        assert_eq!(*to, addr(ORIGIN_PORT));
        assert_eq!(nf.ttl, 0);
        assert_eq!(nf.mrr, 2);
    }

    #[test]
    fn ttl_one_still_answers_for_responsible_peers() {
        let mut engine = engine(StaticPolicy::new().responsible_for("p2", "k1"));
        let mut outbox = Outbox::default();

        engine.handle_find(find(OpCode::Get, 1, 2, 1), &mut outbox, Instant::now());
        let sent = drain(&mut outbox);
        assert!(matches!(
            &sent[..],
            [(to, Message::Found(f))] if *to == addr(ORIGIN_PORT) && f.net == RingHandle::new("p2")
        ));
    }

    fn engine_without_peers_at(port: u16) -> Engine<StaticPolicy, MemoryStore> {
        Engine::new(
            NodeIdentity::new(addr(port)),
            Arc::new(StaticPolicy::new()),
            MemoryStore::new(),
            EngineConfig::default(),
        )
    }

    #[test]
    fn ttl_strictly_decreases_along_a_chain() {
        // Three nodes in a line: a -> b -> c, each knowing only the next one.
        let now = Instant::now();
        let mut nodes: Vec<_> = (0..3u16).map(|i| engine_without_peers_at(6000 + i)).collect();
        for i in 0..2usize {
            let next = format!("n{}", i + 1);
            nodes[i]
                .ledger_mut()
                .configure_peer(next.as_str().into(), addr(6001 + i as u16), now);
        }

        let mut message = find(OpCode::Get, 5, 3, 9);
        let mut ttls = vec![message.ttl];
        for node in nodes.iter_mut().take(2) {
            let mut outbox = Outbox::default();
            node.handle_find(message.clone(), &mut outbox, now);
            let Some((_, Message::Find(next))) = outbox.pop() else {
                panic!("expected a forwarded FIND");
            };
            ttls.push(next.ttl);
            message = next;
        }
        assert_eq!(ttls, vec![5, 4, 3]);
    }

    #[test]
    fn dead_end_reports_not_found() {
        let mut engine = engine_without_peers_at(SELF_PORT);
        let mut outbox = Outbox::default();

        engine.handle_find(find(OpCode::Get, 3, 2, 1), &mut outbox, Instant::now());
        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        let (to, Message::NotFound(nf)) = &sent[0] else {
            panic!("expected NOT_FOUND");
        };
        assert_eq!(*to, addr(ORIGIN_PORT));
        assert_eq!(nf.ttl, 3);
        assert_eq!(nf.mrr, 2);
        assert_eq!(nf.tag, tag(1));
        assert!(engine.ledger().state(&tag(1)).is_none());
        assert!(engine.ledger().is_processed(&tag(1)));
    }

    #[test]
    fn dead_end_silent_when_disabled() {
        let mut engine = Engine::new(
            NodeIdentity::new(addr(SELF_PORT)),
            Arc::new(StaticPolicy::new()),
            MemoryStore::new(),
            EngineConfig {
                notify_dead_ends: false,
                ..EngineConfig::default()
            },
        );
        let mut outbox = Outbox::default();
        engine.handle_find(find(OpCode::Get, 3, 2, 1), &mut outbox, Instant::now());
        assert!(outbox.is_empty());
    }

    #[test]
    fn inadmissible_peers_are_skipped() {
        let mut engine = engine(StaticPolicy::new().reject_peer("p2"));
        let mut outbox = Outbox::default();

        let disposition = engine.handle_find(find(OpCode::Get, 5, 4, 1), &mut outbox, Instant::now());
        let FindDisposition::Flooded(report) = disposition else {
            panic!("expected flood");
        };
        assert_eq!(report.forwarded, vec![RingHandle::new("p1")]);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn next_hop_without_address_drops_branch() {
        let mut engine = engine(StaticPolicy::new().route("p1", "nowhere"));
        let mut outbox = Outbox::default();

        engine.handle_find(find(OpCode::Get, 5, 4, 1), &mut outbox, Instant::now());
        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(P2_PORT));
    }

    #[test]
    fn routed_next_hop_resolves_through_table() {
        let mut engine = engine(StaticPolicy::new().route("p1", "p2"));
        let mut outbox = Outbox::default();

        engine.handle_find(find(OpCode::Get, 5, 4, 1), &mut outbox, Instant::now());
        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(to, _)| *to == addr(P2_PORT)));
    }

    fn found(code: OpCode, mrr: i32) -> Found {
        Found {
            code,
            net: "p1".into(),
            mrr,
            key: "k1".to_string(),
            value: Some(b"v".to_vec()),
            tag: tag(1),
            source: addr(7000),
        }
    }

    #[test]
    fn found_get_requests_table_read() {
        let policy = StaticPolicy::new();
        let mut engine = engine(policy);
        let mut outbox = Outbox::default();

        engine.handle_found(&found(OpCode::Get, 1), &mut outbox);
        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(7000));
        assert!(matches!(&sent[0].1, Message::ReadTable(r) if r.key == "k1" && r.source == addr(SELF_PORT)));
        assert_eq!(engine.policy().reputation(&"p1".into()), 1);
    }

    #[test]
    fn found_put_replicates_only_with_quota() {
        let mut engine = engine(StaticPolicy::new());
        let mut outbox = Outbox::default();

        engine.handle_found(&found(OpCode::Put, -1), &mut outbox);
        assert!(outbox.is_empty());

        engine.handle_found(&found(OpCode::Put, 0), &mut outbox);
        let sent = drain(&mut outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(7000));
        assert!(matches!(&sent[0].1, Message::WriteTable(w) if w.value == Some(b"v".to_vec())));
    }

    #[test]
    fn join_inserts_only_when_admissible() {
        let mut engine = engine_without_peers_at(SELF_PORT);
        let now = Instant::now();
        assert_eq!(
            engine.handle_join("ring-c".into(), addr(8000), now),
            Some(InsertOutcome::Inserted)
        );
        assert_eq!(engine.ledger().address_of(&"ring-c".into()), Some(addr(8000)));
        assert_eq!(engine.policy().inserted(), vec![(RingHandle::new("ring-c"), addr(8000))]);

        let mut strict = Engine::new(
            NodeIdentity::new(addr(SELF_PORT)),
            Arc::new(StaticPolicy::new().reject_addr(addr(8000))),
            MemoryStore::new(),
            EngineConfig::default(),
        );
        assert_eq!(strict.handle_join("ring-c".into(), addr(8000), now), None);
        assert!(strict.ledger().peers().is_empty());
    }

    #[test]
    fn join_respects_policy_capacity() {
        let mut engine = Engine::new(
            NodeIdentity::new(addr(SELF_PORT)),
            Arc::new(StaticPolicy::new().with_max_peers(1)),
            MemoryStore::new(),
            EngineConfig::default(),
        );
        let now = Instant::now();
        assert_eq!(engine.handle_join("a".into(), addr(1), now), Some(InsertOutcome::Inserted));
        assert_eq!(engine.handle_join("b".into(), addr(2), now), Some(InsertOutcome::Full));
    }

    #[test]
    fn invite_answered_with_join() {
        let mut engine = engine(StaticPolicy::new().reject_peer("bad"));
        let mut outbox = Outbox::default();

        assert!(!engine.handle_invite("bad".into(), addr(9000), &mut outbox));
        assert!(outbox.is_empty());

        assert!(engine.handle_invite("ring-c".into(), addr(9000), &mut outbox));
        let sent = drain(&mut outbox);
        assert_eq!(
            sent,
            vec![(
                addr(9000),
                Message::Join {
                    net: "ring-c".into(),
                    source: addr(SELF_PORT)
                }
            )]
        );
    }

    #[test]
    fn table_read_and_write_use_store() {
        let mut engine = engine(StaticPolicy::new());
        let mut outbox = Outbox::default();

        assert!(engine.handle_write_table(WriteTable {
            net: "p1".into(),
            key: "k1".to_string(),
            value: Some(b"stored".to_vec()),
            tag: tag(1),
            source: addr(7000),
        }));
        assert!(!engine.handle_write_table(WriteTable {
            net: "p1".into(),
            key: "k2".to_string(),
            value: None,
            tag: tag(1),
            source: addr(7000),
        }));

        engine.handle_read_table(
            ReadTable {
                net: "p1".into(),
                key: "k1".to_string(),
                tag: tag(1),
                source: addr(7000),
            },
            &mut outbox,
        );
        let sent = drain(&mut outbox);
        assert!(matches!(
            &sent[..],
            [(to, Message::TableValue(v))] if *to == addr(7000) && v.value == Some(b"stored".to_vec())
        ));
    }

    #[test]
    fn originate_records_branches() {
        let mut engine = engine(StaticPolicy::new());
        let mut outbox = Outbox::default();
        let mut seed = find(OpCode::Get, 5, 3, 1);
        seed.reply_to = addr(SELF_PORT);

        let now = Instant::now();
        let report = engine.originate(seed, now + Duration::from_secs(5), &mut outbox, now);
        assert_eq!(report.forwarded.len(), 2);
        let state = engine.ledger().state(&tag(1)).unwrap();
        assert_eq!(state.branches.len(), 2);
        assert!(state.branches.values().all(|b| *b == Branch::Flooding));
        assert!(engine.ledger().is_processed(&tag(1)));
    }

    #[test]
    fn forward_into_requires_budget() {
        let mut engine = engine(StaticPolicy::new());
        let mut outbox = Outbox::default();
        let mut nf = NotFound {
            code: OpCode::Get,
            ttl: 0,
            mrr: 1,
            tag: tag(1),
            key: "k1".to_string(),
            value: None,
        };
        let now = Instant::now();
        assert!(!engine.forward_into(&nf, &"p2".into(), tag(2), &mut outbox, now));

        nf.ttl = 3;
        nf.mrr = -1;
        assert!(!engine.forward_into(&nf, &"p2".into(), tag(2), &mut outbox, now));

        nf.mrr = 1;
        assert!(engine.forward_into(&nf, &"p2".into(), tag(2), &mut outbox, now));
        let sent = drain(&mut outbox);
        assert!(matches!(
            &sent[..],
            [(to, Message::Find(f))]
                if *to == addr(P2_PORT) && f.ttl == 2 && f.tag == tag(2) && f.reply_to == addr(SELF_PORT)
        ));
        assert!(engine.ledger().is_processed(&tag(2)));
    }

    #[test]
    fn forwarded_find_floods_where_seed_was_seen() {
        let now = Instant::now();
        let mut bridge = engine(StaticPolicy::new());
        let mut entry = engine_without_peers_at(P2_PORT);
        entry
            .ledger_mut()
            .configure_peer("b2".into(), addr(5100), now);

        // The seed flood reaches the entry first.
        let mut outbox = Outbox::default();
        let seed = find(OpCode::Get, 4, 1, 1);
        assert!(matches!(
            entry.handle_find(seed, &mut outbox, now),
            FindDisposition::Flooded(_)
        ));

        let nf = NotFound {
            code: OpCode::Get,
            ttl: 3,
            mrr: 1,
            tag: tag(1),
            key: "k1".to_string(),
            value: None,
        };
        let mut out = Outbox::default();
        assert!(bridge.forward_into(&nf, &"p2".into(), tag(2), &mut out, now));
        let Some((_, Message::Find(forwarded))) = out.pop() else {
            panic!("expected a FIND");
        };

        let mut entry_out = Outbox::default();
        let disposition = entry.handle_find(forwarded, &mut entry_out, now);
        assert_eq!(
            disposition,
            FindDisposition::Flooded(FloodReport {
                found: vec![],
                forwarded: vec![RingHandle::new("b2")],
            })
        );
        assert!(matches!(entry_out.pop(), Some((to, Message::Find(f))) if to == addr(5100) && f.ttl == 1));
    }

    #[test]
    fn only_local_evictions_are_kept_and_bounded() {
        let mut engine = Engine::new(
            NodeIdentity::new(addr(SELF_PORT)),
            Arc::new(StaticPolicy::new()),
            MemoryStore::new(),
            EngineConfig {
                max_lookup_states: 2,
                ..EngineConfig::default()
            },
        );
        let now = Instant::now();
        let mut outbox = Outbox::default();

        // Relayed lookups: evicted, but nobody waits on them.
        for seq in 0..5 {
            engine.handle_find(find(OpCode::Get, 3, 1, seq), &mut outbox, now);
        }
        assert!(engine.take_evicted().is_empty());

        for seq in 0..6 {
            let mut local = find(OpCode::Get, 3, 1, seq);
            local.tag.origin = addr(SELF_PORT);
            local.reply_to = addr(SELF_PORT);
            engine.originate(local, now + Duration::from_secs(5), &mut outbox, now);
        }
        let evicted = engine.take_evicted();
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|(t, _)| t.origin == addr(SELF_PORT)));
        assert!(engine.take_evicted().is_empty());
    }
}

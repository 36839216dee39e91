//! # Bridge Node
//!
//! A node whose peer table holds an entry point into each of two rings, so
//! that a lookup started here floods both of them.
//!
//! ## Architecture
//!
//! ```text
//! BridgeNode (handle) ──Command──▶ BridgeActor ──Outbox──▶ Transport
//!                                      ▲    │
//!        receive loop ──Inbound────────┘    └──loopback (to == self)
//! ```
//!
//! The actor owns the [`Engine`] and with it the ledger; every mutation runs on
//! the actor task. Messages the engine addresses to this node are dispatched
//! in process instead of going through the socket.
//!
//! ## Lookup lifecycle
//!
//! Every peer that received a seed FIND is a branch. A NOT_FOUND from a branch
//! exhausts it and, if budget is left, hands that budget to a branch that is
//! still flooding. The hand-over FIND carries a fresh tag, since the other
//! ring already processed the seed; replies to it are mapped back to the
//! lookup through the ledger. The first FOUND wins:
//!
//! - GET sends READ_TABLE and completes on TABLE_VALUE (or with no value at the
//!   deadline)
//! - PUT completes at once, and later FOUNDs keep replicating
//!
//! A lookup that is neither found nor exhausted by its deadline times out.
//!
//! [`BridgeNode::stop`] signals both tasks and waits for them, so the socket
//! is released by the time it returns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{Engine, EngineConfig, Outbox};
use crate::identity::{LookupTag, NodeIdentity, RingHandle, TagGenerator};
use crate::ledger::{Branch, LedgerStats, LookupState, Resolution};
use crate::messages::{Find, Found, Message, NotFound, OpCode, TableValue, MAX_DATAGRAM_SIZE};
use crate::protocols::{RingPolicy, TableStore};
use crate::transport::{Transport, TransportError, DEFAULT_SEND_TIMEOUT};

/// Hop budget of a seed FIND.
pub const DEFAULT_TTL: u32 = 5;

/// Replication quota of a seed FIND.
pub const DEFAULT_MRR: i32 = 3;

/// Time a lookup may take before it resolves `TimedOut`.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the ledger sweep (expired lookups, stale tags).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// One ring this node bridges: its handle and the address of its entry node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingConfig {
    pub handle: RingHandle,
    pub entry: SocketAddr,
}

impl FromStr for RingConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, addr) = s
            .split_once('=')
            .context("ring must be given as NAME=IP:PORT")?;
        if name.is_empty() {
            bail!("ring name must not be empty");
        }
        let entry: SocketAddr = addr.parse().context("invalid ring entry address")?;
        Ok(RingConfig {
            handle: RingHandle::new(name),
            entry,
        })
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub bind: SocketAddr,
    /// Exactly two rings.
    pub rings: Vec<RingConfig>,
    pub ttl: u32,
    pub mrr: i32,
    pub lookup_timeout: Duration,
    pub sweep_interval: Duration,
    pub send_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            rings: Vec::new(),
            ttl: DEFAULT_TTL,
            mrr: DEFAULT_MRR,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            engine: EngineConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn with_rings(mut self, first: RingConfig, second: RingConfig) -> Self {
        self.rings = vec![first, second];
        self
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.rings.len() == 2,
            "a bridge needs exactly two rings, got {}",
            self.rings.len()
        );
        ensure!(
            self.rings[0].handle != self.rings[1].handle,
            "both rings are named {}",
            self.rings[0].handle
        );
        ensure!(self.ttl > 0, "ttl must be at least 1");
        ensure!(!self.sweep_interval.is_zero(), "sweep interval must be non-zero");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundRecord {
    /// Ring peer reported responsible.
    pub net: RingHandle,
    /// Node that reported it.
    pub source: SocketAddr,
    /// Stored value for GET; the written value for PUT.
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(FoundRecord),
    NotFound,
    TimedOut,
}

/// Pending result of [`BridgeNode::lookup`].
#[derive(Debug)]
pub struct LookupHandle {
    tag: LookupTag,
    outcome: oneshot::Receiver<LookupOutcome>,
}

impl LookupHandle {
    pub fn tag(&self) -> LookupTag {
        self.tag
    }

    pub async fn wait(self) -> Result<LookupOutcome> {
        let tag = self.tag;
        self.outcome
            .await
            .map_err(|_| anyhow!("bridge stopped before lookup {tag} completed"))
    }
}

// ============================================================================
// Lookup state machine
// ============================================================================

type Completion = (LookupTag, LookupOutcome);

/// Synchronous core of the bridge: the engine plus the per-lookup state
/// machine. Owned by the actor.
struct Bridge<P: RingPolicy, S: TableStore> {
    engine: Engine<P, S>,
    tags: TagGenerator,
    ttl: u32,
    mrr: i32,
    lookup_timeout: Duration,
}

impl<P: RingPolicy, S: TableStore> Bridge<P, S> {
    fn new(engine: Engine<P, S>, ttl: u32, mrr: i32, lookup_timeout: Duration) -> Self {
        let tags = TagGenerator::new(engine.identity().addr());
        Self {
            engine,
            tags,
            ttl,
            mrr,
            lookup_timeout,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.engine.identity().addr()
    }

    fn is_local(&self, tag: &LookupTag) -> bool {
        tag.origin == self.addr()
    }

    /// Returns the new tag and whatever completed while seeding it: the
    /// lookup itself when nothing could be flooded, and older lookups pushed
    /// out of the ledger to make room.
    fn lookup(
        &mut self,
        code: OpCode,
        key: String,
        value: Option<Vec<u8>>,
        outbox: &mut Outbox,
        now: Instant,
    ) -> (LookupTag, Vec<Completion>) {
        let tag = self.tags.next_tag();
        let find = Find {
            code,
            ttl: self.ttl,
            mrr: self.mrr,
            tag,
            key,
            value,
            reply_to: self.addr(),
        };
        info!(tag = %tag, code = %code, key = %find.key, "lookup started");

        let report = self
            .engine
            .originate(find, now + self.lookup_timeout, outbox, now);
        let mut done = Vec::new();
        if report.is_dead_end() {
            debug!(tag = %tag, "no peer accepted the lookup");
            self.engine.ledger_mut().remove_state(&tag);
            done.push((tag, LookupOutcome::NotFound));
        }
        done.extend(self.take_evicted());
        (tag, done)
    }

    fn dispatch(
        &mut self,
        message: Message,
        from: SocketAddr,
        outbox: &mut Outbox,
        now: Instant,
    ) -> Vec<Completion> {
        trace!(from = %from, kind = message.kind(), "dispatch");
        self.engine.ledger_mut().touch(from, now);

        let mut done = Vec::new();
        match message {
            Message::Find(find) => {
                self.engine.handle_find(find, outbox, now);
            }
            Message::Found(found) => self.on_found(found, outbox, &mut done),
            Message::NotFound(not_found) => {
                self.on_not_found(not_found, from, outbox, now, &mut done)
            }
            Message::Join { net, source } => {
                self.engine.handle_join(net, source, now);
            }
            Message::Invite { net, source } => {
                self.engine.handle_invite(net, source, outbox);
            }
            Message::ReadTable(request) => self.engine.handle_read_table(request, outbox),
            Message::WriteTable(request) => {
                self.engine.handle_write_table(request);
            }
            Message::TableValue(reply) => self.on_table_value(reply, &mut done),
        }
        done.extend(self.take_evicted());
        done
    }

    fn on_found(&mut self, found: Found, outbox: &mut Outbox, done: &mut Vec<Completion>) {
        if !self.is_local(&found.tag) {
            debug!(tag = %found.tag, "FOUND for a lookup we did not start");
            return;
        }
        let tag = self.engine.ledger().primary_tag(&found.tag);
        let Some(state) = self.engine.ledger_mut().state_mut(&tag) else {
            debug!(tag = %found.tag, "FOUND for unknown or finished lookup");
            return;
        };
        let first = state.resolved.is_none();
        if first {
            state.resolved = Some(Resolution {
                net: found.net.clone(),
                source: found.source,
            });
        }
        let code = state.code;
        let value = state.value.clone();

        match code {
            OpCode::Get if !first => {
                debug!(tag = %found.tag, net = %found.net, "GET already resolved, FOUND ignored");
            }
            OpCode::Get => {
                info!(tag = %found.tag, net = %found.net, source = %found.source, "key located");
                self.engine.handle_found(&found, outbox);
            }
            OpCode::Put => {
                self.engine.handle_found(&found, outbox);
                if first {
                    info!(tag = %found.tag, net = %found.net, source = %found.source, "key located");
                    done.push((
                        tag,
                        LookupOutcome::Found(FoundRecord {
                            net: found.net,
                            source: found.source,
                            value,
                        }),
                    ));
                }
            }
        }
    }

    fn on_table_value(&mut self, reply: TableValue, done: &mut Vec<Completion>) {
        let tag = self.engine.ledger().primary_tag(&reply.tag);
        let resolution = self
            .engine
            .ledger()
            .state(&tag)
            .filter(|state| state.code == OpCode::Get)
            .and_then(|state| state.resolved.clone());
        let Some(resolution) = resolution else {
            debug!(tag = %reply.tag, "TABLE_VALUE for unknown lookup");
            return;
        };
        self.engine.ledger_mut().remove_state(&tag);
        done.push((
            tag,
            LookupOutcome::Found(FoundRecord {
                net: resolution.net,
                source: resolution.source,
                value: reply.value,
            }),
        ));
    }

    fn on_not_found(
        &mut self,
        not_found: NotFound,
        from: SocketAddr,
        outbox: &mut Outbox,
        now: Instant,
        done: &mut Vec<Completion>,
    ) {
        if !self.is_local(&not_found.tag) {
            debug!(tag = %not_found.tag, "NOT_FOUND for a lookup we did not start");
            return;
        }
        let tag = self.engine.ledger().primary_tag(&not_found.tag);
        let Some(state) = self.engine.ledger().state(&tag) else {
            debug!(tag = %tag, "NOT_FOUND for unknown or finished lookup");
            return;
        };
        if state.resolved.is_some() {
            trace!(tag = %tag, "NOT_FOUND after resolution ignored");
            return;
        }
        let Some(exhausted) = self.attribute(state, &not_found.key, from) else {
            debug!(tag = %tag, from = %from, "NOT_FOUND not attributable to a live branch");
            return;
        };
        let handover = state.flooding_branch_except(&exhausted);
        debug!(tag = %tag, net = %exhausted, ttl = not_found.ttl, mrr = not_found.mrr, "branch exhausted");

        // The other ring already saw the seed tag, so the hand-over travels
        // under a fresh one.
        let mut forwarded = None;
        if let Some(other) = handover {
            let alias = self.tags.next_tag();
            if self.engine.forward_into(&not_found, &other, alias, outbox, now) {
                self.engine.ledger_mut().add_alias(alias, tag);
                forwarded = Some(other);
            }
        }

        let Some(state) = self.engine.ledger_mut().state_mut(&tag) else {
            return;
        };
        state.branches.insert(exhausted, Branch::Exhausted);
        if let Some(other) = forwarded {
            state.branches.insert(other, Branch::Forwarded);
        }
        if state.all_exhausted() {
            info!(tag = %tag, "every branch exhausted");
            self.engine.ledger_mut().remove_state(&tag);
            done.push((tag, LookupOutcome::NotFound));
        }
    }

    /// The live branch whose entry (or next hop) sits at `from`.
    fn attribute(&self, state: &LookupState, key: &str, from: SocketAddr) -> Option<RingHandle> {
        let ledger = self.engine.ledger();
        let policy = self.engine.policy();
        state
            .branches
            .iter()
            .filter(|(_, branch)| **branch != Branch::Exhausted)
            .map(|(net, _)| net)
            .find(|net| {
                ledger.address_of(net) == Some(from)
                    || ledger.address_of(&policy.next_hop(net, key)) == Some(from)
            })
            .cloned()
    }

    fn sweep(&mut self, now: Instant) -> Vec<Completion> {
        let expired = self.engine.ledger_mut().evict_expired(now);
        let mut done: Vec<Completion> = expired
            .into_iter()
            .filter(|(tag, _)| self.is_local(tag))
            .filter_map(|(tag, state)| expiry_outcome(state).map(|outcome| (tag, outcome)))
            .collect();
        done.extend(self.take_evicted());
        done
    }

    fn take_evicted(&mut self) -> Vec<Completion> {
        let origin = self.addr();
        self.engine
            .take_evicted()
            .into_iter()
            .filter(|(tag, _)| tag.origin == origin)
            .filter_map(|(tag, state)| expiry_outcome(state).map(|outcome| (tag, outcome)))
            .collect()
    }
}

/// Outcome of a lookup whose state ran out before it completed.
fn expiry_outcome(state: LookupState) -> Option<LookupOutcome> {
    match (state.resolved, state.code) {
        (None, _) => Some(LookupOutcome::TimedOut),
        (Some(resolution), OpCode::Get) => Some(LookupOutcome::Found(FoundRecord {
            net: resolution.net,
            source: resolution.source,
            value: None,
        })),
        // Completed on its first FOUND.
        (Some(_), OpCode::Put) => None,
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Inbound(Message, SocketAddr),
    Lookup {
        code: OpCode,
        key: String,
        value: Option<Vec<u8>>,
        outcome: oneshot::Sender<LookupOutcome>,
        reply: oneshot::Sender<LookupTag>,
    },
    AddRing(RingHandle, SocketAddr, oneshot::Sender<()>),
    Invite(RingHandle, SocketAddr, oneshot::Sender<()>),
    Peers(oneshot::Sender<Vec<(RingHandle, SocketAddr)>>),
    Stats(oneshot::Sender<LedgerStats>),
}

struct BridgeActor<P: RingPolicy, S: TableStore> {
    bridge: Bridge<P, S>,
    transport: Transport,
    waiters: HashMap<LookupTag, oneshot::Sender<LookupOutcome>>,
    cmd_rx: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    sweep_interval: Duration,
}

impl<P: RingPolicy, S: TableStore> BridgeActor<P, S> {
    async fn run(mut self, initial: Outbox) {
        self.flush(initial).await;

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                // Commands still queued at shutdown are dropped unhandled.
                _ = self.shutdown.changed() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    let done = self.bridge.sweep(Instant::now());
                    self.complete(done);
                }
            }
        }

        debug!(pending = self.waiters.len(), "bridge actor stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn handle_command(&mut self, cmd: Command) {
        let mut outbox = Outbox::default();
        let now = Instant::now();

        match cmd {
            Command::Inbound(message, from) => {
                let done = self.bridge.dispatch(message, from, &mut outbox, now);
                self.complete(done);
            }
            Command::Lookup {
                code,
                key,
                value,
                outcome,
                reply,
            } => {
                let (tag, done) = self.bridge.lookup(code, key, value, &mut outbox, now);
                self.waiters.insert(tag, outcome);
                self.complete(done);
                let _ = reply.send(tag);
            }
            Command::AddRing(handle, entry, reply) => {
                info!(net = %handle, addr = %entry, "ring added");
                self.bridge
                    .engine
                    .ledger_mut()
                    .configure_peer(handle.clone(), entry, now);
                outbox.send(
                    entry,
                    Message::Join {
                        net: handle,
                        source: self.bridge.addr(),
                    },
                );
                let _ = reply.send(());
            }
            Command::Invite(net, to, reply) => {
                outbox.send(
                    to,
                    Message::Invite {
                        net,
                        source: self.bridge.addr(),
                    },
                );
                let _ = reply.send(());
            }
            Command::Peers(reply) => {
                let peers = self
                    .bridge
                    .engine
                    .ledger()
                    .peer_entries()
                    .into_iter()
                    .map(|(net, entry)| (net, entry.addr))
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.bridge.engine.ledger().stats());
            }
        }

        self.flush(outbox).await;
    }

    /// Send everything queued, dispatching messages to ourselves in process.
    async fn flush(&mut self, mut outbox: Outbox) {
        let local = self.bridge.addr();
        while let Some((to, message)) = outbox.pop() {
            if self.stopping() {
                trace!(queued = outbox.len() + 1, "stopping, outbox discarded");
                return;
            }
            if to == local {
                let done = self
                    .bridge
                    .dispatch(message, local, &mut outbox, Instant::now());
                self.complete(done);
                continue;
            }
            if let Err(e) = self.transport.send(&message, to).await {
                warn!(to = %to, kind = message.kind(), error = %e, "send failed, message dropped");
            }
        }
    }

    fn complete(&mut self, done: Vec<Completion>) {
        for (tag, outcome) in done {
            debug!(tag = %tag, outcome = ?outcome, "lookup complete");
            if let Some(waiter) = self.waiters.remove(&tag) {
                let _ = waiter.send(outcome);
            }
        }
    }
}

async fn receive_loop(
    transport: Transport,
    cmd_tx: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = transport.recv(&mut buf) => received,
        };
        match received {
            Ok((message, from)) => {
                if cmd_tx.send(Command::Inbound(message, from)).await.is_err() {
                    break;
                }
            }
            Err(TransportError::Decode { from, head, source }) => {
                warn!(from = %from, head = %hex::encode(&head), error = %source, "dropping undecodable datagram");
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "receive loop stopped");
                break;
            }
            Err(e) => warn!(error = %e, "receive failed"),
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

type TakeOnce<T> = tokio::sync::Mutex<Option<T>>;

struct Tasks {
    actor: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// Handle to a running bridge. Cheap to clone.
#[derive(Clone)]
pub struct BridgeNode {
    cmd_tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<TakeOnce<Tasks>>,
}

impl BridgeNode {
    /// Bind the socket, install both rings, and send JOIN to each entry node.
    pub async fn start<P: RingPolicy, S: TableStore>(
        config: BridgeConfig,
        policy: Arc<P>,
        store: S,
    ) -> Result<Self> {
        config.validate()?;

        let transport = Transport::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.bind))?
            .with_send_timeout(config.send_timeout);
        let local_addr = transport
            .local_addr()
            .context("failed to get local address")?;
        if local_addr.ip().is_unspecified() {
            warn!(addr = %local_addr, "bound to an unspecified address, replies will not route back");
        }

        let mut engine = Engine::new(
            NodeIdentity::new(local_addr),
            policy,
            store,
            config.engine.clone(),
        );
        let now = Instant::now();
        let mut joins = Outbox::default();
        for ring in &config.rings {
            engine
                .ledger_mut()
                .configure_peer(ring.handle.clone(), ring.entry, now);
            joins.send(
                ring.entry,
                Message::Join {
                    net: ring.handle.clone(),
                    source: local_addr,
                },
            );
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let actor = BridgeActor {
            bridge: Bridge::new(engine, config.ttl, config.mrr, config.lookup_timeout),
            transport: transport.clone(),
            waiters: HashMap::new(),
            cmd_rx,
            shutdown: shutdown_rx.clone(),
            sweep_interval: config.sweep_interval,
        };
        let actor = tokio::spawn(actor.run(joins));
        let receiver = tokio::spawn(receive_loop(transport, cmd_tx.clone(), shutdown_rx));

        let rings: Vec<String> = config.rings.iter().map(|r| r.handle.to_string()).collect();
        info!(addr = %local_addr, rings = ?rings, "bridge started");

        Ok(Self {
            cmd_tx,
            local_addr,
            shutdown: Arc::new(shutdown_tx),
            tasks: Arc::new(tokio::sync::Mutex::new(Some(Tasks { actor, receiver }))),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn lookup(
        &self,
        code: OpCode,
        key: impl Into<String>,
        value: Option<Vec<u8>>,
    ) -> Result<LookupHandle> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Lookup {
                code,
                key: key.into(),
                value,
                outcome: outcome_tx,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("bridge actor closed"))?;
        let tag = rx.await.map_err(|_| anyhow!("bridge actor closed"))?;
        Ok(LookupHandle {
            tag,
            outcome: outcome_rx,
        })
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<LookupOutcome> {
        self.lookup(OpCode::Get, key, None).await?.wait().await
    }

    pub async fn put(&self, key: impl Into<String>, value: Vec<u8>) -> Result<LookupOutcome> {
        self.lookup(OpCode::Put, key, Some(value)).await?.wait().await
    }

    /// Configure another ring entry point and JOIN it.
    pub async fn add_ring(&self, handle: RingHandle, entry: SocketAddr) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddRing(handle, entry, tx))
            .await
            .map_err(|_| anyhow!("bridge actor closed"))?;
        rx.await.map_err(|_| anyhow!("bridge actor closed"))
    }

    /// Propose to `to` that it joins `net` through this node.
    pub async fn invite(&self, net: RingHandle, to: SocketAddr) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Invite(net, to, tx))
            .await
            .map_err(|_| anyhow!("bridge actor closed"))?;
        rx.await.map_err(|_| anyhow!("bridge actor closed"))
    }

    /// Peer-table snapshot, sorted by ring handle.
    pub async fn peers(&self) -> Result<Vec<(RingHandle, SocketAddr)>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Peers(tx))
            .await
            .map_err(|_| anyhow!("bridge actor closed"))?;
        rx.await.map_err(|_| anyhow!("bridge actor closed"))
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stats(tx))
            .await
            .map_err(|_| anyhow!("bridge actor closed"))?;
        rx.await.map_err(|_| anyhow!("bridge actor closed"))
    }

    /// Stop the receive loop and the actor, and wait for both to exit.
    ///
    /// Once this returns the socket is closed, pending lookups have failed,
    /// and commands that were still queued are dropped. Calling it again is
    /// a no-op.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        if let Err(e) = tasks.receiver.await {
            warn!(error = %e, "receive loop ended abnormally");
        }
        if let Err(e) = tasks.actor.await {
            warn!(error = %e, "bridge actor ended abnormally");
        }
        info!(addr = %self.local_addr, "bridge stopped");
    }
}

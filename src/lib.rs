//! # Synapse - Bridging Overlay Node
//!
//! Synapse joins two independent peer rings through one node and answers
//! key lookups by flooding both of them:
//!
//! - **Flood search**: FIND travels with a hop budget (TTL) and a replication
//!   quota (MRR); every node processes a given lookup tag at most once
//! - **Bridging**: a ring that runs dry hands its remaining budget to the other
//! - **Admission**: JOIN/INVITE, gated by the ring policy
//! - **Replication**: PUT lookups write to every responsible peer the quota allows
//!
//! ## Architecture
//!
//! The protocol engine is synchronous and I/O free. A bridge actor owns it,
//! feeds it inbound datagrams, and drains its outbox onto a UDP socket:
//! - [`BridgeNode`] is the public handle; it talks to the actor over channels
//! - the actor owns all mutable state and processes commands one at a time
//! - ring algorithms stay behind the [`RingPolicy`] trait
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `bridge` | Bridge actor, lookup state machine, public handle |
//! | `engine` | FIND/FOUND/JOIN/INVITE/table handlers and the outbox |
//! | `ledger` | Processed tags, peer table, lookup states |
//! | `identity` | Node identity, ring handles, lookup tags |
//! | `messages` | Wire messages and the datagram codec |
//! | `transport` | UDP transport |
//! | `protocols` | Collaborator traits (RingPolicy, TableStore) |
//! | `policy` | Table-driven RingPolicy |
//! | `store` | LRU-bounded in-memory TableStore |

mod bridge;
mod engine;
mod identity;
mod ledger;
mod messages;
mod policy;
mod protocols;
mod store;
mod transport;

pub use bridge::{
    BridgeConfig, BridgeNode, FoundRecord, LookupHandle, LookupOutcome, RingConfig,
    DEFAULT_LOOKUP_TIMEOUT, DEFAULT_MRR, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL,
};
pub use engine::{
    Engine, EngineConfig, FindDisposition, FloodReport, Outbox, DEFAULT_STATE_LIFETIME,
};
pub use identity::{LookupTag, NodeIdentity, RingHandle, TagGenerator};
pub use ledger::{
    Branch, InsertOutcome, Ledger, LedgerStats, LookupState, PeerEntry, Resolution,
    DEFAULT_MAX_LOOKUP_STATES, DEFAULT_MAX_PROCESSED_TAGS, DEFAULT_TAG_RETENTION,
};
pub use messages::{
    decode, encode, DecodeError, Find, Found, Message, NotFound, OpCode, ReadTable, TableValue,
    WriteTable, MAX_DATAGRAM_SIZE, WIRE_MAGIC, WIRE_VERSION,
};
pub use policy::StaticPolicy;
pub use protocols::{split_evenly, RingPolicy, TableStore, DEFAULT_MAX_PEERS};
pub use store::{MemoryStore, DEFAULT_STORE_CAPACITY, MAX_STORED_VALUE_SIZE};
pub use transport::{Transport, TransportError, DEFAULT_SEND_TIMEOUT};

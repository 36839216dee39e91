//! # Identifiers
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`NodeIdentity`] | Transport address of this process |
//! | [`RingHandle`] | Opaque name of a peer network segment |
//! | [`LookupTag`] | Unique identifier of one logical lookup |
//!
//! Tags are `(origin, wall-clock millis, sequence)`. The millisecond component
//! only aids debugging; uniqueness comes from the per-origin sequence counter
//! held by [`TagGenerator`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Address identifying this process on every ring it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeIdentity(SocketAddr);

impl NodeIdentity {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for NodeIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

/// Opaque reference to a peer network segment.
///
/// The protocol engine never interprets the name; it is a peer-table key and
/// an argument to [`RingPolicy`](crate::protocols::RingPolicy) calls.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RingHandle(String);

impl RingHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RingHandle {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Identifier of one logical lookup, shared by every FIND it spawns within a
/// ring. A hand-over into another ring gets a fresh tag from the same origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LookupTag {
    pub origin: SocketAddr,
    pub timestamp_ms: u64,
    pub seq: u64,
}

impl fmt::Display for LookupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.origin, self.timestamp_ms, self.seq)
    }
}

/// Mints tags for a single origin.
#[derive(Debug)]
pub struct TagGenerator {
    origin: SocketAddr,
    next_seq: AtomicU64,
}

impl TagGenerator {
    pub fn new(origin: SocketAddr) -> Self {
        Self {
            origin,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn origin(&self) -> SocketAddr {
        self.origin
    }

    pub fn next_tag(&self) -> LookupTag {
        LookupTag {
            origin: self.origin,
            timestamp_ms: now_ms(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}

//! # Wire Protocol Messages
//!
//! Every datagram carries exactly one [`Message`]:
//!
//! ```text
//! magic "SYNP" (4) || version (1) || bincode(Message)
//! ```
//!
//! The body uses bincode with fixint encoding and a size limit, so a hostile
//! length prefix cannot force a large allocation.
//!
//! | Type | Fields | Meaning |
//! |------|--------|---------|
//! | FIND | code, ttl, mrr, tag, key, value, reply_to | flood-search request |
//! | FOUND | code, net, mrr, key, value, tag, source | key located at `net` |
//! | NOT_FOUND | code, ttl, mrr, tag, key, value | branch ended without a match |
//! | JOIN | net, source | admission request |
//! | INVITE | net, source | unsolicited merge proposal |
//! | READ_TABLE | net, key, tag, source | fetch a stored value |
//! | WRITE_TABLE | net, key, value, tag, source | persist a value |
//! | TABLE_VALUE | net, key, value, tag | reply to READ_TABLE |

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{LookupTag, RingHandle};

/// Magic bytes identifying synapse datagrams.
pub const WIRE_MAGIC: [u8; 4] = *b"SYNP";

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Size of the datagram header: magic(4) + version(1).
pub const HEADER_SIZE: usize = 5;

/// Largest datagram we will send or accept (UDP payload limit).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Number of [`Message`] variants; bincode encodes the variant as a u32 index.
const MESSAGE_TYPE_COUNT: u32 = 8;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .with_fixint_encoding()
}

/// Operation carried by a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Get,
    Put,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Get => f.write_str("GET"),
            OpCode::Put => f.write_str("PUT"),
        }
    }
}

impl FromStr for OpCode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(OpCode::Get),
            "PUT" => Ok(OpCode::Put),
            other => anyhow::bail!("unknown op code {other:?} (expected GET or PUT)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Find {
    pub code: OpCode,
    pub ttl: u32,
    pub mrr: i32,
    pub tag: LookupTag,
    pub key: String,
    pub value: Option<Vec<u8>>,
    /// Where FOUND and NOT_FOUND for this lookup are sent.
    pub reply_to: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Found {
    pub code: OpCode,
    pub net: RingHandle,
    pub mrr: i32,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub tag: LookupTag,
    /// Node that knows `net`; READ_TABLE/WRITE_TABLE go here.
    pub source: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotFound {
    pub code: OpCode,
    /// Budget left at the node that gave up.
    pub ttl: u32,
    pub mrr: i32,
    pub tag: LookupTag,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadTable {
    pub net: RingHandle,
    pub key: String,
    pub tag: LookupTag,
    pub source: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTable {
    pub net: RingHandle,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub tag: LookupTag,
    pub source: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableValue {
    pub net: RingHandle,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub tag: LookupTag,
}

/// Variant order is part of the wire format; append only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Find(Find),
    Found(Found),
    NotFound(NotFound),
    Join { net: RingHandle, source: SocketAddr },
    Invite { net: RingHandle, source: SocketAddr },
    ReadTable(ReadTable),
    WriteTable(WriteTable),
    TableValue(TableValue),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Find(_) => "FIND",
            Message::Found(_) => "FOUND",
            Message::NotFound(_) => "NOT_FOUND",
            Message::Join { .. } => "JOIN",
            Message::Invite { .. } => "INVITE",
            Message::ReadTable(_) => "READ_TABLE",
            Message::WriteTable(_) => "WRITE_TABLE",
            Message::TableValue(_) => "TABLE_VALUE",
        }
    }

    /// Lookup tag, for message types that belong to a lookup.
    pub fn tag(&self) -> Option<&LookupTag> {
        match self {
            Message::Find(m) => Some(&m.tag),
            Message::Found(m) => Some(&m.tag),
            Message::NotFound(m) => Some(&m.tag),
            Message::ReadTable(m) => Some(&m.tag),
            Message::WriteTable(m) => Some(&m.tag),
            Message::TableValue(m) => Some(&m.tag),
            Message::Join { .. } | Message::Invite { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("datagram too short ({len} bytes)")]
    Truncated { len: usize },
    #[error("datagram too large ({len} bytes)")]
    Oversized { len: usize },
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("malformed message body: {0}")]
    Malformed(#[source] bincode::Error),
}

pub fn encode(message: &Message) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode_options().serialize(message)?;
    let mut datagram = Vec::with_capacity(HEADER_SIZE + body.len());
    datagram.extend_from_slice(&WIRE_MAGIC);
    datagram.push(WIRE_VERSION);
    datagram.extend_from_slice(&body);
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(Box::new(bincode::ErrorKind::SizeLimit));
    }
    Ok(datagram)
}

pub fn decode(datagram: &[u8]) -> Result<Message, DecodeError> {
    if datagram.len() > MAX_DATAGRAM_SIZE {
        return Err(DecodeError::Oversized { len: datagram.len() });
    }
    if datagram.len() < HEADER_SIZE + 4 {
        return Err(DecodeError::Truncated { len: datagram.len() });
    }
    if datagram[0..4] != WIRE_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    if datagram[4] != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(datagram[4]));
    }

    let body = &datagram[HEADER_SIZE..];
    let mut index = [0u8; 4];
    index.copy_from_slice(&body[..4]);
    let variant = u32::from_le_bytes(index);
    if variant >= MESSAGE_TYPE_COUNT {
        return Err(DecodeError::UnknownMessageType(variant));
    }

    bincode_options()
        .deserialize(body)
        .map_err(DecodeError::Malformed)
}

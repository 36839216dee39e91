//! # Datagram Transport
//!
//! One UDP socket carries every message. Each [`Message`] is sent as a single
//! datagram. There are no acknowledgements and no retries: a lost datagram
//! shows up as a lookup that times out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::messages::{self, DecodeError, Message, MAX_DATAGRAM_SIZE};

/// Default bound on a single `send_to`.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("send to {to} timed out")]
    SendTimeout { to: SocketAddr },
    #[error("undecodable datagram from {from}: {source}")]
    Decode {
        from: SocketAddr,
        /// Leading bytes of the datagram, for logging.
        head: Vec<u8>,
        #[source]
        source: DecodeError,
    },
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
}

impl TransportError {
    /// Whether the socket itself failed. Anything else only affects one datagram.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Io(_))
    }
}

/// Cheap to clone; clones share the socket.
#[derive(Clone, Debug)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    send_timeout: Duration,
}

impl Transport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        })
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let datagram = messages::encode(message).map_err(|source| TransportError::Encode {
            kind: message.kind(),
            source,
        })?;
        match tokio::time::timeout(self.send_timeout, self.socket.send_to(&datagram, to)).await {
            Ok(result) => {
                result?;
                trace!(to = %to, kind = message.kind(), len = datagram.len(), "sent");
                Ok(())
            }
            Err(_) => Err(TransportError::SendTimeout { to }),
        }
    }

    /// Wait for the next datagram and decode it.
    ///
    /// `buf` is scratch space reused across calls; anything shorter than
    /// [`MAX_DATAGRAM_SIZE`] truncates large datagrams.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(Message, SocketAddr), TransportError> {
        let (len, from) = self.socket.recv_from(buf).await?;
        let datagram = &buf[..len];
        match messages::decode(datagram) {
            Ok(message) => {
                trace!(from = %from, kind = message.kind(), len, "received");
                Ok((message, from))
            }
            Err(source) => Err(TransportError::Decode {
                from,
                head: datagram[..len.min(16)].to_vec(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RingHandle;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn scratch() -> Vec<u8> {
        vec![0u8; MAX_DATAGRAM_SIZE]
    }

    #[tokio::test]
    async fn send_and_receive_roundtrip() {
        let a = Transport::bind(loopback()).await.unwrap();
        let b = Transport::bind(loopback()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let join = Message::Join {
            net: RingHandle::new("ring-a"),
            source: a.local_addr().unwrap(),
        };
        a.send(&join, b_addr).await.unwrap();

        let mut buf = scratch();
        let (received, from) = tokio::time::timeout(Duration::from_secs(2), b.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, join);
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let raw = UdpSocket::bind(loopback()).await.unwrap();
        let t = Transport::bind(loopback()).await.unwrap();
        raw.send_to(b"definitely not a message", t.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = scratch();
        let err = tokio::time::timeout(Duration::from_secs(2), t.recv(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert!(!err.is_fatal());
        match err {
            TransportError::Decode { from, head, source } => {
                assert_eq!(from, raw.local_addr().unwrap());
                assert_eq!(head.len(), 16);
                assert!(matches!(source, DecodeError::BadMagic));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn recv_continues_after_bad_datagram() {
        let raw = UdpSocket::bind(loopback()).await.unwrap();
        let t = Transport::bind(loopback()).await.unwrap();
        let to = t.local_addr().unwrap();

        raw.send_to(b"SYNP", to).await.unwrap();
        let invite = Message::Invite {
            net: RingHandle::new("ring-b"),
            source: raw.local_addr().unwrap(),
        };
        raw.send_to(&messages::encode(&invite).unwrap(), to).await.unwrap();

        let mut buf = scratch();
        assert!(t.recv(&mut buf).await.is_err());
        let (message, _) = t.recv(&mut buf).await.unwrap();
        assert_eq!(message, invite);
    }

    #[tokio::test]
    async fn scratch_buffer_is_reused_across_datagrams() {
        let a = Transport::bind(loopback()).await.unwrap();
        let b = Transport::bind(loopback()).await.unwrap();
        let to = b.local_addr().unwrap();

        let long = Message::TableValue(crate::messages::TableValue {
            net: RingHandle::new("ring-a"),
            key: "k".to_string(),
            value: Some(vec![0xAB; 4096]),
            tag: crate::identity::LookupTag {
                origin: a.local_addr().unwrap(),
                timestamp_ms: 1,
                seq: 1,
            },
        });
        let short = Message::Join {
            net: RingHandle::new("ring-a"),
            source: a.local_addr().unwrap(),
        };
        a.send(&long, to).await.unwrap();
        a.send(&short, to).await.unwrap();

        let mut buf = scratch();
        let (first, _) = b.recv(&mut buf).await.unwrap();
        let (second, _) = b.recv(&mut buf).await.unwrap();
        assert_eq!(first, long);
        assert_eq!(second, short);
        assert_eq!(buf.len(), MAX_DATAGRAM_SIZE);
    }
}

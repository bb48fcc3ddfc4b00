//! # Endpoints
//!
//! Sockets with SOME/IP framing on top. Server endpoints accept traffic for
//! locally offered services; client endpoints carry traffic to one remote
//! provider.
//!
//! Endpoints never own their host: they hold a `Weak` back-reference to the
//! [`EndpointHost`] (the routing manager) and no-op once it is gone. The
//! routing manager owns endpoints strongly through its tables, which breaks
//! the cycle between router, endpoint, and discovery collaborator.
//!
//! | Type | Transport | Role |
//! |------|-----------|------|
//! | [`UdpServerEndpoint`] | UDP | Datagram framing, multicast membership, reply routing |
//! | [`TcpServerEndpoint`] | TCP | Accept loop, per-connection stream framing |
//! | [`UdpClientEndpoint`] | UDP | Unicast lane to one remote provider |
//! | [`TcpClientEndpoint`] | TCP | Connection to one remote provider, reconnect on demand |

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::wire;

mod tcp_client;
mod tcp_server;
mod udp_client;
mod udp_server;

pub use tcp_client::TcpClientEndpoint;
pub use tcp_server::TcpServerEndpoint;
pub use udp_client::UdpClientEndpoint;
pub use udp_server::UdpServerEndpoint;

// ============================================================================
// ENDPOINT DEFINITION
// ============================================================================

/// Immutable identification of a remote socket: address, port and whether
/// the transport is reliable (TCP). Equality, ordering and hashing cover
/// all three fields so the definition can key any routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointDefinition {
    pub address: IpAddr,
    pub port: u16,
    pub reliable: bool,
}

impl EndpointDefinition {
    pub fn new(address: IpAddr, port: u16, reliable: bool) -> Self {
        Self {
            address,
            port,
            reliable,
        }
    }

    /// The remote socket address this definition names.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<(SocketAddr, bool)> for EndpointDefinition {
    fn from((addr, reliable): (SocketAddr, bool)) -> Self {
        Self::new(addr.ip(), addr.port(), reliable)
    }
}

/// A subscriber to an eventgroup: where to notify, and until when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub endpoint: EndpointDefinition,
    pub expiration: Instant,
}

// ============================================================================
// ENDPOINT IDENTITY AND HOST
// ============================================================================

/// Process-unique endpoint token. Stands in for an endpoint reference in
/// the routing tables that need to know which endpoint delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(u64);

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

impl EndpointId {
    /// Allocate a fresh endpoint id.
    pub fn next() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a received datagram was addressed to. Multicast deliveries carry
/// the group so the router can demux eventgroup notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(SocketAddr),
    Multicast(SocketAddr),
}

impl Destination {
    pub fn is_multicast(&self) -> bool {
        matches!(self, Self::Multicast(_))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            Self::Unicast(addr) | Self::Multicast(addr) => *addr,
        }
    }
}

/// Capability set an endpoint needs from its host. The routing manager
/// implements this; endpoints hold it weakly.
pub trait EndpointHost: Send + Sync {
    /// A framed SOME/IP message arrived on `receiver`.
    fn on_message(&self, data: &[u8], receiver: EndpointId, destination: Destination);

    /// A malformed chunk arrived on `receiver` (bad length field).
    fn on_error(&self, data: &[u8], receiver: EndpointId);

    /// A client endpoint established its connection.
    fn on_connect(&self, receiver: EndpointId, reliable: bool);

    /// An endpoint lost its connection.
    fn on_disconnect(&self, receiver: EndpointId, reliable: bool);
}

// ============================================================================
// STREAM FRAMING
// ============================================================================

/// Why a TCP stream had to be abandoned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamFramingError {
    /// Length field below the minimum a header needs.
    LengthTooSmall(usize),
    /// Length field beyond the configured maximum message size.
    LengthTooLarge(usize),
}

/// Extract complete SOME/IP messages from a TCP accumulation buffer.
///
/// Magic cookie messages are recognized and skipped. Incomplete trailing
/// data stays in the buffer for the next read. A length field that can
/// never frame a valid message poisons the stream; callers drop the
/// connection on `Err`.
pub(crate) fn extract_stream_messages(
    buffer: &mut BytesMut,
    max_message_size: usize,
    mut deliver: impl FnMut(Bytes),
) -> Result<(), StreamFramingError> {
    loop {
        if buffer.len() < wire::LENGTH_PREFIX_SIZE {
            return Ok(());
        }
        let size = wire::get_message_size(buffer);
        if size < wire::Header::SIZE {
            return Err(StreamFramingError::LengthTooSmall(size));
        }
        if size > max_message_size {
            return Err(StreamFramingError::LengthTooLarge(size));
        }
        if buffer.len() < size {
            return Ok(());
        }
        let frame = buffer.split_to(size).freeze();
        if wire::is_magic_cookie(&frame) {
            continue;
        }
        deliver(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn put_message(buf: &mut BytesMut, service: u16, payload: &[u8]) {
        buf.put_u16(service);
        buf.put_u16(0x0001);
        buf.put_u32((8 + payload.len()) as u32);
        buf.put_u16(0x0001);
        buf.put_u16(0x0001);
        buf.put_u8(0x01);
        buf.put_u8(0x01);
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_slice(payload);
    }

    #[test]
    fn definition_equality_covers_all_fields() {
        let a = EndpointDefinition::new(IpAddr::from([192, 0, 2, 5]), 30491, false);
        let b = EndpointDefinition::new(IpAddr::from([192, 0, 2, 5]), 30491, true);
        let c = EndpointDefinition::new(IpAddr::from([192, 0, 2, 5]), 30492, false);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, EndpointDefinition::new(IpAddr::from([192, 0, 2, 5]), 30491, false));
    }

    #[test]
    fn stream_framing_splits_messages_and_keeps_partial() {
        let mut buffer = BytesMut::new();
        put_message(&mut buffer, 0x1234, &[0xAA; 8]);
        put_message(&mut buffer, 0x5678, &[0xBB; 16]);
        // Partial third message.
        buffer.put_slice(&[0x11, 0x22, 0x33]);

        let mut seen = Vec::new();
        extract_stream_messages(&mut buffer, 1400, |frame| seen.push(frame)).unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), 24);
        assert_eq!(seen[1].len(), 32);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn stream_framing_skips_magic_cookies() {
        let mut buffer = BytesMut::new();
        buffer.put_slice(&[
            0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01,
            0x01, 0x00,
        ]);
        put_message(&mut buffer, 0x1234, &[]);

        let mut seen = Vec::new();
        extract_stream_messages(&mut buffer, 1400, |frame| seen.push(frame)).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(wire::peek_service(&seen[0]), Some(0x1234));
    }

    #[test]
    fn stream_framing_rejects_poisoned_lengths() {
        let mut buffer = BytesMut::new();
        buffer.put_slice(&[0x12, 0x34, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(
            extract_stream_messages(&mut buffer, 1400, |_| {}),
            Err(StreamFramingError::LengthTooSmall(10))
        );

        let mut buffer = BytesMut::new();
        buffer.put_slice(&[0x12, 0x34, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            extract_stream_messages(&mut buffer, 1400, |_| {}),
            Err(StreamFramingError::LengthTooLarge(_))
        ));
    }
}

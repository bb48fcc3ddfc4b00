//! # Routing
//!
//! The routing manager and its supporting tables: service info, the
//! event/eventgroup registry, and the message envelope handed to
//! application handlers.

use bytes::{Bytes, BytesMut};

use crate::wire::{self, Header, MessageType};
use crate::{ClientId, InstanceId, MajorVersion, MethodId, ServiceId, SessionId};

mod manager;
mod registry;
mod service;

pub use manager::{RegistrationState, RoutingHost, RoutingManager, SubscriptionState};
pub use registry::{EventInfo, EventRegistry, EventgroupInfo};
pub use service::ServiceInfo;

// ============================================================================
// MESSAGE ENVELOPE
// ============================================================================

/// A SOME/IP message as seen by application handlers: the header fields,
/// the payload, and the routing context the wire does not carry (instance,
/// transport, initial-value flag).
#[derive(Debug, Clone)]
pub struct Message {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub method: MethodId,
    pub client: ClientId,
    pub session: SessionId,
    pub interface_version: MajorVersion,
    pub message_type: MessageType,
    pub return_code: u8,
    pub payload: Bytes,
    pub reliable: bool,
    /// True for the replayed cached value a field delivers to a new
    /// subscriber.
    pub initial: bool,
}

impl Message {
    /// Build a request envelope.
    pub fn request(service: ServiceId, instance: InstanceId, method: MethodId) -> Self {
        Self {
            service,
            instance,
            method,
            client: 0,
            session: 0,
            interface_version: crate::DEFAULT_MAJOR,
            message_type: MessageType::Request,
            return_code: 0,
            payload: Bytes::new(),
            reliable: false,
            initial: false,
        }
    }

    /// Build a notification envelope.
    pub fn notification(service: ServiceId, instance: InstanceId, event: MethodId) -> Self {
        Self {
            message_type: MessageType::Notification,
            ..Self::request(service, instance, event)
        }
    }

    /// Build the response envelope answering `request`.
    pub fn response_to(request: &Message) -> Self {
        Self {
            message_type: MessageType::Response,
            ..request.clone()
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Decode from a framed wire message.
    pub fn from_wire(data: &[u8], instance: InstanceId, reliable: bool) -> Option<Self> {
        let mut cursor = data;
        let header = Header::parse(&mut cursor)?;
        if cursor.len() < header.payload_length() {
            return None;
        }
        Some(Self {
            service: header.service_id,
            instance,
            method: header.method_id,
            client: header.client_id,
            session: header.session_id,
            interface_version: header.interface_version,
            message_type: header.message_type,
            return_code: header.return_code,
            payload: Bytes::copy_from_slice(&cursor[..header.payload_length()]),
            reliable,
            initial: false,
        })
    }

    /// Encode to wire bytes.
    pub fn to_wire(&self) -> Bytes {
        let header = Header {
            service_id: self.service,
            method_id: self.method,
            length: (Header::SIZE - wire::LENGTH_PREFIX_SIZE + self.payload.len()) as u32,
            client_id: self.client,
            session_id: self.session,
            protocol_version: wire::PROTOCOL_VERSION,
            interface_version: self.interface_version,
            message_type: self.message_type,
            return_code: self.return_code,
        };
        let mut buf = BytesMut::with_capacity(Header::SIZE + self.payload.len());
        header.serialize(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_round_trip() {
        let message = Message {
            client: 0x1234,
            session: 0x0001,
            interface_version: 2,
            payload: Bytes::from_static(&[1, 2, 3, 4]),
            ..Message::request(0x4711, 0x0001, 0x0042)
        };
        let wire = message.to_wire();
        assert_eq!(wire::get_message_size(&wire), wire.len());

        let decoded = Message::from_wire(&wire, 0x0001, false).unwrap();
        assert_eq!(decoded.service, message.service);
        assert_eq!(decoded.method, message.method);
        assert_eq!(decoded.client, message.client);
        assert_eq!(decoded.session, message.session);
        assert_eq!(decoded.payload, message.payload);
        assert_eq!(decoded.message_type, MessageType::Request);
    }
}
